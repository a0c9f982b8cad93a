//! burrow - on-device container engine CLI
//!
//! Operator front end over [`burrow::Engine`]: pulls images, creates and
//! removes containers, and manages registry mirrors.
//!
//! ## Usage
//!
//! ```sh
//! burrow pull alpine:latest
//! burrow images
//! burrow tags alpine --limit 20
//! burrow search nginx
//! burrow create alpine:latest --name c1 -e FOO=bar
//! burrow ps
//! burrow rm c1
//! burrow mirror add my-mirror https://mirror.example.com --priority 80
//! burrow check
//! ```
//!
//! `--root` and `--registry` fall back to `BURROW_ROOT` and
//! `BURROW_DEFAULT_REGISTRY`; log verbosity follows `RUST_LOG`.

use burrow::constants::{DEFAULT_SEARCH_PAGE_SIZE, DEFAULT_TAG_PAGE_SIZE};
use burrow::{ContainerConfig, Engine, EngineConfig, PullPolicy, PullState, RegistryHealth};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug, Parser)]
#[command(name = "burrow", version, about = "Rootless, daemonless container engine")]
struct Cli {
    /// Engine root directory (database, layer cache, rootfs trees)
    #[arg(long, global = true, env = "BURROW_ROOT")]
    root: Option<PathBuf>,

    /// Upstream registry used when no mirror is healthy
    #[arg(long, global = true, env = "BURROW_DEFAULT_REGISTRY")]
    registry: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Pull an image
    Pull {
        reference: String,
        /// Resolve against the registry even if the image is present
        #[arg(long)]
        always: bool,
        /// Probe every mirror before choosing one
        #[arg(long)]
        probe_mirrors: bool,
    },
    /// List images
    Images,
    /// Delete an image
    Rmi { image: String },
    /// List a repository's tags on the registry
    Tags {
        /// Repository, any tag is ignored
        image: String,
        #[arg(long, default_value_t = DEFAULT_TAG_PAGE_SIZE)]
        limit: u32,
        /// Start after this tag
        #[arg(long)]
        last: Option<String>,
    },
    /// Search Docker Hub repositories
    Search {
        query: String,
        #[arg(long, default_value_t = DEFAULT_SEARCH_PAGE_SIZE)]
        limit: u32,
    },
    /// Delete cached layer files no image references
    Prune,
    /// Create a container from a pulled image
    Create {
        /// Image id, id prefix or reference
        image: String,
        #[arg(long)]
        name: Option<String>,
        /// Environment variable, KEY=VALUE
        #[arg(short, long = "env")]
        env: Vec<String>,
        #[arg(short = 'w', long)]
        workdir: Option<String>,
        #[arg(short, long)]
        user: Option<String>,
        #[arg(long)]
        hostname: Option<String>,
        /// Command, overrides the image's
        #[arg(trailing_var_arg = true)]
        cmd: Vec<String>,
    },
    /// List containers
    Ps,
    /// Remove a container and its root filesystem
    Rm { container: String },
    /// List registries with their health
    Registries,
    /// Manage custom mirrors
    #[command(subcommand)]
    Mirror(MirrorCommand),
    /// Probe every registry now
    Check,
}

#[derive(Debug, Subcommand)]
enum MirrorCommand {
    /// Add a custom mirror
    Add {
        name: String,
        url: String,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        priority: Option<i32>,
    },
    /// Remove a custom mirror
    Rm { id: String },
}

// =============================================================================
// Commands
// =============================================================================

async fn cmd_pull(engine: &Engine, reference: &str, always: bool, probe_mirrors: bool) -> burrow::Result<()> {
    if probe_mirrors {
        engine.registries().check_all_and_wait().await;
    }

    let policy = if always { PullPolicy::Always } else { PullPolicy::IfMissing };
    let handle = engine.start_pull_with(reference, policy)?;
    let mut state = handle.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                for (step, fraction) in handle.progress().snapshot() {
                    if fraction < 1.0 {
                        println!("{:>20}  {:>5.1}%", short_id(&step), fraction * 100.0);
                    }
                }
            }
        }
        if state.borrow().is_terminal() {
            break;
        }
    }

    match handle.state() {
        PullState::Done { reference, image_id } => {
            println!("{reference}: {}", short_id(&image_id));
            Ok(())
        }
        PullState::Error { error, .. } => Err(burrow::Error::Shared(error)),
        PullState::Downloading { .. } => Err(burrow::Error::Internal("pull did not finish".to_string())),
    }
}

fn cmd_images(engine: &Engine) -> burrow::Result<()> {
    println!("{:<14} {:<40} {:<12} {:>12}  CREATED", "IMAGE ID", "REPOSITORY", "TAG", "SIZE");
    for image in engine.images().list()? {
        println!(
            "{:<14} {:<40} {:<12} {:>12}  {}",
            short_id(&image.id),
            image.repository,
            image.tag,
            human_size(image.size),
            image.created.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn cmd_rmi(engine: &Engine, image: &str) -> burrow::Result<()> {
    let record = engine.images().resolve(image)?;
    let removed = engine.images().delete(&record.id)?;
    println!("Deleted: {}", record.id);
    for layer in removed {
        println!("Deleted layer: {layer}");
    }
    Ok(())
}

async fn cmd_tags(engine: &Engine, image: &str, limit: u32, last: Option<String>) -> burrow::Result<()> {
    let page = engine.list_tags(image, limit, last.as_deref()).await?;
    for tag in &page.tags {
        println!("{tag}");
    }
    if let Some(next) = page.next {
        eprintln!("more tags: --last {next}");
    }
    Ok(())
}

async fn cmd_search(engine: &Engine, query: &str, limit: u32) -> burrow::Result<()> {
    let page = engine.search(query, limit).await?;
    println!("{:<40} {:>8} {:<8}  DESCRIPTION", "NAME", "STARS", "OFFICIAL");
    for result in &page.results {
        let mut description = result.short_description.clone().unwrap_or_default();
        description.truncate(60);
        println!(
            "{:<40} {:>8} {:<8}  {}",
            result.repo_name,
            result.star_count,
            if result.is_official { "[OK]" } else { "" },
            description
        );
    }
    if page.count > page.results.len() as u64 {
        eprintln!("showing {} of {} matches", page.results.len(), page.count);
    }
    Ok(())
}

fn cmd_prune(engine: &Engine) -> burrow::Result<()> {
    let stats = engine.images().prune_cache()?;
    println!(
        "Removed {} files, freed {}",
        stats.removed_count,
        human_size(stats.freed_bytes)
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_create(
    engine: &Engine,
    image: &str,
    name: Option<String>,
    env: Vec<String>,
    workdir: Option<String>,
    user: Option<String>,
    hostname: Option<String>,
    cmd: Vec<String>,
) -> burrow::Result<()> {
    let record = engine.images().resolve(image)?;

    let mut config = ContainerConfig::default();
    if !cmd.is_empty() {
        config.cmd = cmd;
    }
    if let Some(dir) = workdir {
        config.working_dir = dir;
    }
    if let Some(user) = user {
        config.user = user;
    }
    if let Some(hostname) = hostname {
        config.hostname = hostname;
    }
    config.env = parse_env(&env);

    let handle = engine.create_container(&record.id, name, config);
    let container = handle.wait().await?;
    println!("{} {}", container.id, container.name);
    Ok(())
}

fn cmd_ps(engine: &Engine) -> burrow::Result<()> {
    println!("{:<38} {:<24} {:<30} {:<8}  CREATED", "CONTAINER ID", "NAME", "IMAGE", "STATUS");
    for container in engine.containers().list() {
        let record = container.record();
        println!(
            "{:<38} {:<24} {:<30} {:<8}  {}",
            record.id,
            record.name,
            record.image_name,
            container.status().label(),
            record.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn cmd_rm(engine: &Engine, container: &str) -> burrow::Result<()> {
    let id = match engine.containers().get_by_name(container) {
        Some(found) => found.id(),
        None => container.to_string(),
    };
    engine.containers().remove(&id)?;
    println!("{id}");
    Ok(())
}

fn print_registries(entries: &[(burrow::RegistryServer, RegistryHealth)]) {
    println!("{:<38} {:<10} {:<8} {:<10} {:>9}  URL", "ID", "NAME", "KIND", "HEALTH", "LATENCY");
    for (server, health) in entries {
        let latency = match health {
            RegistryHealth::Healthy { latency_ms, .. } if *latency_ms != u64::MAX => format!("{latency_ms}ms"),
            _ => "-".to_string(),
        };
        println!(
            "{:<38} {:<10} {:<8} {:<10} {:>9}  {}",
            server.id,
            server.name,
            server.kind.as_str(),
            health.label(),
            latency,
            server.url
        );
    }
}

async fn cmd_mirror(engine: &Engine, command: MirrorCommand) -> burrow::Result<()> {
    match command {
        MirrorCommand::Add {
            name,
            url,
            token,
            priority,
        } => {
            let server = engine.registries().add_custom_mirror(&name, &url, token, priority)?;
            println!("{}", server.id);
        }
        MirrorCommand::Rm { id } => {
            engine.registries().remove(&id).await?;
            println!("{id}");
        }
    }
    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

fn parse_env(entries: &[String]) -> BTreeMap<String, String> {
    entries
        .iter()
        .filter_map(|entry| {
            let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
            (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("burrow=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// =============================================================================
// Main
// =============================================================================

async fn run(cli: Cli) -> burrow::Result<()> {
    let mut config = EngineConfig::from_env();
    if let Some(root) = cli.root {
        config.root = root;
    }
    if let Some(registry) = cli.registry {
        config.default_registry = registry;
    }

    let engine = Engine::open(config)?;
    let result = match cli.command {
        Command::Pull {
            reference,
            always,
            probe_mirrors,
        } => cmd_pull(&engine, &reference, always, probe_mirrors).await,
        Command::Images => cmd_images(&engine),
        Command::Rmi { image } => cmd_rmi(&engine, &image),
        Command::Tags { image, limit, last } => cmd_tags(&engine, &image, limit, last).await,
        Command::Search { query, limit } => cmd_search(&engine, &query, limit).await,
        Command::Prune => cmd_prune(&engine),
        Command::Create {
            image,
            name,
            env,
            workdir,
            user,
            hostname,
            cmd,
        } => cmd_create(&engine, &image, name, env, workdir, user, hostname, cmd).await,
        Command::Ps => cmd_ps(&engine),
        Command::Rm { container } => cmd_rm(&engine, &container),
        Command::Registries => {
            print_registries(&engine.registries().snapshot());
            Ok(())
        }
        Command::Mirror(command) => cmd_mirror(&engine, command).await,
        Command::Check => {
            print_registries(&engine.registries().check_all_and_wait().await);
            Ok(())
        }
    };

    engine.shutdown().await;
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
