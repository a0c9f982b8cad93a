//! Registry v2 HTTP client.
//!
//! [`RegistryApi`] is the seam the pull pipeline and health tasks talk to;
//! [`HttpRegistryClient`] implements it over `reqwest`.
//!
//! ## Authentication
//!
//! For each request the client resolves a bearer token in this order:
//!
//! 1. the token configured on the registry row whose URL matches,
//! 2. a cached token for `(registry, repository)` that has not expired,
//! 3. none. If the registry answers 401, the `WWW-Authenticate: Bearer`
//!    challenge is answered with a token request scoped to
//!    `repository:<repo>:pull`, the token is cached, and the request is
//!    retried once.
//!
//! A 401 on a request that carried a cached token drops that token before
//! the challenge is answered, so a revoked token is never reused.
//!
//! ## Tag Listing
//!
//! `tags/list` is paged with `n` and `last`. A page holding exactly `n`
//! tags continues after its last tag; a shorter page is the final one.

use super::manifest::parse_manifest;
use crate::constants::{
    DEFAULT_TOKEN_LIFETIME, MANIFEST_ACCEPT, MAX_CONFIG_SIZE, MAX_LAYER_SIZE, MAX_LISTING_SIZE, MAX_MANIFEST_SIZE,
};
use crate::error::{Error, Result};
use crate::store::MetadataStore;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use oci_distribution::manifest::OciManifest;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, WWW_AUTHENTICATE};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Callback receiving the number of bytes written so far.
pub type ProgressFn<'a> = &'a (dyn Fn(u64) + Send + Sync);

/// Operations the engine needs from a v2 registry.
#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// `GET {url}/v2/`. A 2xx or 401 answer means reachable.
    async fn probe(&self, registry_url: &str) -> Result<()>;

    /// `GET {url}/v2/{repository}/manifests/{reference}`.
    async fn fetch_manifest(&self, registry_url: &str, repository: &str, reference: &str) -> Result<OciManifest>;

    /// Fetches the raw image config blob.
    async fn fetch_config(&self, registry_url: &str, repository: &str, digest: &str) -> Result<Vec<u8>>;

    /// Streams a blob into `dest`, reporting received bytes; returns the total.
    ///
    /// Verification is the caller's job.
    async fn download_blob(
        &self,
        registry_url: &str,
        repository: &str,
        digest: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<u64>;

    /// `GET {url}/v2/{repository}/tags/list?n={page_size}&last={last}`.
    async fn list_tags(&self, registry_url: &str, repository: &str, page_size: u32, last: Option<&str>)
    -> Result<TagPage>;
}

/// One page of a repository's tags.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TagPage {
    pub tags: Vec<String>,
    /// `last` value for the following page, `None` on the final page.
    pub next: Option<String>,
}

impl TagPage {
    pub fn new(tags: Vec<String>, page_size: u32) -> Self {
        let full = !tags.is_empty() && tags.len() >= page_size as usize;
        let next = if full { tags.last().cloned() } else { None };
        Self { tags, next }
    }
}

#[derive(Debug, Deserialize)]
struct TagList {
    tags: Option<Vec<String>>,
}

/// Parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    /// Parses a challenge header; `None` for non-bearer schemes.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut challenge = BearerChallenge::default();
        for (key, value) in split_auth_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => challenge.realm = value,
                "service" => challenge.service = Some(value),
                "scope" => challenge.scope = Some(value),
                _ => {}
            }
        }

        (!challenge.realm.is_empty()).then_some(challenge)
    }
}

/// Splits `k="v",k2=v2` honoring commas inside quotes.
fn split_auth_params(params: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    let mut push = |part: &str| {
        if let Some((k, v)) = part.split_once('=') {
            out.push((k.trim().to_string(), v.trim().trim_matches('"').to_string()));
        }
    };

    for c in params.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                push(&current);
                current.clear();
            }
            _ => current.push(c),
        }
    }
    push(&current);
    out
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

/// `reqwest`-backed [`RegistryApi`].
pub struct HttpRegistryClient {
    http: reqwest::Client,
    store: Arc<MetadataStore>,
    probe_timeout: Duration,
}

impl HttpRegistryClient {
    pub fn new(store: Arc<MetadataStore>, probe_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("burrow/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            store,
            probe_timeout,
        })
    }

    fn endpoint(registry_url: &str, path: &str) -> String {
        format!("{}/v2/{}", registry_url.trim_end_matches('/'), path)
    }

    /// Configured or cached token for a repository.
    fn known_token(&self, registry_url: &str, repository: &str) -> Result<Option<String>> {
        if let Some(token) = self.store.bearer_token_for_url(registry_url)? {
            return Ok(Some(token));
        }
        self.store.cached_token(registry_url, repository, Utc::now())
    }

    /// Answers a bearer challenge and caches the resulting token.
    async fn exchange_token(&self, registry_url: &str, repository: &str, headers: &HeaderMap) -> Result<Option<String>> {
        let Some(challenge) = headers
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(BearerChallenge::parse)
        else {
            return Ok(None);
        };

        let scope = format!("repository:{repository}:pull");
        let mut query: Vec<(&str, &str)> = vec![("scope", scope.as_str())];
        if let Some(service) = challenge.service.as_deref() {
            query.push(("service", service));
        }

        debug!(realm = %challenge.realm, %repository, "requesting bearer token");
        let response = self.http.get(&challenge.realm).query(&query).send().await?;
        let response = check_status(&challenge.realm, response).await?;
        let body: TokenResponse = response.json().await?;

        let Some(token) = body.token.or(body.access_token).filter(|t| !t.is_empty()) else {
            return Err(Error::Registry {
                url: challenge.realm,
                status: 200,
                message: "token response carried no token".to_string(),
            });
        };

        let lifetime = body
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(lifetime).unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.store.cache_token(registry_url, repository, &token, expires_at)?;

        Ok(Some(token))
    }

    /// GET with token resolution and one retry after a 401.
    async fn get_authorized(
        &self,
        registry_url: &str,
        repository: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<Response> {
        let send = |token: Option<String>| {
            let mut request = self.http.get(url);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            if let Some(token) = token {
                request = request.header(AUTHORIZATION, format!("Bearer {token}"));
            }
            request.send()
        };

        let token = self.known_token(registry_url, repository)?;
        let response = send(token.clone()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(url, response).await;
        }

        if token.is_some() {
            self.store.drop_token(registry_url, repository)?;
        }

        let fresh = self
            .exchange_token(registry_url, repository, response.headers())
            .await?;
        match fresh {
            Some(fresh) => check_status(url, send(Some(fresh)).await?).await,
            None => check_status(url, response).await,
        }
    }
}

/// Turns a non-success response into [`Error::Registry`].
async fn check_status(url: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut message = response.text().await.unwrap_or_default();
    message.truncate(512);
    Err(Error::Registry {
        url: url.to_string(),
        status: status.as_u16(),
        message,
    })
}

/// Reads a body, refusing anything larger than `limit`.
async fn read_limited(url: &str, response: Response, limit: usize) -> Result<Vec<u8>> {
    if let Some(len) = response.content_length()
        && len > limit as u64
    {
        return Err(Error::Registry {
            url: url.to_string(),
            status: response.status().as_u16(),
            message: format!("body of {len} bytes exceeds limit of {limit}"),
        });
    }

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if body.len() + chunk.len() > limit {
            return Err(Error::Registry {
                url: url.to_string(),
                status: 200,
                message: format!("body exceeds limit of {limit} bytes"),
            });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

#[async_trait]
impl RegistryApi for HttpRegistryClient {
    async fn probe(&self, registry_url: &str) -> Result<()> {
        let url = Self::endpoint(registry_url, "");
        let response = self
            .http
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::UNAUTHORIZED {
            Ok(())
        } else {
            Err(Error::Registry {
                url,
                status: status.as_u16(),
                message: "probe rejected".to_string(),
            })
        }
    }

    async fn fetch_manifest(&self, registry_url: &str, repository: &str, reference: &str) -> Result<OciManifest> {
        let url = Self::endpoint(registry_url, &format!("{repository}/manifests/{reference}"));
        let response = self
            .get_authorized(registry_url, repository, &url, Some(MANIFEST_ACCEPT))
            .await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = read_limited(&url, response, MAX_MANIFEST_SIZE).await?;

        parse_manifest(
            &format!("{repository}:{reference}"),
            content_type.as_deref(),
            &body,
        )
    }

    async fn fetch_config(&self, registry_url: &str, repository: &str, digest: &str) -> Result<Vec<u8>> {
        let url = Self::endpoint(registry_url, &format!("{repository}/blobs/{digest}"));
        let response = self.get_authorized(registry_url, repository, &url, None).await?;
        read_limited(&url, response, MAX_CONFIG_SIZE).await
    }

    async fn download_blob(
        &self,
        registry_url: &str,
        repository: &str,
        digest: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<u64> {
        let url = Self::endpoint(registry_url, &format!("{repository}/blobs/{digest}"));
        let response = self.get_authorized(registry_url, repository, &url, None).await?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut received = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            received += chunk.len() as u64;
            if received > MAX_LAYER_SIZE {
                warn!(%digest, received, "blob exceeds size limit, aborting");
                return Err(Error::LayerTooLarge {
                    digest: digest.to_string(),
                    size: received,
                    limit: MAX_LAYER_SIZE,
                });
            }
            file.write_all(&chunk).await?;
            progress(received);
        }

        file.flush().await?;
        file.sync_all().await?;
        debug!(%digest, bytes = received, "blob downloaded");
        Ok(received)
    }

    async fn list_tags(
        &self,
        registry_url: &str,
        repository: &str,
        page_size: u32,
        last: Option<&str>,
    ) -> Result<TagPage> {
        let page_size = page_size.max(1);
        let base = Self::endpoint(registry_url, &format!("{repository}/tags/list"));
        let mut query = vec![("n", page_size.to_string())];
        if let Some(last) = last.filter(|l| !l.is_empty()) {
            query.push(("last", last.to_string()));
        }
        let url = reqwest::Url::parse_with_params(&base, &query)
            .map_err(|_| Error::InvalidRegistryUrl(registry_url.to_string()))?;

        let response = self
            .get_authorized(registry_url, repository, url.as_str(), None)
            .await?;
        let body = read_limited(&base, response, MAX_LISTING_SIZE).await?;
        let list: TagList = serde_json::from_slice(&body)?;

        let page = TagPage::new(list.tags.unwrap_or_default(), page_size);
        debug!(%repository, tags = page.tags.len(), more = page.next.is_some(), "tags listed");
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_docker_hub_challenge() {
        let challenge = BearerChallenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(challenge.scope.as_deref(), Some("repository:library/alpine:pull"));
    }

    #[test]
    fn test_parse_challenge_with_comma_in_scope() {
        let challenge =
            BearerChallenge::parse(r#"bearer realm="https://t/token",scope="repository:a:pull,push""#).unwrap();
        assert_eq!(challenge.scope.as_deref(), Some("repository:a:pull,push"));
    }

    #[test]
    fn test_non_bearer_challenge_ignored() {
        assert!(BearerChallenge::parse(r#"Basic realm="registry""#).is_none());
        assert!(BearerChallenge::parse("Bearer service=\"x\"").is_none());
    }

    #[test]
    fn test_tag_page_continues_only_when_full() {
        let full = TagPage::new(vec!["1.0".into(), "1.1".into()], 2);
        assert_eq!(full.next.as_deref(), Some("1.1"));

        let short = TagPage::new(vec!["2.0".into()], 2);
        assert!(short.next.is_none());
        assert!(TagPage::new(Vec::new(), 2).next.is_none());
    }

    #[test]
    fn test_endpoint_join() {
        assert_eq!(
            HttpRegistryClient::endpoint("https://r.example/", "library/alpine/manifests/latest"),
            "https://r.example/v2/library/alpine/manifests/latest"
        );
        assert_eq!(HttpRegistryClient::endpoint("https://r.example", ""), "https://r.example/v2/");
    }
}
