//! SQLite schema for the metadata store.

/// Bumped whenever a table definition changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Full schema, applied with `execute_batch` on every open.
///
/// `layer_references` is the only thing that keeps a layer alive: rows
/// cascade away with their image, and a layer row cannot be deleted while
/// any reference to it remains. A container row pins its image the same way.
pub const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS registries (
    id           TEXT PRIMARY KEY,
    url          TEXT NOT NULL UNIQUE,
    name         TEXT NOT NULL,
    bearer_token TEXT,
    kind         TEXT NOT NULL CHECK (kind IN ('builtin', 'custom')),
    priority     INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS auth_tokens (
    registry_url TEXT NOT NULL,
    repository   TEXT NOT NULL,
    token        TEXT NOT NULL,
    expires_at   INTEGER NOT NULL,
    PRIMARY KEY (registry_url, repository)
);

CREATE TABLE IF NOT EXISTS images (
    id           TEXT PRIMARY KEY,
    registry     TEXT NOT NULL,
    repository   TEXT NOT NULL,
    tag          TEXT NOT NULL,
    architecture TEXT NOT NULL,
    os           TEXT NOT NULL,
    size         INTEGER NOT NULL,
    layer_ids    TEXT NOT NULL,
    config       TEXT NOT NULL,
    created      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_images_name ON images (registry, repository, tag);

CREATE TABLE IF NOT EXISTS layers (
    id         TEXT PRIMARY KEY,
    size       INTEGER NOT NULL,
    media_type TEXT NOT NULL,
    downloaded INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS layer_references (
    image_id TEXT NOT NULL REFERENCES images (id) ON DELETE CASCADE,
    layer_id TEXT NOT NULL REFERENCES layers (id) ON DELETE RESTRICT,
    PRIMARY KEY (image_id, layer_id)
);

CREATE INDEX IF NOT EXISTS idx_layer_references_layer ON layer_references (layer_id);

CREATE TABLE IF NOT EXISTS containers (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    image_id    TEXT NOT NULL REFERENCES images (id) ON DELETE RESTRICT,
    image_name  TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    config      TEXT NOT NULL,
    last_run_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_containers_image ON containers (image_id);
";
