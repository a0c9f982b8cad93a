//! # Metadata Store
//!
//! Transactional relational store for registries, images, layers and
//! containers, backed by SQLite through `rusqlite`.
//!
//! ## Referential Integrity
//!
//! ```text
//! images ──< layer_references >── layers
//!   (ON DELETE CASCADE)   (ON DELETE RESTRICT)
//! ```
//!
//! - An image and all of its layer/reference rows are written in a single
//!   transaction ([`MetadataStore::commit_image`]); readers never see an
//!   image whose layers are not all recorded as downloaded.
//! - Deleting an image cascades to its references and, in the same
//!   transaction, removes every layer row left without references
//!   ([`MetadataStore::delete_image`]).
//! - Container names are `UNIQUE`; an insert that races past the
//!   application-level check still fails with [`Error::NameConflict`].
//! - A container row references its image. Inserting one for an image that
//!   is gone fails with [`Error::ImageNotFound`] inside the insert itself,
//!   so a create cannot outrace an image delete.
//!
//! The connection is guarded by a `Mutex`; every method holds it for the
//! duration of one statement or one transaction.

mod records;
mod schema;

pub use records::{
    ContainerConfig, ContainerRecord, ImageConfig, ImageRecord, LayerRecord, RegistryKind,
    RegistryServer, VolumeBinding,
};
pub use schema::{SCHEMA_SQL, SCHEMA_VERSION};

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Tag given to an image whose tag moved to a newer image.
pub const UNTAGGED: &str = "<none>";

const IMAGE_COLUMNS: &str =
    "id, registry, repository, tag, architecture, os, size, layer_ids, config, created";
const CONTAINER_COLUMNS: &str =
    "id, name, image_id, image_name, created_at, config, last_run_at";
const REGISTRY_COLUMNS: &str = "id, url, name, bearer_token, kind, priority";

pub struct MetadataStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl MetadataStore {
    /// Opens (creating if needed) the database at `path` and applies the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::StorageInit {
                path: parent.to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        let conn = Connection::open(path)?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))?;
        if mode != "wal" {
            debug!(journal_mode = %mode, "WAL mode unavailable, continuing");
        }

        let store = Self::init(conn, Some(path.to_path_buf()))?;
        info!("Metadata store opened at: {}", path.display());
        Ok(store)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, db_path: Option<PathBuf>) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;
        conn.execute(
            "INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// Database file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock leaves SQLite itself consistent.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Registries
    // =========================================================================

    /// Inserts a registry unless one with the same id already exists.
    pub fn ensure_registry(&self, registry: &RegistryServer) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO registries (id, url, name, bearer_token, kind, priority)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                registry.id,
                registry.url,
                registry.name,
                registry.bearer_token,
                registry.kind.as_str(),
                registry.priority
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Inserts a new registry; a duplicate URL is a conflict.
    pub fn insert_registry(&self, registry: &RegistryServer) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO registries (id, url, name, bearer_token, kind, priority)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    registry.id,
                    registry.url,
                    registry.name,
                    registry.bearer_token,
                    registry.kind.as_str(),
                    registry.priority
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    Error::InvalidRegistryUrl(format!("{} is already configured", registry.url))
                } else {
                    e.into()
                }
            })?;
        Ok(())
    }

    pub fn get_registry(&self, id: &str) -> Result<Option<RegistryServer>> {
        let conn = self.conn();
        let sql = format!("SELECT {REGISTRY_COLUMNS} FROM registries WHERE id = ?1");
        Ok(conn.query_row(&sql, params![id], registry_from_row).optional()?)
    }

    pub fn list_registries(&self) -> Result<Vec<RegistryServer>> {
        let conn = self.conn();
        let sql = format!("SELECT {REGISTRY_COLUMNS} FROM registries ORDER BY priority DESC, id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], registry_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Returns true if a row was deleted.
    pub fn delete_registry(&self, id: &str) -> Result<bool> {
        let deleted = self
            .conn()
            .execute("DELETE FROM registries WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    pub fn set_registry_token(&self, id: &str, token: Option<&str>) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE registries SET bearer_token = ?2 WHERE id = ?1",
            params![id, token],
        )?;
        if updated == 0 {
            return Err(Error::RegistryNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn set_registry_priority(&self, id: &str, priority: i32) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE registries SET priority = ?2 WHERE id = ?1",
            params![id, priority],
        )?;
        if updated == 0 {
            return Err(Error::RegistryNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Bearer token configured on the registry whose URL is `url`.
    pub fn bearer_token_for_url(&self, url: &str) -> Result<Option<String>> {
        let conn = self.conn();
        let token: Option<Option<String>> = conn
            .query_row(
                "SELECT bearer_token FROM registries WHERE url = ?1",
                params![url.trim_end_matches('/')],
                |row| row.get(0),
            )
            .optional()?;
        Ok(token.flatten().filter(|t| !t.is_empty()))
    }

    // =========================================================================
    // Token cache
    // =========================================================================

    /// Token for `(url, repository)` that is still valid at `now`.
    pub fn cached_token(&self, url: &str, repository: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT token FROM auth_tokens
                 WHERE registry_url = ?1 AND repository = ?2 AND expires_at > ?3",
                params![url, repository, now.timestamp_millis()],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn cache_token(
        &self,
        url: &str,
        repository: &str,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO auth_tokens (registry_url, repository, token, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![url, repository, token, expires_at.timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn drop_token(&self, url: &str, repository: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM auth_tokens WHERE registry_url = ?1 AND repository = ?2",
            params![url, repository],
        )?;
        Ok(())
    }

    // =========================================================================
    // Images and layers
    // =========================================================================

    pub fn image_exists(&self, id: &str) -> Result<bool> {
        let conn = self.conn();
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM images WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_image(&self, id: &str) -> Result<Option<ImageRecord>> {
        let conn = self.conn();
        let sql = format!("SELECT {IMAGE_COLUMNS} FROM images WHERE id = ?1");
        Ok(conn.query_row(&sql, params![id], image_from_row).optional()?)
    }

    /// Image currently carrying `registry/repository:tag`.
    pub fn find_image(&self, registry: &str, repository: &str, tag: &str) -> Result<Option<ImageRecord>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {IMAGE_COLUMNS} FROM images
             WHERE registry = ?1 AND repository = ?2 AND tag = ?3
             ORDER BY created DESC LIMIT 1"
        );
        Ok(conn
            .query_row(&sql, params![registry, repository, tag], image_from_row)
            .optional()?)
    }

    pub fn list_images(&self) -> Result<Vec<ImageRecord>> {
        let conn = self.conn();
        let sql = format!("SELECT {IMAGE_COLUMNS} FROM images ORDER BY created DESC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], image_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Writes an image, its layers and its layer references atomically.
    ///
    /// Re-committing an existing image id updates its row in place; the row
    /// is never deleted and re-inserted, so existing references survive.
    /// Any other image holding the same `registry/repository:tag` loses the
    /// tag.
    pub fn commit_image(&self, image: &ImageRecord, layers: &[LayerRecord]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        for layer in layers {
            tx.execute(
                "INSERT INTO layers (id, size, media_type, downloaded) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (id) DO UPDATE SET
                     size = excluded.size,
                     media_type = excluded.media_type,
                     downloaded = excluded.downloaded",
                params![layer.id, layer.size as i64, layer.media_type, layer.downloaded],
            )?;
        }

        tx.execute(
            "UPDATE images SET tag = ?4 WHERE registry = ?1 AND repository = ?2 AND tag = ?3 AND id != ?5",
            params![image.registry, image.repository, image.tag, UNTAGGED, image.id],
        )?;

        tx.execute(
            "INSERT INTO images (id, registry, repository, tag, architecture, os, size, layer_ids, config, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (id) DO UPDATE SET
                 registry = excluded.registry,
                 repository = excluded.repository,
                 tag = excluded.tag,
                 architecture = excluded.architecture,
                 os = excluded.os,
                 size = excluded.size,
                 layer_ids = excluded.layer_ids,
                 config = excluded.config",
            params![
                image.id,
                image.registry,
                image.repository,
                image.tag,
                image.architecture,
                image.os,
                image.size as i64,
                serde_json::to_string(&image.layer_ids)?,
                serde_json::to_string(&image.config)?,
                image.created.timestamp_millis(),
            ],
        )?;

        for layer_id in &image.layer_ids {
            tx.execute(
                "INSERT OR IGNORE INTO layer_references (image_id, layer_id) VALUES (?1, ?2)",
                params![image.id, layer_id],
            )?;
        }

        tx.commit()?;
        debug!(image = %image.id, layers = image.layer_ids.len(), "image committed");
        Ok(())
    }

    /// Deletes an image and every layer row it leaves unreferenced.
    ///
    /// Returns the ids of the deleted layers so their cache files can be
    /// removed. Fails with [`Error::ImageInUse`] while a container uses it.
    pub fn delete_image(&self, id: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let user: Option<String> = tx
            .query_row(
                "SELECT name FROM containers WHERE image_id = ?1 LIMIT 1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(container) = user {
            return Err(Error::ImageInUse {
                image: id.to_string(),
                container,
            });
        }

        let candidates: Vec<String> = {
            let mut stmt = tx.prepare("SELECT layer_id FROM layer_references WHERE image_id = ?1")?;
            let rows = stmt.query_map(params![id], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let deleted = tx.execute("DELETE FROM images WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(Error::ImageNotFound(id.to_string()));
        }

        let mut removed = Vec::new();
        for layer_id in candidates {
            let count = tx.execute(
                "DELETE FROM layers WHERE id = ?1
                 AND NOT EXISTS (SELECT 1 FROM layer_references WHERE layer_id = ?1)",
                params![layer_id],
            )?;
            if count > 0 {
                removed.push(layer_id);
            }
        }

        tx.commit()?;
        info!(image = %id, removed_layers = removed.len(), "image deleted");
        Ok(removed)
    }

    pub fn get_layer(&self, id: &str) -> Result<Option<LayerRecord>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT id, size, media_type, downloaded FROM layers WHERE id = ?1",
                params![id],
                layer_from_row,
            )
            .optional()?)
    }

    pub fn list_layers(&self) -> Result<Vec<LayerRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, size, media_type, downloaded FROM layers ORDER BY id")?;
        let rows = stmt.query_map([], layer_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Ids of every layer row.
    pub fn layer_ids(&self) -> Result<HashSet<String>> {
        Ok(self.list_layers()?.into_iter().map(|l| l.id).collect())
    }

    /// Number of images referencing a layer.
    pub fn layer_reference_count(&self, id: &str) -> Result<u64> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM layer_references WHERE layer_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Deletes a layer row; rejected while any image references it.
    pub fn delete_layer(&self, id: &str) -> Result<()> {
        let deleted = self
            .conn()
            .execute("DELETE FROM layers WHERE id = ?1", params![id])
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    Error::LayerInUse(id.to_string())
                } else {
                    e.into()
                }
            })?;
        if deleted == 0 {
            return Err(Error::LayerNotFound(id.to_string()));
        }
        Ok(())
    }

    // =========================================================================
    // Containers
    // =========================================================================

    /// Inserts a container; a taken name fails with [`Error::NameConflict`]
    /// and a missing image with [`Error::ImageNotFound`].
    pub fn insert_container(&self, container: &ContainerRecord) -> Result<()> {
        let config = serde_json::to_string(&container.config)?;
        self.conn()
            .execute(
                "INSERT INTO containers (id, name, image_id, image_name, created_at, config, last_run_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    container.id,
                    container.name,
                    container.image_id,
                    container.image_name,
                    container.created_at.timestamp_millis(),
                    config,
                    container.last_run_at.map(|t| t.timestamp_millis()),
                ],
            )
            .map_err(|e| {
                if is_foreign_key_violation(&e) {
                    Error::ImageNotFound(container.image_id.clone())
                } else if is_constraint_violation(&e) {
                    Error::NameConflict(container.name.clone())
                } else {
                    e.into()
                }
            })?;
        Ok(())
    }

    pub fn container_name_exists(&self, name: &str) -> Result<bool> {
        let conn = self.conn();
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM containers WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_container(&self, id: &str) -> Result<Option<ContainerRecord>> {
        let conn = self.conn();
        let sql = format!("SELECT {CONTAINER_COLUMNS} FROM containers WHERE id = ?1");
        Ok(conn.query_row(&sql, params![id], container_from_row).optional()?)
    }

    pub fn get_container_by_name(&self, name: &str) -> Result<Option<ContainerRecord>> {
        let conn = self.conn();
        let sql = format!("SELECT {CONTAINER_COLUMNS} FROM containers WHERE name = ?1");
        Ok(conn.query_row(&sql, params![name], container_from_row).optional()?)
    }

    pub fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        let conn = self.conn();
        let sql = format!("SELECT {CONTAINER_COLUMNS} FROM containers ORDER BY created_at");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], container_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete_container(&self, id: &str) -> Result<bool> {
        let deleted = self
            .conn()
            .execute("DELETE FROM containers WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    pub fn set_container_last_run(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE containers SET last_run_at = ?2 WHERE id = ?1",
            params![id, at.timestamp_millis()],
        )?;
        if updated == 0 {
            return Err(Error::ContainerNotFound(id.to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}

fn timestamp(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn registry_from_row(row: &Row<'_>) -> rusqlite::Result<RegistryServer> {
    let kind: String = row.get(4)?;
    let kind = RegistryKind::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            Type::Text,
            format!("unknown registry kind '{kind}'").into(),
        )
    })?;
    Ok(RegistryServer {
        id: row.get(0)?,
        url: row.get(1)?,
        name: row.get(2)?,
        bearer_token: row.get(3)?,
        kind,
        priority: row.get(5)?,
    })
}

fn image_from_row(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
    let size: i64 = row.get(6)?;
    Ok(ImageRecord {
        id: row.get(0)?,
        registry: row.get(1)?,
        repository: row.get(2)?,
        tag: row.get(3)?,
        architecture: row.get(4)?,
        os: row.get(5)?,
        size: size as u64,
        layer_ids: json_column(row, 7)?,
        config: json_column(row, 8)?,
        created: timestamp(row.get(9)?),
    })
}

fn layer_from_row(row: &Row<'_>) -> rusqlite::Result<LayerRecord> {
    let size: i64 = row.get(1)?;
    Ok(LayerRecord {
        id: row.get(0)?,
        size: size as u64,
        media_type: row.get(2)?,
        downloaded: row.get(3)?,
    })
}

fn container_from_row(row: &Row<'_>) -> rusqlite::Result<ContainerRecord> {
    let last_run: Option<i64> = row.get(6)?;
    Ok(ContainerRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        image_id: row.get(2)?,
        image_name: row.get(3)?,
        created_at: timestamp(row.get(4)?),
        config: json_column(row, 5)?,
        last_run_at: last_run.map(timestamp),
    })
}
