//! SQLite-backed metadata store: the persistent index of per-file
//! attributes, cache paths, ratings, tags and LRU accounting.
//!
//! Single-process, exclusive writer: the pool holds exactly one
//! connection, so every statement is serialized, and batch operations run
//! inside one transaction. WAL journaling keeps readers unblocked by long
//! writes. Cache files referenced by deleted rows are unlinked outside
//! the connection.

mod tags;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use lightbox_protocol::ImageRecord;
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::plugins::{FastMetadata, FullMetadata};
use crate::util::{mtime_seconds, path_hash, unix_seconds};

/// Thumbnail and view-image cache paths of one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreviewPaths {
    pub thumbnail_path: Option<String>,
    pub view_image_path: Option<String>,
}

pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open (creating if missing) the database at `path` and apply the
    /// schema.
    pub async fn open(path: &Path) -> Result<Self> {
        info!(path = %path.display(), "opening metadata store");
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS image_metadata (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_path TEXT UNIQUE NOT NULL,
                path_hash TEXT NOT NULL,
                content_hash TEXT,
                file_size INTEGER,
                width INTEGER,
                height INTEGER,
                rating INTEGER NOT NULL DEFAULT 0,
                camera_make TEXT,
                camera_model TEXT,
                lens_model TEXT,
                focal_length REAL,
                aperture REAL,
                shutter_speed TEXT,
                iso INTEGER,
                date_taken TEXT,
                orientation INTEGER,
                color_space TEXT,
                thumbnail_path TEXT,
                view_image_path TEXT,
                exif_data TEXT,
                mtime REAL NOT NULL,
                created_at REAL NOT NULL,
                updated_at REAL NOT NULL,
                accessed_at REAL NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tags (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL,
                kind TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS image_tags (
                image_id INTEGER NOT NULL
                    REFERENCES image_metadata(id) ON DELETE CASCADE,
                tag_id INTEGER NOT NULL
                    REFERENCES tags(id) ON DELETE CASCADE,
                PRIMARY KEY (image_id, tag_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_file_path ON image_metadata(file_path)",
            "CREATE INDEX IF NOT EXISTS idx_path_hash ON image_metadata(path_hash)",
            "CREATE INDEX IF NOT EXISTS idx_content_hash ON image_metadata(content_hash)",
            "CREATE INDEX IF NOT EXISTS idx_rating ON image_metadata(rating)",
            "CREATE INDEX IF NOT EXISTS idx_camera_make ON image_metadata(camera_make)",
            "CREATE INDEX IF NOT EXISTS idx_camera_model ON image_metadata(camera_model)",
            "CREATE INDEX IF NOT EXISTS idx_date_taken ON image_metadata(date_taken)",
            "CREATE INDEX IF NOT EXISTS idx_file_size ON image_metadata(file_size)",
            "CREATE INDEX IF NOT EXISTS idx_accessed_at ON image_metadata(accessed_at)",
            "CREATE INDEX IF NOT EXISTS idx_image_tags_tag ON image_tags(tag_id)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("metadata store schema ready");
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ── Record reads ────────────────────────────────────────────────────

    /// Full record for a path, or `None` if unknown. Database-only; may be
    /// stale relative to the file on disk.
    pub async fn get(&self, file_path: &str) -> Result<Option<ImageRecord>> {
        let row = sqlx::query("SELECT * FROM image_metadata WHERE file_path = ?")
            .bind(file_path)
            .fetch_optional(&self.pool)
            .await?;
        row.map(record_from_row).transpose()
    }

    pub async fn get_rating(&self, file_path: &str) -> Result<i64> {
        let row = sqlx::query("SELECT rating FROM image_metadata WHERE file_path = ?")
            .bind(file_path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("rating")).unwrap_or(0))
    }

    /// Cache paths for a record, touching `accessed_at` (the LRU key).
    pub async fn preview_paths(&self, file_path: &str) -> Result<Option<PreviewPaths>> {
        let row = sqlx::query(
            r#"
            UPDATE image_metadata SET accessed_at = ?
            WHERE file_path = ?
            RETURNING thumbnail_path, view_image_path
            "#,
        )
        .bind(unix_seconds())
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| PreviewPaths {
            thumbnail_path: r.get("thumbnail_path"),
            view_image_path: r.get("view_image_path"),
        }))
    }

    /// Trust-cache batch lookup: rows with a thumbnail path, no source
    /// stat. Touches `accessed_at` for every hit.
    pub async fn batch_cached_previews(
        &self,
        file_paths: &[String],
    ) -> Result<HashMap<String, PreviewPaths>> {
        if file_paths.is_empty() {
            return Ok(HashMap::new());
        }
        let mut builder = sqlx::QueryBuilder::new(
            "UPDATE image_metadata SET accessed_at = ",
        );
        builder.push_bind(unix_seconds());
        builder.push(" WHERE thumbnail_path IS NOT NULL AND file_path IN (");
        let mut separated = builder.separated(", ");
        for path in file_paths {
            separated.push_bind(path);
        }
        builder.push(") RETURNING file_path, thumbnail_path, view_image_path");
        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.get::<String, _>("file_path"),
                    PreviewPaths {
                        thumbnail_path: r.get("thumbnail_path"),
                        view_image_path: r.get("view_image_path"),
                    },
                )
            })
            .collect())
    }

    /// A thumbnail is valid when the source file still matches the
    /// recorded `(size, mtime)` and the cached thumbnail file exists.
    /// One combined stat call against the source.
    pub async fn is_thumbnail_valid(&self, file_path: &str) -> Result<bool> {
        let Ok(metadata) = tokio::fs::metadata(file_path).await else {
            return Ok(false);
        };
        let disk_mtime = mtime_seconds(&metadata);
        let disk_size = metadata.len() as i64;

        let row = sqlx::query(
            r#"
            SELECT thumbnail_path, mtime, file_size FROM image_metadata
            WHERE file_path = ?
            "#,
        )
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let thumbnail_path: Option<String> = row.get("thumbnail_path");
        let stored_mtime: f64 = row.get("mtime");
        let stored_size: Option<i64> = row.get("file_size");

        let Some(thumbnail_path) = thumbnail_path else {
            return Ok(false);
        };
        Ok(stored_mtime >= disk_mtime
            && stored_size == Some(disk_size)
            && tokio::fs::try_exists(&thumbnail_path).await.unwrap_or(false))
    }

    pub async fn get_all_file_paths(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT file_path FROM image_metadata")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("file_path")).collect())
    }

    /// Paths under `directory`, restricted in SQL to direct children when
    /// not recursive.
    pub async fn get_directory_files(
        &self,
        directory: &str,
        recursive: bool,
    ) -> Result<Vec<String>> {
        let prefix = format!("{}/", directory.trim_end_matches('/'));
        let like = format!("{prefix}%");
        let rows = if recursive {
            sqlx::query("SELECT file_path FROM image_metadata WHERE file_path LIKE ?")
                .bind(&like)
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query(
                r#"
                SELECT file_path FROM image_metadata
                WHERE file_path LIKE ?
                  AND SUBSTR(file_path, LENGTH(?) + 1) NOT LIKE '%/%'
                "#,
            )
            .bind(&like)
            .bind(&prefix)
            .fetch_all(&self.pool)
            .await?
        };
        Ok(rows.into_iter().map(|r| r.get("file_path")).collect())
    }

    /// Paths matching a substring filter, any enabled rating level, and
    /// (when given) at least one of the listed tags.
    pub async fn get_filtered_file_paths(
        &self,
        text_filter: &str,
        star_states: &[bool; 6],
        tag_names: Option<&[String]>,
    ) -> Result<HashSet<String>> {
        let with_tags = tag_names.is_some_and(|t| !t.is_empty());
        let mut builder = sqlx::QueryBuilder::new(
            "SELECT DISTINCT m.file_path FROM image_metadata m",
        );
        if with_tags {
            builder.push(
                " JOIN image_tags it ON it.image_id = m.id \
                  JOIN tags t ON t.id = it.tag_id",
            );
        }
        builder.push(" WHERE 1=1");

        if !text_filter.is_empty() {
            builder.push(" AND m.file_path LIKE ");
            builder.push_bind(format!("%{text_filter}%"));
        }

        let enabled: Vec<i64> = star_states
            .iter()
            .enumerate()
            .filter_map(|(i, on)| on.then_some(i as i64))
            .collect();
        if enabled.is_empty() {
            // No rating level enabled matches nothing.
            builder.push(" AND 1=0");
        } else if enabled.len() < star_states.len() {
            builder.push(" AND m.rating IN (");
            let mut separated = builder.separated(", ");
            for rating in &enabled {
                separated.push_bind(*rating);
            }
            builder.push(")");
        }

        if with_tags
            && let Some(names) = tag_names
        {
            builder.push(" AND t.name IN (");
            let mut separated = builder.separated(", ");
            for name in names {
                separated.push_bind(name);
            }
            builder.push(")");
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|r| r.get::<String, _>("file_path"))
            .collect())
    }

    // ── Record writes ───────────────────────────────────────────────────

    /// Upsert cache paths, creating a minimal record if none exists.
    pub async fn set_thumbnail_paths(
        &self,
        file_path: &str,
        thumbnail_path: Option<&str>,
        view_image_path: Option<&str>,
    ) -> Result<()> {
        let now = unix_seconds();
        let existing =
            sqlx::query("SELECT id FROM image_metadata WHERE file_path = ?")
                .bind(file_path)
                .fetch_optional(&self.pool)
                .await?;

        if existing.is_some() {
            if thumbnail_path.is_none() && view_image_path.is_none() {
                return Ok(());
            }
            let mut builder = sqlx::QueryBuilder::new("UPDATE image_metadata SET ");
            let mut separated = builder.separated(", ");
            if let Some(thumb) = thumbnail_path {
                separated.push("thumbnail_path = ");
                separated.push_bind_unseparated(thumb);
            }
            if let Some(view) = view_image_path {
                separated.push("view_image_path = ");
                separated.push_bind_unseparated(view);
            }
            separated.push("updated_at = ");
            separated.push_bind_unseparated(now);
            builder.push(" WHERE file_path = ");
            builder.push_bind(file_path);
            builder.build().execute(&self.pool).await?;
        } else {
            let metadata = std::fs::metadata(file_path)
                .map_err(|_| CoreError::NotFound(PathBuf::from(file_path)))?;
            let hash = path_hash(Path::new(file_path), &metadata);
            sqlx::query(
                r#"
                INSERT INTO image_metadata
                    (file_path, path_hash, file_size, thumbnail_path,
                     view_image_path, mtime, created_at, updated_at, accessed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(file_path)
            .bind(hash)
            .bind(metadata.len() as i64)
            .bind(thumbnail_path)
            .bind(view_image_path)
            .bind(mtime_seconds(&metadata))
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Set one rating. Ratings outside `0..=5` are rejected.
    pub async fn set_rating(&self, file_path: &str, rating: i64) -> Result<()> {
        validate_rating(rating)?;
        let now = unix_seconds();
        let updated = sqlx::query(
            "UPDATE image_metadata SET rating = ?, updated_at = ? WHERE file_path = ?",
        )
        .bind(rating)
        .bind(now)
        .bind(file_path)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() > 0 {
            return Ok(());
        }
        let metadata = std::fs::metadata(file_path)
            .map_err(|_| CoreError::NotFound(PathBuf::from(file_path)))?;
        let hash = path_hash(Path::new(file_path), &metadata);
        sqlx::query(
            r#"
            INSERT INTO image_metadata
                (file_path, path_hash, file_size, rating, mtime,
                 created_at, updated_at, accessed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(file_path)
        .bind(hash)
        .bind(metadata.len() as i64)
        .bind(rating)
        .bind(mtime_seconds(&metadata))
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Set one rating for many files inside a single transaction.
    /// Returns `(all_written, written_count)`; files that disappeared
    /// before a minimal record could be created are skipped.
    pub async fn batch_set_ratings(
        &self,
        file_paths: &[String],
        rating: i64,
    ) -> Result<(bool, usize)> {
        validate_rating(rating)?;
        if file_paths.is_empty() {
            return Ok((true, 0));
        }
        let unique: HashSet<&String> = file_paths.iter().collect();
        let now = unix_seconds();
        let mut skipped = 0usize;

        let mut tx = self.pool.begin().await?;

        let mut builder = sqlx::QueryBuilder::new(
            "SELECT file_path FROM image_metadata WHERE file_path IN (",
        );
        let mut separated = builder.separated(", ");
        for path in &unique {
            separated.push_bind(path.as_str());
        }
        builder.push(")");
        let existing: HashSet<String> = builder
            .build()
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(|r| r.get::<String, _>("file_path"))
            .collect();

        for path in &existing {
            sqlx::query(
                "UPDATE image_metadata SET rating = ?, updated_at = ? WHERE file_path = ?",
            )
            .bind(rating)
            .bind(now)
            .bind(path)
            .execute(&mut *tx)
            .await?;
        }

        for path in unique.iter().filter(|p| !existing.contains(p.as_str())) {
            let Ok(metadata) = std::fs::metadata(path.as_str()) else {
                warn!(path = %path, "could not stat file for batch rating insert");
                skipped += 1;
                continue;
            };
            let hash = path_hash(Path::new(path.as_str()), &metadata);
            sqlx::query(
                r#"
                INSERT INTO image_metadata
                    (file_path, path_hash, file_size, rating, mtime,
                     created_at, updated_at, accessed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(path.as_str())
            .bind(hash)
            .bind(metadata.len() as i64)
            .bind(rating)
            .bind(mtime_seconds(&metadata))
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        let written = unique.len() - skipped;
        info!(written, total = file_paths.len(), rating, "batch rating write");
        Ok((skipped == 0, written))
    }

    /// Insert minimal rows for paths not yet known; existing rows are
    /// untouched. One transaction.
    pub async fn batch_ensure_records_exist(&self, file_paths: &[String]) -> Result<usize> {
        if file_paths.is_empty() {
            return Ok(0);
        }
        let now = unix_seconds();
        let mut tx = self.pool.begin().await?;

        let mut builder = sqlx::QueryBuilder::new(
            "SELECT file_path FROM image_metadata WHERE file_path IN (",
        );
        let mut separated = builder.separated(", ");
        for path in file_paths {
            separated.push_bind(path);
        }
        builder.push(")");
        let existing: HashSet<String> = builder
            .build()
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(|r| r.get::<String, _>("file_path"))
            .collect();

        let mut inserted = 0usize;
        for path in file_paths.iter().filter(|p| !existing.contains(*p)) {
            // Files deleted mid-scan are skipped silently.
            let Ok(metadata) = std::fs::metadata(path) else {
                continue;
            };
            let hash = path_hash(Path::new(path), &metadata);
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO image_metadata
                    (file_path, path_hash, file_size, mtime,
                     created_at, updated_at, accessed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(path)
            .bind(hash)
            .bind(metadata.len() as i64)
            .bind(mtime_seconds(&metadata))
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            inserted += 1;
        }
        tx.commit().await?;
        if inserted > 0 {
            info!(inserted, "batch-inserted minimal records");
        }
        Ok(inserted)
    }

    /// Delete rows and unlink their cache files (outside the connection).
    /// Returns the number of rows removed.
    pub async fn remove_records(&self, file_paths: &[String]) -> Result<u64> {
        if file_paths.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;

        let mut builder = sqlx::QueryBuilder::new(
            "SELECT thumbnail_path, view_image_path FROM image_metadata WHERE file_path IN (",
        );
        let mut separated = builder.separated(", ");
        for path in file_paths {
            separated.push_bind(path);
        }
        builder.push(")");
        let cache_rows = builder.build().fetch_all(&mut *tx).await?;

        let mut builder =
            sqlx::QueryBuilder::new("DELETE FROM image_metadata WHERE file_path IN (");
        let mut separated = builder.separated(", ");
        for path in file_paths {
            separated.push_bind(path);
        }
        builder.push(")");
        let deleted = builder.build().execute(&mut *tx).await?.rows_affected();
        tx.commit().await?;

        for row in cache_rows {
            for column in ["thumbnail_path", "view_image_path"] {
                if let Some(cache_path) = row.get::<Option<String>, _>(column)
                    && let Err(err) = tokio::fs::remove_file(&cache_path).await
                    && err.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(path = %cache_path, error = %err, "failed to remove cache file");
                }
            }
        }
        info!(deleted, requested = file_paths.len(), "removed records");
        Ok(deleted)
    }

    /// Rename rows for moved files inside one transaction. Returns the
    /// number of rows updated.
    pub async fn move_records(&self, moves: &[(String, String)]) -> Result<u64> {
        if moves.is_empty() {
            return Ok(0);
        }
        let now = unix_seconds();
        let mut updated = 0u64;
        let mut tx = self.pool.begin().await?;
        for (old_path, new_path) in moves {
            let result = sqlx::query(
                "UPDATE image_metadata SET file_path = ?, updated_at = ? WHERE file_path = ?",
            )
            .bind(new_path)
            .bind(now)
            .bind(old_path)
            .execute(&mut *tx)
            .await?;
            updated += result.rows_affected();
        }
        tx.commit().await?;
        info!(updated, requested = moves.len(), "moved records");
        Ok(updated)
    }

    pub async fn set_content_hash(&self, file_path: &str, content_hash: &str) -> Result<()> {
        if content_hash.is_empty() {
            return Err(CoreError::Internal("empty content hash".into()));
        }
        let result = sqlx::query(
            "UPDATE image_metadata SET content_hash = ?, updated_at = ? WHERE file_path = ?",
        )
        .bind(content_hash)
        .bind(unix_seconds())
        .bind(file_path)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!(path = file_path, "no record to attach content hash to");
        }
        Ok(())
    }

    // ── Extraction tiers ────────────────────────────────────────────────

    /// True when the record is missing its deep EXIF payload and a
    /// `meta_full` task should run.
    pub async fn needs_full_metadata(&self, file_path: &str) -> Result<bool> {
        let row = sqlx::query("SELECT exif_data FROM image_metadata WHERE file_path = ?")
            .bind(file_path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            None => true,
            Some(row) => match row.get::<Option<String>, _>("exif_data") {
                None => true,
                Some(text) => text.is_empty() || text == "{}",
            },
        })
    }

    /// Persist the fast tier (header scan + sidecar override): rating,
    /// orientation, file identity. Creates the row when absent.
    pub async fn apply_fast_metadata(
        &self,
        file_path: &str,
        fast: &FastMetadata,
    ) -> Result<()> {
        let metadata = std::fs::metadata(file_path)
            .map_err(|_| CoreError::NotFound(PathBuf::from(file_path)))?;
        let hash = path_hash(Path::new(file_path), &metadata);
        let now = unix_seconds();
        let mtime = mtime_seconds(&metadata);

        let updated = {
            let mut builder = sqlx::QueryBuilder::new("UPDATE image_metadata SET ");
            let mut separated = builder.separated(", ");
            separated.push("path_hash = ");
            separated.push_bind_unseparated(hash.clone());
            separated.push("file_size = ");
            separated.push_bind_unseparated(metadata.len() as i64);
            separated.push("mtime = ");
            separated.push_bind_unseparated(mtime);
            separated.push("updated_at = ");
            separated.push_bind_unseparated(now);
            if let Some(orientation) = fast.orientation {
                separated.push("orientation = ");
                separated.push_bind_unseparated(orientation as i64);
            }
            if let Some(rating) = fast.rating {
                separated.push("rating = ");
                separated.push_bind_unseparated(rating as i64);
            }
            builder.push(" WHERE file_path = ");
            builder.push_bind(file_path);
            builder.build().execute(&self.pool).await?.rows_affected()
        };
        if updated > 0 {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO image_metadata
                (file_path, path_hash, file_size, rating, orientation,
                 mtime, created_at, updated_at, accessed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(file_path)
        .bind(hash)
        .bind(metadata.len() as i64)
        .bind(fast.rating.map(|r| r as i64).unwrap_or(0))
        .bind(fast.orientation.map(|o| o as i64).unwrap_or(1))
        .bind(mtime)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist the deep tier. Existing cache paths and content hash are
    /// preserved against concurrent tasks.
    pub async fn store_full_metadata(
        &self,
        file_path: &str,
        full: &FullMetadata,
    ) -> Result<()> {
        let metadata = std::fs::metadata(file_path)
            .map_err(|_| CoreError::NotFound(PathBuf::from(file_path)))?;
        let hash = path_hash(Path::new(file_path), &metadata);
        let now = unix_seconds();
        let mtime = mtime_seconds(&metadata);
        let exif_json = serde_json::to_string(&full.exif_data)?;

        let updated = sqlx::query(
            r#"
            UPDATE image_metadata SET
                path_hash = ?, file_size = ?, width = ?, height = ?,
                rating = COALESCE(?, rating),
                camera_make = ?, camera_model = ?, lens_model = ?,
                focal_length = ?, aperture = ?, shutter_speed = ?, iso = ?,
                date_taken = ?, orientation = ?, color_space = ?,
                exif_data = ?, mtime = ?, updated_at = ?
            WHERE file_path = ?
            "#,
        )
        .bind(&hash)
        .bind(metadata.len() as i64)
        .bind(full.width)
        .bind(full.height)
        .bind(full.rating)
        .bind(&full.camera_make)
        .bind(&full.camera_model)
        .bind(&full.lens_model)
        .bind(full.focal_length)
        .bind(full.aperture)
        .bind(&full.shutter_speed)
        .bind(full.iso)
        .bind(&full.date_taken)
        .bind(full.orientation.unwrap_or(1))
        .bind(&full.color_space)
        .bind(&exif_json)
        .bind(mtime)
        .bind(now)
        .bind(file_path)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated > 0 {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO image_metadata
                (file_path, path_hash, file_size, width, height, rating,
                 camera_make, camera_model, lens_model, focal_length,
                 aperture, shutter_speed, iso, date_taken, orientation,
                 color_space, exif_data, mtime, created_at, updated_at,
                 accessed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(file_path)
        .bind(&hash)
        .bind(metadata.len() as i64)
        .bind(full.width)
        .bind(full.height)
        .bind(full.rating.unwrap_or(0))
        .bind(&full.camera_make)
        .bind(&full.camera_model)
        .bind(&full.lens_model)
        .bind(full.focal_length)
        .bind(full.aperture)
        .bind(&full.shutter_speed)
        .bind(full.iso)
        .bind(&full.date_taken)
        .bind(full.orientation.unwrap_or(1))
        .bind(&full.color_space)
        .bind(&exif_json)
        .bind(mtime)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Cache-byte accounting ───────────────────────────────────────────

    /// Sum of on-disk bytes of all referenced thumbnails and view images.
    pub async fn get_total_cache_size(&self) -> Result<u64> {
        let rows = sqlx::query(
            r#"
            SELECT thumbnail_path, view_image_path FROM image_metadata
            WHERE thumbnail_path IS NOT NULL OR view_image_path IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut total = 0u64;
        for row in rows {
            total += cache_bytes_of_row(&row).await;
        }
        Ok(total)
    }

    /// Evict records in ascending `accessed_at` order, unlinking their
    /// cache files, until the recorded cache total is at or below
    /// `target_bytes`. Returns bytes freed.
    pub async fn evict_lru_cache(&self, target_bytes: u64) -> Result<u64> {
        let rows = sqlx::query(
            r#"
            SELECT file_path, thumbnail_path, view_image_path
            FROM image_metadata
            WHERE thumbnail_path IS NOT NULL OR view_image_path IS NOT NULL
            ORDER BY accessed_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut sizes = Vec::with_capacity(rows.len());
        let mut total = 0u64;
        for row in &rows {
            let bytes = cache_bytes_of_row(row).await;
            total += bytes;
            sizes.push(bytes);
        }

        let mut freed = 0u64;
        for (row, bytes) in rows.iter().zip(sizes) {
            if total <= target_bytes {
                break;
            }
            let file_path: String = row.get("file_path");
            for column in ["thumbnail_path", "view_image_path"] {
                if let Some(cache_path) = row.get::<Option<String>, _>(column)
                    && let Err(err) = tokio::fs::remove_file(&cache_path).await
                    && err.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(path = %cache_path, error = %err, "failed to unlink evicted cache file");
                }
            }
            sqlx::query("DELETE FROM image_metadata WHERE file_path = ?")
                .bind(&file_path)
                .execute(&self.pool)
                .await?;
            total = total.saturating_sub(bytes);
            freed += bytes;
        }
        if freed > 0 {
            info!(freed, target = target_bytes, "evicted LRU cache entries");
        }
        Ok(freed)
    }
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore").finish_non_exhaustive()
    }
}

fn validate_rating(rating: i64) -> Result<()> {
    if (0..=5).contains(&rating) {
        Ok(())
    } else {
        Err(CoreError::InvalidRating(rating))
    }
}

async fn cache_bytes_of_row(row: &SqliteRow) -> u64 {
    let mut bytes = 0u64;
    for column in ["thumbnail_path", "view_image_path"] {
        if let Some(path) = row.get::<Option<String>, _>(column)
            && let Ok(metadata) = tokio::fs::metadata(&path).await
        {
            bytes += metadata.len();
        }
    }
    bytes
}

fn record_from_row(row: SqliteRow) -> Result<ImageRecord> {
    let exif_data = row
        .get::<Option<String>, _>("exif_data")
        .and_then(|text| serde_json::from_str(&text).ok());
    Ok(ImageRecord {
        file_path: row.get("file_path"),
        path_hash: row.get("path_hash"),
        content_hash: row.get("content_hash"),
        file_size: row.get("file_size"),
        width: row.get("width"),
        height: row.get("height"),
        rating: row.get("rating"),
        camera_make: row.get("camera_make"),
        camera_model: row.get("camera_model"),
        lens_model: row.get("lens_model"),
        focal_length: row.get("focal_length"),
        aperture: row.get("aperture"),
        shutter_speed: row.get("shutter_speed"),
        iso: row.get("iso"),
        date_taken: row.get("date_taken"),
        orientation: row.get("orientation"),
        color_space: row.get("color_space"),
        thumbnail_path: row.get("thumbnail_path"),
        view_image_path: row.get("view_image_path"),
        exif_data,
        mtime: row.get("mtime"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        accessed_at: row.get("accessed_at"),
    })
}
