//! Tag vocabulary and image-tag links.
//!
//! Tags have a unique name and an optional kind ("keyword" or
//! "workflow"). Links cascade away with their image record. `set`-style
//! operations replace the full tag set of an image, mirroring the sidecar
//! Subject-list semantics.

use std::collections::HashMap;

use sqlx::Row;
use sqlx::sqlite::SqliteConnection;
use tracing::info;

use super::MetadataStore;
use crate::error::{CoreError, Result};

impl MetadataStore {
    /// Look up a tag id by name, creating the tag when missing.
    pub async fn get_or_create_tag(&self, name: &str, kind: Option<&str>) -> Result<i64> {
        let mut conn = self.pool().acquire().await?;
        get_or_create_tag_on(&mut *conn, name, kind).await
    }

    /// Attach tags to an image; existing links are kept.
    pub async fn add_image_tags(&self, file_path: &str, tag_names: &[String]) -> Result<()> {
        if tag_names.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool().begin().await?;
        let image_id = image_id_on(&mut *tx, file_path).await?;
        for name in tag_names {
            let tag_id = get_or_create_tag_on(&mut *tx, name, None).await?;
            sqlx::query("INSERT OR IGNORE INTO image_tags (image_id, tag_id) VALUES (?, ?)")
                .bind(image_id)
                .bind(tag_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Detach the listed tags from an image.
    pub async fn remove_image_tags(
        &self,
        file_path: &str,
        tag_names: &[String],
    ) -> Result<()> {
        if tag_names.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool().begin().await?;
        let image_id = image_id_on(&mut *tx, file_path).await?;
        let mut builder = sqlx::QueryBuilder::new(
            "DELETE FROM image_tags WHERE image_id = ",
        );
        builder.push_bind(image_id);
        builder.push(" AND tag_id IN (SELECT id FROM tags WHERE name IN (");
        let mut separated = builder.separated(", ");
        for name in tag_names {
            separated.push_bind(name);
        }
        builder.push("))");
        builder.build().execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Replace the full tag set of an image.
    pub async fn set_image_tags(&self, file_path: &str, tag_names: &[String]) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        set_image_tags_on(&mut *tx, file_path, tag_names).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Replace the tag set of many images in a single transaction.
    pub async fn batch_set_tags(
        &self,
        file_paths: &[String],
        tag_names: &[String],
    ) -> Result<usize> {
        let mut tx = self.pool().begin().await?;
        let mut written = 0usize;
        for path in file_paths {
            match set_image_tags_on(&mut *tx, path, tag_names).await {
                Ok(()) => written += 1,
                Err(CoreError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        tx.commit().await?;
        info!(written, tags = tag_names.len(), "batch tag write");
        Ok(written)
    }

    pub async fn get_image_tags(&self, file_path: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT t.name FROM tags t
            JOIN image_tags it ON it.tag_id = t.id
            JOIN image_metadata m ON m.id = it.image_id
            WHERE m.file_path = ?
            ORDER BY t.name
            "#,
        )
        .bind(file_path)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|r| r.get("name")).collect())
    }

    /// Tags for many images in one query.
    pub async fn get_image_tags_batch(
        &self,
        file_paths: &[String],
    ) -> Result<HashMap<String, Vec<String>>> {
        let mut out: HashMap<String, Vec<String>> = file_paths
            .iter()
            .map(|p| (p.clone(), Vec::new()))
            .collect();
        if file_paths.is_empty() {
            return Ok(out);
        }
        let mut builder = sqlx::QueryBuilder::new(
            r#"
            SELECT m.file_path AS file_path, t.name AS name FROM tags t
            JOIN image_tags it ON it.tag_id = t.id
            JOIN image_metadata m ON m.id = it.image_id
            WHERE m.file_path IN (
            "#,
        );
        let mut separated = builder.separated(", ");
        for path in file_paths {
            separated.push_bind(path);
        }
        builder.push(") ORDER BY t.name");
        for row in builder.build().fetch_all(self.pool()).await? {
            let path: String = row.get("file_path");
            if let Some(tags) = out.get_mut(&path) {
                tags.push(row.get("name"));
            }
        }
        Ok(out)
    }

    /// All tag names, optionally restricted to a kind.
    pub async fn get_all_tags(&self, kind: Option<&str>) -> Result<Vec<String>> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query("SELECT name FROM tags WHERE kind = ? ORDER BY name")
                    .bind(kind)
                    .fetch_all(self.pool())
                    .await?
            }
            None => {
                sqlx::query("SELECT name FROM tags ORDER BY name")
                    .fetch_all(self.pool())
                    .await?
            }
        };
        Ok(rows.into_iter().map(|r| r.get("name")).collect())
    }

    /// Distinct tag names carried by images under `directory`.
    pub async fn get_directory_tags(&self, directory: &str) -> Result<Vec<String>> {
        let like = format!("{}/%", directory.trim_end_matches('/'));
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT t.name FROM tags t
            JOIN image_tags it ON it.tag_id = t.id
            JOIN image_metadata m ON m.id = it.image_id
            WHERE m.file_path LIKE ?
            ORDER BY t.name
            "#,
        )
        .bind(&like)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|r| r.get("name")).collect())
    }
}

async fn get_or_create_tag_on(
    conn: &mut SqliteConnection,
    name: &str,
    kind: Option<&str>,
) -> Result<i64> {
    sqlx::query("INSERT OR IGNORE INTO tags (name, kind) VALUES (?, ?)")
        .bind(name)
        .bind(kind)
        .execute(&mut *conn)
        .await?;
    let row = sqlx::query("SELECT id FROM tags WHERE name = ?")
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.get("id"))
}

async fn image_id_on(conn: &mut SqliteConnection, file_path: &str) -> Result<i64> {
    let row = sqlx::query("SELECT id FROM image_metadata WHERE file_path = ?")
        .bind(file_path)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|r| r.get("id"))
        .ok_or_else(|| CoreError::NotFound(std::path::PathBuf::from(file_path)))
}

async fn set_image_tags_on(
    conn: &mut SqliteConnection,
    file_path: &str,
    tag_names: &[String],
) -> Result<()> {
    let image_id = image_id_on(conn, file_path).await?;
    sqlx::query("DELETE FROM image_tags WHERE image_id = ?")
        .bind(image_id)
        .execute(&mut *conn)
        .await?;
    for name in tag_names {
        let tag_id = get_or_create_tag_on(conn, name, None).await?;
        sqlx::query("INSERT OR IGNORE INTO image_tags (image_id, tag_id) VALUES (?, ?)")
            .bind(image_id)
            .bind(tag_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}
