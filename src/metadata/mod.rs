/// Metadata store - per-file records kept in step with each resource root
use crate::{
    db::{format_timestamp, parse_timestamp},
    error::PipelineResult,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

/// Hex-encoded SHA-256 of `content`
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Metadata row for one tracked file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub resource_root_id: String,
    pub path: String,
    /// Hex-encoded SHA-256 of the file content
    pub content_hash: String,
    pub size_bytes: i64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// SQLite access for `file_metadata`
#[derive(Clone)]
pub struct MetadataStore {
    db: SqlitePool,
}

impl MetadataStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn get(&self, resource_root_id: &str, path: &str) -> PipelineResult<Option<FileMetadata>> {
        let row = sqlx::query(
            r#"
            SELECT resource_root_id, path, content_hash, size_bytes, metadata, created_at, updated_at
            FROM file_metadata
            WHERE resource_root_id = ?1 AND path = ?2
            "#,
        )
        .bind(resource_root_id)
        .bind(path)
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(row_to_metadata).transpose()
    }

    /// All records under a root, ordered by path
    pub async fn list(&self, resource_root_id: &str) -> PipelineResult<Vec<FileMetadata>> {
        let rows = sqlx::query(
            r#"
            SELECT resource_root_id, path, content_hash, size_bytes, metadata, created_at, updated_at
            FROM file_metadata
            WHERE resource_root_id = ?1
            ORDER BY path ASC
            "#,
        )
        .bind(resource_root_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(row_to_metadata).collect()
    }

    /// Insert or refresh a record.
    ///
    /// `metadata: None` keeps whatever is stored (an empty object for new rows).
    pub async fn upsert(
        &self,
        resource_root_id: &str,
        path: &str,
        content_hash: &str,
        size_bytes: i64,
        metadata: Option<&serde_json::Value>,
    ) -> PipelineResult<FileMetadata> {
        let now = format_timestamp(Utc::now());
        let keep_existing = metadata.is_none();
        let metadata = match metadata {
            Some(serde_json::Value::Null) | None => "{}".to_string(),
            Some(value) => serde_json::to_string(value)?,
        };

        let row = sqlx::query(
            r#"
            INSERT INTO file_metadata (
                resource_root_id, path, content_hash, size_bytes, metadata, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(resource_root_id, path) DO UPDATE SET
                content_hash = excluded.content_hash,
                size_bytes = excluded.size_bytes,
                metadata = CASE WHEN ?7 THEN file_metadata.metadata ELSE excluded.metadata END,
                updated_at = excluded.updated_at
            RETURNING resource_root_id, path, content_hash, size_bytes, metadata, created_at, updated_at
            "#,
        )
        .bind(resource_root_id)
        .bind(path)
        .bind(content_hash)
        .bind(size_bytes)
        .bind(&metadata)
        .bind(&now)
        .bind(keep_existing)
        .fetch_one(&self.db)
        .await?;

        row_to_metadata(&row)
    }

    /// Move one record. A stale row at the destination is replaced.
    pub async fn rename(&self, resource_root_id: &str, from: &str, to: &str) -> PipelineResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE OR REPLACE file_metadata
            SET path = ?3, updated_at = ?4
            WHERE resource_root_id = ?1 AND path = ?2
            "#,
        )
        .bind(resource_root_id)
        .bind(from)
        .bind(to)
        .bind(format_timestamp(Utc::now()))
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Rewrite the prefix of every record at or below `from_prefix`
    pub async fn rename_prefix(
        &self,
        resource_root_id: &str,
        from_prefix: &str,
        to_prefix: &str,
    ) -> PipelineResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE OR REPLACE file_metadata
            SET path = ?3 || substr(path, length(?2) + 1), updated_at = ?5
            WHERE resource_root_id = ?1 AND (path = ?2 OR path LIKE ?4 ESCAPE '\')
            "#,
        )
        .bind(resource_root_id)
        .bind(from_prefix)
        .bind(to_prefix)
        .bind(children_pattern(from_prefix))
        .bind(format_timestamp(Utc::now()))
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn delete(&self, resource_root_id: &str, path: &str) -> PipelineResult<u64> {
        let result = sqlx::query("DELETE FROM file_metadata WHERE resource_root_id = ?1 AND path = ?2")
            .bind(resource_root_id)
            .bind(path)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }

    /// Delete every record at or below `prefix`
    pub async fn delete_prefix(&self, resource_root_id: &str, prefix: &str) -> PipelineResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM file_metadata
            WHERE resource_root_id = ?1 AND (path = ?2 OR path LIKE ?3 ESCAPE '\')
            "#,
        )
        .bind(resource_root_id)
        .bind(prefix)
        .bind(children_pattern(prefix))
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }
}

/// LIKE pattern matching everything strictly below `prefix`
fn children_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 2);
    for ch in prefix.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push_str("/%");
    pattern
}

fn row_to_metadata(row: &SqliteRow) -> PipelineResult<FileMetadata> {
    let metadata: String = row.try_get("metadata")?;

    Ok(FileMetadata {
        resource_root_id: row.try_get("resource_root_id")?,
        path: row.try_get("path")?,
        content_hash: row.try_get("content_hash")?,
        size_bytes: row.try_get("size_bytes")?,
        metadata: serde_json::from_str(&metadata)?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;

    async fn create_test_store() -> MetadataStore {
        MetadataStore::new(db::memory_pool().await.unwrap())
    }

    #[tokio::test]
    async fn test_upsert_keeps_metadata_when_absent() {
        let store = create_test_store().await;

        store
            .upsert("notes", "a.md", "h1", 5, Some(&json!({"title": "A"})))
            .await
            .unwrap();
        let refreshed = store.upsert("notes", "a.md", "h2", 7, None).await.unwrap();

        assert_eq!(refreshed.content_hash, "h2");
        assert_eq!(refreshed.size_bytes, 7);
        assert_eq!(refreshed.metadata, json!({"title": "A"}));

        let replaced = store
            .upsert("notes", "a.md", "h2", 7, Some(&json!({"title": "B"})))
            .await
            .unwrap();
        assert_eq!(replaced.metadata, json!({"title": "B"}));
    }

    #[tokio::test]
    async fn test_new_row_without_metadata_gets_empty_object() {
        let store = create_test_store().await;

        let row = store.upsert("notes", "a.md", "h", 0, None).await.unwrap();
        assert_eq!(row.metadata, json!({}));
    }

    #[tokio::test]
    async fn test_rename_prefix_only_touches_children() {
        let store = create_test_store().await;

        for path in ["notes/x.md", "notes/sub/y.md", "notes_other/z.md", "notes"] {
            store.upsert("notes", path, "h", 1, None).await.unwrap();
        }

        let moved = store
            .rename_prefix("notes", "notes", "archive/notes")
            .await
            .unwrap();
        assert_eq!(moved, 3);

        let paths: Vec<String> = store
            .list("notes")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.path)
            .collect();
        assert_eq!(
            paths,
            vec![
                "archive/notes".to_string(),
                "archive/notes/sub/y.md".to_string(),
                "archive/notes/x.md".to_string(),
                "notes_other/z.md".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_rename_replaces_stale_destination() {
        let store = create_test_store().await;

        store.upsert("notes", "a.md", "fresh", 1, None).await.unwrap();
        store.upsert("notes", "b.md", "stale", 1, None).await.unwrap();

        assert_eq!(store.rename("notes", "a.md", "b.md").await.unwrap(), 1);
        assert!(store.get("notes", "a.md").await.unwrap().is_none());
        assert_eq!(
            store.get("notes", "b.md").await.unwrap().unwrap().content_hash,
            "fresh"
        );
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let store = create_test_store().await;

        for path in ["dir/a.md", "dir/b.md", "dir.md"] {
            store.upsert("notes", path, "h", 1, None).await.unwrap();
        }

        assert_eq!(store.delete_prefix("notes", "dir").await.unwrap(), 2);
        assert!(store.get("notes", "dir.md").await.unwrap().is_some());
        assert_eq!(store.delete("notes", "dir.md").await.unwrap(), 1);
    }

    #[test]
    fn test_content_hash() {
        assert_eq!(
            content_hash(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_children_pattern_escapes_wildcards() {
        assert_eq!(children_pattern("a_b%c"), "a\\_b\\%c/%");
    }
}
