//! SQLite-backed [`VectorStore`] implementation.
//!
//! Collections are rows in `collections`; records live in `records` with
//! their metadata as a JSON object and their embedding as a little-endian
//! f32 BLOB. Similarity search loads a collection's vectors and ranks them
//! by brute-force cosine similarity.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use docent_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use docent_core::store::{
    Metadata, MetadataFilter, MetadataValue, ScoredRecord, VectorRecord, VectorStore,
};

/// SQLite implementation of the [`VectorStore`] trait.
pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_exists(&self, name: &str) -> Result<()> {
        if !self.collection_exists(name).await? {
            bail!("collection '{}' does not exist", name);
        }
        Ok(())
    }
}

/// JSON path for a metadata key. Keys are fixed identifiers, never user input.
fn json_path(key: &str) -> String {
    format!("$.{}", key)
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<VectorRecord> {
    let metadata_json: String = row.get("metadata_json");
    let metadata: Metadata = serde_json::from_str(&metadata_json)?;
    let blob: Vec<u8> = row.get("embedding");
    Ok(VectorRecord {
        id: row.get("id"),
        embedding: blob_to_vec(&blob),
        document: row.get("document"),
        metadata,
    })
}

/// Binds a filter value the way `json_extract` reports it back.
fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: &MetadataValue,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match value {
        MetadataValue::Str(s) => query.bind(s.clone()),
        MetadataValue::Int(i) => query.bind(*i),
        // JSON booleans come out of json_extract as 0 / 1.
        MetadataValue::Bool(b) => query.bind(i64::from(*b)),
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn collection_exists(&self, name: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM collections WHERE name = ?")
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn create_collection(&self, name: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO collections (name, created_at) VALUES (?, ?)")
            .bind(name)
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM records WHERE collection = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn count(&self, name: &str) -> Result<usize> {
        self.ensure_exists(name).await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE collection = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn add(&self, name: &str, records: Vec<VectorRecord>) -> Result<()> {
        if records.len() > self.max_batch_size() {
            bail!(
                "batch of {} records exceeds store limit of {}",
                records.len(),
                self.max_batch_size()
            );
        }
        self.ensure_exists(name).await?;

        let mut tx = self.pool.begin().await?;
        for record in &records {
            let metadata_json = serde_json::to_string(&record.metadata)?;
            sqlx::query(
                r#"
                INSERT INTO records (collection, id, document, metadata_json, embedding)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(collection, id) DO UPDATE SET
                    document = excluded.document,
                    metadata_json = excluded.metadata_json,
                    embedding = excluded.embedding
                "#,
            )
            .bind(name)
            .bind(&record.id)
            .bind(&record.document)
            .bind(&metadata_json)
            .bind(vec_to_blob(&record.embedding))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        name: &str,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredRecord>> {
        self.ensure_exists(name).await?;
        let rows = sqlx::query(
            "SELECT id, document, metadata_json, embedding FROM records WHERE collection = ?",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = row_to_record(row)?;
            scored.push(ScoredRecord {
                score: cosine_similarity(embedding, &record.embedding),
                record,
            });
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn get_where(&self, name: &str, filter: &MetadataFilter) -> Result<Vec<VectorRecord>> {
        self.ensure_exists(name).await?;
        let query = sqlx::query(
            r#"
            SELECT id, document, metadata_json, embedding FROM records
            WHERE collection = ? AND json_extract(metadata_json, ?) = ?
            "#,
        )
        .bind(name)
        .bind(json_path(&filter.key));
        let rows = bind_value(query, &filter.value)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn delete_where(&self, name: &str, filter: &MetadataFilter) -> Result<usize> {
        self.ensure_exists(name).await?;
        let query = sqlx::query(
            "DELETE FROM records WHERE collection = ? AND json_extract(metadata_json, ?) = ?",
        )
        .bind(name)
        .bind(json_path(&filter.key));
        let removed = bind_value(query, &filter.value)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed as usize)
    }
}
