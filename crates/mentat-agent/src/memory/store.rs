use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use tokio_rusqlite::Connection;

/// A stored document returned from a query, with its relevance score.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub id: String,
    pub document: String,
    pub metadata: Value,
    pub score: f64,
}

/// The store behind both logical collections ("chunks" and "goal_stack").
///
/// Query-by-text must be deterministic: identical store content and query
/// yield identical ordering.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn add(&self, collection: &str, id: &str, document: &str, metadata: &Value) -> Result<()>;

    async fn update(&self, collection: &str, id: &str, document: &str, metadata: &Value)
        -> Result<()>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<StoredDocument>>;

    /// Top-k by descending relevance, optionally filtered by top-level
    /// metadata equality.
    async fn query(
        &self,
        collection: &str,
        text: &str,
        top_k: usize,
        filter: Option<&Value>,
    ) -> Result<Vec<StoredDocument>>;

    async fn delete(&self, collection: &str, id: &str) -> Result<()>;
}

/// SQLite-backed store with lexical token-overlap relevance.
///
/// Durable when opened under a directory, otherwise in-memory. Not safe for
/// concurrent writers across processes; callers serialize solves.
pub struct SqliteVectorStore {
    conn: Connection,
}

impl SqliteVectorStore {
    pub async fn open(directory: Option<&Path>) -> Result<Self> {
        let conn = match directory {
            Some(dir) => {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("creating memory directory {}", dir.display()))?;
                Connection::open(dir.join("memory.db"))
                    .await
                    .context("opening memory database")?
            }
            None => Connection::open_in_memory()
                .await
                .context("opening in-memory database")?,
        };

        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS documents (
                    collection TEXT NOT NULL,
                    id TEXT NOT NULL,
                    document TEXT NOT NULL,
                    metadata TEXT NOT NULL,
                    PRIMARY KEY (collection, id)
                )",
                [],
            )?;
            Ok(())
        })
        .await
        .context("initializing memory schema")?;

        Ok(Self { conn })
    }

    async fn upsert(&self, collection: &str, id: &str, document: &str, metadata: &Value) -> Result<()> {
        let collection = collection.to_string();
        let id = id.to_string();
        let document = document.to_string();
        let metadata = metadata.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO documents (collection, id, document, metadata)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![collection, id, document, metadata],
                )?;
                Ok(())
            })
            .await
            .context("writing document")
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn add(&self, collection: &str, id: &str, document: &str, metadata: &Value) -> Result<()> {
        self.upsert(collection, id, document, metadata).await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        document: &str,
        metadata: &Value,
    ) -> Result<()> {
        self.upsert(collection, id, document, metadata).await
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<StoredDocument>> {
        let collection = collection.to_string();
        let id = id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, document, metadata FROM documents
                     WHERE collection = ?1 AND id = ?2",
                )?;
                let mut rows = stmt.query_map(rusqlite::params![collection, id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;
                Ok(rows.next().transpose()?)
            })
            .await
            .context("reading document")?;

        Ok(row.map(|(id, document, metadata)| StoredDocument {
            id,
            document,
            metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
            score: 1.0,
        }))
    }

    async fn query(
        &self,
        collection: &str,
        text: &str,
        top_k: usize,
        filter: Option<&Value>,
    ) -> Result<Vec<StoredDocument>> {
        let collection = collection.to_string();
        let rows: Vec<(String, String, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, document, metadata FROM documents
                     WHERE collection = ?1 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![collection], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .context("querying documents")?;

        let mut scored: Vec<StoredDocument> = rows
            .into_iter()
            .filter_map(|(id, document, metadata)| {
                let metadata: Value = serde_json::from_str(&metadata).unwrap_or(Value::Null);
                if !matches_filter(&metadata, filter) {
                    return None;
                }
                let score = lexical_overlap(text, &document);
                if score <= 0.0 {
                    return None;
                }
                Some(StoredDocument {
                    id,
                    document,
                    metadata,
                    score,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let collection = collection.to_string();
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                    rusqlite::params![collection, id],
                )?;
                Ok(())
            })
            .await
            .context("deleting document")
    }
}

fn matches_filter(metadata: &Value, filter: Option<&Value>) -> bool {
    let Some(Value::Object(wanted)) = filter else {
        return true;
    };
    let Value::Object(have) = metadata else {
        return wanted.is_empty();
    };
    wanted.iter().all(|(key, value)| have.get(key) == Some(value))
}

fn tokens(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Fraction of query tokens present in the document.
fn lexical_overlap(query: &str, document: &str) -> f64 {
    let query_tokens = tokens(query);
    if query_tokens.is_empty() {
        return 0.0;
    }
    let doc_tokens = tokens(document);
    let hits = query_tokens.intersection(&doc_tokens).count();
    hits as f64 / query_tokens.len() as f64
}
