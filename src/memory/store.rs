//! SQLite-backed append-only memory store.
//!
//! Records are never updated or deleted after insertion; the only mutation
//! is the retrieval reference count. Similarity search is brute-force cosine
//! over the stored embeddings, which is plenty for a per-team solution
//! memory (thousands of records, not millions).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::embed::Embedder;
use super::{MemoryClient, MemoryOutcome, MemoryRecord};
use crate::task::Patch;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS memory_records (
    id TEXT PRIMARY KEY NOT NULL,
    description TEXT NOT NULL,
    embedding TEXT NOT NULL,
    patch TEXT NOT NULL,
    outcome TEXT NOT NULL,
    ref_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memory_created_at ON memory_records(created_at DESC);
"#;

pub struct SqliteMemoryStore {
    conn: Arc<Mutex<Connection>>,
    embedder: Arc<dyn Embedder>,
}

impl SqliteMemoryStore {
    /// Open (and create if needed) the store at `path`.
    pub async fn open(path: &Path, embedder: Arc<dyn Embedder>) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            embedder,
        })
    }

    /// In-memory store (for testing).
    pub async fn open_in_memory(embedder: Arc<dyn Embedder>) -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            embedder,
        })
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl MemoryClient for SqliteMemoryStore {
    async fn retrieve(&self, query: &str, k: usize) -> anyhow::Result<Vec<MemoryRecord>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_embedding = self.embedder.embed(query).await?;

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, description, embedding, patch, outcome, ref_count, created_at
             FROM memory_records",
        )?;

        let mut scored: Vec<MemoryRecord> = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .filter_map(|row| {
                let (id, description, embedding, patch, outcome, ref_count, created_at) =
                    row.ok()?;
                let embedding: Vec<f32> = serde_json::from_str(&embedding).ok()?;
                let patch: Patch = serde_json::from_str(&patch).ok()?;
                let outcome = match outcome.as_str() {
                    "succeeded" => MemoryOutcome::Succeeded,
                    _ => return None,
                };
                Some(MemoryRecord {
                    id: Uuid::parse_str(&id).ok()?,
                    description,
                    patch,
                    outcome,
                    similarity: cosine_similarity(&query_embedding, &embedding),
                    references: ref_count.max(0) as u64,
                    created_at: created_at
                        .parse::<DateTime<Utc>>()
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);

        // Count the retrieval on each returned record.
        for record in &mut scored {
            conn.execute(
                "UPDATE memory_records SET ref_count = ref_count + 1 WHERE id = ?1",
                params![record.id.to_string()],
            )?;
            record.references += 1;
        }

        Ok(scored)
    }

    async fn store(
        &self,
        query: &str,
        patch: &Patch,
        outcome: MemoryOutcome,
    ) -> anyhow::Result<()> {
        if outcome != MemoryOutcome::Succeeded {
            tracing::debug!("Refusing to store non-successful outcome in memory");
            return Ok(());
        }

        let embedding = self.embedder.embed(query).await?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO memory_records (id, description, embedding, patch, outcome, ref_count, created_at)
             VALUES (?1, ?2, ?3, ?4, 'succeeded', 0, ?5)",
            params![
                Uuid::new_v4().to_string(),
                query,
                serde_json::to_string(&embedding)?,
                serde_json::to_string(patch)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HashEmbedder;
    use crate::task::PatchChange;

    fn patch(path: &str) -> Patch {
        Patch {
            change: PatchChange::Replace {
                path: path.to_string(),
                contents: "fixed\n".to_string(),
            },
            iteration: 2,
        }
    }

    async fn store() -> SqliteMemoryStore {
        SqliteMemoryStore::open_in_memory(Arc::new(HashEmbedder::new(64)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn retrieve_orders_by_similarity() {
        let store = store().await;
        store
            .store(
                "off-by-one error in pagination logic",
                &patch("pagination.py"),
                MemoryOutcome::Succeeded,
            )
            .await
            .unwrap();
        store
            .store(
                "race condition in websocket handshake",
                &patch("ws.py"),
                MemoryOutcome::Succeeded,
            )
            .await
            .unwrap();

        let records = store
            .retrieve("pagination off-by-one bug", 2)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].patch.path(), "pagination.py");
        assert!(records[0].similarity >= records[1].similarity);
    }

    #[tokio::test]
    async fn failed_outcomes_are_not_stored() {
        let store = store().await;
        store
            .store("some bug", &patch("a.py"), MemoryOutcome::Failed)
            .await
            .unwrap();
        assert!(store.retrieve("some bug", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retrieval_increments_reference_count() {
        let store = store().await;
        store
            .store("bug one", &patch("a.py"), MemoryOutcome::Succeeded)
            .await
            .unwrap();

        let first = store.retrieve("bug one", 1).await.unwrap();
        assert_eq!(first[0].references, 1);
        let second = store.retrieve("bug one", 1).await.unwrap();
        assert_eq!(second[0].references, 2);
    }

    #[tokio::test]
    async fn k_limits_result_count() {
        let store = store().await;
        for i in 0..5 {
            store
                .store(&format!("bug {}", i), &patch("a.py"), MemoryOutcome::Succeeded)
                .await
                .unwrap();
        }
        assert_eq!(store.retrieve("bug", 3).await.unwrap().len(), 3);
        assert!(store.retrieve("bug", 0).await.unwrap().is_empty());
    }
}
