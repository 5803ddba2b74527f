//! Solution memory: similarity search over past solved tasks.
//!
//! This module provides:
//! - Append-only storage of (bug report, winning patch) pairs
//! - Approximate nearest-neighbor retrieval by embedding similarity
//!
//! Memory is a best-effort optimization, not a correctness dependency:
//! retrieval is bounded by a timeout and degrades to an empty result on any
//! failure. Only successful outcomes are ever stored.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      ┌───────────────────┐
//! │ Orchestrator │─────▶│      Memory       │  (timeout guard)
//! └──────────────┘      └────────┬──────────┘
//!                                │
//!                       ┌────────┴──────────┐
//!                       │ SqliteMemoryStore │
//!                       └───┬──────────┬────┘
//!                           ▼          ▼
//!                     ┌─────────┐ ┌──────────┐
//!                     │ SQLite  │ │ Embedder │
//!                     └─────────┘ └──────────┘
//! ```

mod embed;
mod store;

pub use embed::{Embedder, HashEmbedder, OpenRouterEmbedder};
pub use store::SqliteMemoryStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::task::Patch;

/// Outcome tag on a memory record.
///
/// Only `Succeeded` records are eligible for storage; the tag exists so the
/// contract is explicit at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryOutcome {
    Succeeded,
    Failed,
}

/// A past solved task: bug description, the patch that fixed it, and how
/// often it has been retrieved since.
///
/// Records are immutable once written; the reference count is the only field
/// the store updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub description: String,
    pub patch: Patch,
    pub outcome: MemoryOutcome,
    /// Cosine similarity to the query, set at retrieval time
    pub similarity: f32,
    /// How often this record has been retrieved
    pub references: u64,
    pub created_at: DateTime<Utc>,
}

/// Contract for a similarity store of past solutions.
#[async_trait]
pub trait MemoryClient: Send + Sync {
    /// Return up to `k` records, most similar first.
    async fn retrieve(&self, query: &str, k: usize) -> anyhow::Result<Vec<MemoryRecord>>;

    /// Append a record. Implementations must reject non-successful outcomes.
    async fn store(&self, query: &str, patch: &Patch, outcome: MemoryOutcome)
        -> anyhow::Result<()>;
}

/// Timeout-guarded front for a [`MemoryClient`].
///
/// All failures are recovered locally: retrieval returns an empty sequence,
/// store logs and drops. Neither ever blocks a task beyond the configured
/// timeout or surfaces an error to the orchestrator.
#[derive(Clone)]
pub struct Memory {
    client: Option<Arc<dyn MemoryClient>>,
    timeout: Duration,
}

impl Memory {
    pub fn new(client: Arc<dyn MemoryClient>, timeout: Duration) -> Self {
        Self {
            client: Some(client),
            timeout,
        }
    }

    /// A memory that always returns nothing and stores nothing.
    pub fn disabled() -> Self {
        Self {
            client: None,
            timeout: Duration::from_millis(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Retrieve similar past solutions; empty on timeout or error.
    pub async fn retrieve(&self, query: &str, k: usize) -> Vec<MemoryRecord> {
        let Some(client) = &self.client else {
            return Vec::new();
        };

        match tokio::time::timeout(self.timeout, client.retrieve(query, k)).await {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                tracing::warn!("Memory retrieval failed, continuing without: {}", e);
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(
                    "Memory retrieval timed out after {:?}, continuing without",
                    self.timeout
                );
                Vec::new()
            }
        }
    }

    /// Store a solved task. Best effort; failures are logged and dropped.
    pub async fn store(&self, query: &str, patch: &Patch, outcome: MemoryOutcome) {
        let Some(client) = &self.client else {
            return;
        };

        match tokio::time::timeout(self.timeout, client.store(query, patch, outcome)).await {
            Ok(Ok(())) => tracing::debug!("Stored solution in memory"),
            Ok(Err(e)) => tracing::warn!("Memory store failed: {}", e),
            Err(_) => tracing::warn!("Memory store timed out after {:?}", self.timeout),
        }
    }
}

/// Initialize the memory subsystem.
///
/// Returns a disabled memory when the subsystem is turned off or the store
/// cannot be opened. Uses OpenRouter embeddings when an API key is present,
/// otherwise a deterministic local embedder so retrieval still works offline.
pub async fn init_memory(config: &MemoryConfig, api_key: Option<&str>) -> Memory {
    if !config.enabled {
        tracing::info!("Memory subsystem disabled by configuration");
        return Memory::disabled();
    }

    let embedder: Arc<dyn Embedder> = match api_key {
        Some(key) if !key.trim().is_empty() => Arc::new(OpenRouterEmbedder::new(
            key.to_string(),
            config.embed_model.clone(),
            config.embed_dimension,
        )),
        _ => {
            tracing::info!("No API key; memory uses local hash embeddings");
            Arc::new(HashEmbedder::new(256))
        }
    };

    match SqliteMemoryStore::open(&config.db_path, embedder).await {
        Ok(store) => {
            tracing::info!("Memory subsystem initialized at {:?}", config.db_path);
            Memory::new(Arc::new(store), config.retrieve_timeout())
        }
        Err(e) => {
            tracing::warn!("Could not open memory store ({}); memory disabled", e);
            Memory::disabled()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::PatchChange;

    struct UnavailableClient;

    #[async_trait]
    impl MemoryClient for UnavailableClient {
        async fn retrieve(&self, _query: &str, _k: usize) -> anyhow::Result<Vec<MemoryRecord>> {
            anyhow::bail!("backend unreachable")
        }

        async fn store(
            &self,
            _query: &str,
            _patch: &Patch,
            _outcome: MemoryOutcome,
        ) -> anyhow::Result<()> {
            anyhow::bail!("backend unreachable")
        }
    }

    struct HangingClient;

    #[async_trait]
    impl MemoryClient for HangingClient {
        async fn retrieve(&self, _query: &str, _k: usize) -> anyhow::Result<Vec<MemoryRecord>> {
            futures::future::pending().await
        }

        async fn store(
            &self,
            _query: &str,
            _patch: &Patch,
            _outcome: MemoryOutcome,
        ) -> anyhow::Result<()> {
            futures::future::pending().await
        }
    }

    fn patch() -> Patch {
        Patch {
            change: PatchChange::Replace {
                path: "a.py".to_string(),
                contents: "pass\n".to_string(),
            },
            iteration: 1,
        }
    }

    #[tokio::test]
    async fn unavailable_backend_returns_empty() {
        let memory = Memory::new(Arc::new(UnavailableClient), Duration::from_millis(100));
        let records = memory.retrieve("off-by-one", 5).await;
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn hanging_backend_bounded_by_timeout() {
        let memory = Memory::new(Arc::new(HangingClient), Duration::from_millis(50));
        let start = std::time::Instant::now();
        let records = memory.retrieve("off-by-one", 5).await;
        assert!(records.is_empty());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn store_failure_never_surfaces() {
        let memory = Memory::new(Arc::new(UnavailableClient), Duration::from_millis(100));
        // Must not panic or propagate.
        memory.store("bug", &patch(), MemoryOutcome::Succeeded).await;
    }

    #[tokio::test]
    async fn disabled_memory_is_inert() {
        let memory = Memory::disabled();
        assert!(!memory.is_enabled());
        assert!(memory.retrieve("anything", 3).await.is_empty());
    }
}
