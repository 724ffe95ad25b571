//! Storage module for revisioned caption documents using Sled.
//!
//! This is the reference implementation of the remote document store: each
//! write is checked against the stored revision with an atomic
//! compare-and-swap, so concurrent writers based on the same revision cannot
//! both succeed.

mod sled_store;

pub use sled_store::{DocumentStore, StorageError, StorageResult, StorageStats};

use serde::{Deserialize, Serialize};

/// Metadata stored alongside each document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Unique document identifier
    pub document_id: String,
    /// Human-readable name
    pub name: String,
    /// Unix timestamp of creation
    pub created_at: i64,
    /// Unix timestamp of last modification
    pub updated_at: i64,
    /// Current revision
    pub rev: u64,
    /// Clips in the subtitle track at the current revision
    pub clip_count: u64,
}

impl DocumentMetadata {
    pub fn new(document_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            document_id: document_id.into(),
            name: name.into(),
            created_at: now,
            updated_at: now,
            rev: 0,
            clip_count: 0,
        }
    }
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = only on explicit flush)
    pub flush_interval_ms: u64,
    /// Snapshots kept per document; older revisions are compacted away
    pub revision_history: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/segments.sled".to_string(),
            cache_size: 256 * 1024 * 1024, // 256MB
            flush_interval_ms: 500,
            revision_history: 50,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_revision_history(mut self, keep: usize) -> Self {
        self.revision_history = keep;
        self
    }
}
