//! Sled-based storage implementation for revisioned documents.
//!
//! This module provides persistent storage with optimistic concurrency:
//! - Current document per id, replaced by compare-and-swap on the stored bytes
//! - Per-revision snapshot history with compaction
//! - Metadata management

use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::{DocumentMetadata, StorageConfig};
use crate::remote::{DocumentRemote, RemoteError};
use crate::sync::protocol::{Document, PutRequest, PutResponse, Track};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Revision mismatch: expected {expected}, current {current}")]
    RevisionMismatch { expected: u64, current: u64 },

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Tree names for different data types
const TREE_DOCUMENTS: &str = "documents";
const TREE_METADATA: &str = "metadata";
const TREE_REVISIONS: &str = "revisions";

/// Sled-based revisioned document store
#[derive(Clone)]
pub struct DocumentStore {
    db: Arc<Db>,
    documents: Tree,
    metadata: Tree,
    revisions: Tree,
    config: StorageConfig,
}

impl DocumentStore {
    /// Open or create a document store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let documents = db.open_tree(TREE_DOCUMENTS)?;
        let metadata = db.open_tree(TREE_METADATA)?;
        let revisions = db.open_tree(TREE_REVISIONS)?;

        Ok(Self {
            db: Arc::new(db),
            documents,
            metadata,
            revisions,
            config,
        })
    }

    /// Load the current revision of a document
    pub fn get_document(&self, document_id: &str) -> StorageResult<Option<Document>> {
        match self.documents.get(document_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Replace a document's tracks if its stored revision is `expected_rev`.
    ///
    /// A missing document is at revision 0. On success the stored revision is
    /// `expected_rev + 1`.
    pub fn put_document(
        &self,
        document_id: &str,
        expected_rev: u64,
        tracks: Vec<Track>,
    ) -> StorageResult<Document> {
        let key = document_id.as_bytes();
        let current = self.documents.get(key)?;
        let current_rev = match &current {
            Some(bytes) => serde_json::from_slice::<Document>(bytes)?.rev,
            None => 0,
        };

        if current_rev != expected_rev {
            return Err(StorageError::RevisionMismatch {
                expected: expected_rev,
                current: current_rev,
            });
        }

        let next = Document {
            id: document_id.to_string(),
            rev: current_rev + 1,
            tracks,
        };
        let bytes = serde_json::to_vec(&next)?;

        // Another writer may have landed between the read and here
        if let Err(cas) = self
            .documents
            .compare_and_swap(key, current, Some(bytes.clone()))?
        {
            let current = match cas.current {
                Some(bytes) => serde_json::from_slice::<Document>(&bytes)?.rev,
                None => 0,
            };
            return Err(StorageError::RevisionMismatch {
                expected: expected_rev,
                current,
            });
        }

        self.revisions
            .insert(revision_key(document_id, next.rev).as_bytes(), bytes)?;
        self.touch_metadata(&next)?;
        self.compact_revisions(document_id, self.config.revision_history)?;

        debug!("Stored document {} at rev {}", document_id, next.rev);
        Ok(next)
    }

    /// Load a historical snapshot
    pub fn load_revision(&self, document_id: &str, rev: u64) -> StorageResult<Option<Document>> {
        match self.revisions.get(revision_key(document_id, rev).as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Revisions with a stored snapshot, oldest first
    pub fn list_revisions(&self, document_id: &str) -> StorageResult<Vec<u64>> {
        let prefix = format!("{}:", document_id);
        let mut revs = Vec::new();
        for item in self.revisions.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            let key_str = String::from_utf8_lossy(&key);
            if let Some(rev) = key_str.rsplit(':').next().and_then(|r| r.parse().ok()) {
                revs.push(rev);
            }
        }
        Ok(revs)
    }

    /// Drop all but the `keep_recent` newest snapshots
    pub fn compact_revisions(&self, document_id: &str, keep_recent: usize) -> StorageResult<usize> {
        let prefix = format!("{}:", document_id);
        let total = self.revisions.scan_prefix(prefix.as_bytes()).count();
        if total <= keep_recent {
            return Ok(0);
        }

        let mut removed = 0;
        for item in self
            .revisions
            .scan_prefix(prefix.as_bytes())
            .take(total - keep_recent)
        {
            let (key, _) = item?;
            self.revisions.remove(key)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Check if a document exists
    pub fn document_exists(&self, document_id: &str) -> StorageResult<bool> {
        Ok(self.documents.contains_key(document_id.as_bytes())?)
    }

    /// Delete a document and all associated data
    pub fn delete_document(&self, document_id: &str) -> StorageResult<()> {
        let key = document_id.as_bytes();
        self.documents.remove(key)?;
        self.metadata.remove(key)?;

        let prefix = format!("{}:", document_id);
        let mut to_remove = Vec::new();
        for item in self.revisions.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            to_remove.push(key);
        }
        for key in to_remove {
            self.revisions.remove(key)?;
        }

        Ok(())
    }

    /// Save document metadata
    pub fn save_metadata(&self, meta: &DocumentMetadata) -> StorageResult<()> {
        let bytes = bincode::serialize(meta)?;
        self.metadata.insert(meta.document_id.as_bytes(), bytes)?;
        Ok(())
    }

    /// Load document metadata
    pub fn get_metadata(&self, document_id: &str) -> StorageResult<Option<DocumentMetadata>> {
        match self.metadata.get(document_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List all documents with metadata
    pub fn list_documents(&self) -> StorageResult<Vec<DocumentMetadata>> {
        let mut docs = Vec::new();
        for item in self.metadata.iter() {
            let (_, value) = item?;
            docs.push(bincode::deserialize(&value)?);
        }
        Ok(docs)
    }

    fn touch_metadata(&self, document: &Document) -> StorageResult<()> {
        let mut meta = self
            .get_metadata(&document.id)?
            .unwrap_or_else(|| DocumentMetadata::new(&document.id, &document.id));
        meta.updated_at = chrono::Utc::now().timestamp();
        meta.rev = document.rev;
        meta.clip_count = document.subtitle_clips().len() as u64;
        self.save_metadata(&meta)
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            document_count: self.documents.len(),
            total_size_bytes: self.db.size_on_disk().unwrap_or(0),
            metadata_count: self.metadata.len(),
            revision_count: self.revisions.len(),
        }
    }
}

fn revision_key(document_id: &str, rev: u64) -> String {
    format!("{}:{:020}", document_id, rev)
}

/// Statistics about the storage
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub document_count: usize,
    pub total_size_bytes: u64,
    pub metadata_count: usize,
    pub revision_count: usize,
}

impl Drop for DocumentStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}

#[async_trait]
impl DocumentRemote for DocumentStore {
    async fn fetch(&self, document_id: &str) -> Result<Document, RemoteError> {
        self.get_document(document_id)
            .map_err(|e| RemoteError::Transport(e.to_string()))?
            .ok_or_else(|| RemoteError::NotFound(document_id.to_string()))
    }

    async fn put(&self, document_id: &str, request: PutRequest) -> Result<PutResponse, RemoteError> {
        match self.put_document(document_id, request.rev, request.tracks) {
            Ok(doc) => Ok(PutResponse {
                success: true,
                rev: doc.rev,
                tracks: doc.tracks,
            }),
            Err(StorageError::RevisionMismatch { expected, current }) => Err(RemoteError::Conflict {
                submitted: expected,
                current: Some(current),
            }),
            Err(e) => Err(RemoteError::Transport(e.to_string())),
        }
    }
}
