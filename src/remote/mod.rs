//! Port to the revisioned document store.
//!
//! The engine only needs two calls: fetch the authoritative document, and
//! write tracks tagged with the revision they were based on. Implementations:
//! - `InMemoryRemote` for embedding and tests
//! - `HttpRemote` for the JSON document service
//! - `storage::DocumentStore` for a local sled database

mod http;
mod memory;

pub use http::HttpRemote;
pub use memory::InMemoryRemote;

use async_trait::async_trait;
use thiserror::Error;

use crate::sync::protocol::{Document, PutRequest, PutResponse};

/// Errors returned by a document remote
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// The submitted revision no longer matches the server's
    #[error("Revision conflict: submitted {submitted}, current {current:?}")]
    Conflict { submitted: u64, current: Option<u64> },

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl RemoteError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, RemoteError::Conflict { .. })
    }
}

#[async_trait]
pub trait DocumentRemote: Send + Sync + 'static {
    /// `GET document(documentId)`
    async fn fetch(&self, document_id: &str) -> Result<Document, RemoteError>;

    /// `PUT document(documentId, {tracks, rev})`
    async fn put(&self, document_id: &str, request: PutRequest) -> Result<PutResponse, RemoteError>;

    /// Fetch, treating a missing document as an empty one at revision 0
    async fn fetch_or_empty(&self, document_id: &str) -> Result<Document, RemoteError> {
        match self.fetch(document_id).await {
            Err(RemoteError::NotFound(_)) => Ok(Document::empty(document_id)),
            other => other,
        }
    }
}
