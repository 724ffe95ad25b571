//! In-process document remote.
//!
//! Keeps documents in a `DashMap` and enforces the same revision check as the
//! real service. It also records every write and can inject failures or
//! simulate another actor writing concurrently.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

use super::{DocumentRemote, RemoteError};
use crate::sync::protocol::{Document, PutRequest, PutResponse, Track};

#[derive(Default)]
pub struct InMemoryRemote {
    documents: DashMap<String, Document>,
    writes: Mutex<Vec<(String, PutRequest)>>,
    fetches: Mutex<usize>,
    injected: Mutex<VecDeque<RemoteError>>,
    latency: Option<Duration>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` (on the tokio clock)
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert(&self, document: Document) {
        self.documents.insert(document.id.clone(), document);
    }

    pub fn document(&self, document_id: &str) -> Option<Document> {
        self.documents.get(document_id).map(|d| d.clone())
    }

    /// Apply a write from another actor, bumping the revision
    pub fn update_external<F>(&self, document_id: &str, f: F) -> Document
    where
        F: FnOnce(&mut Vec<Track>),
    {
        let mut entry = self
            .documents
            .entry(document_id.to_string())
            .or_insert_with(|| Document::empty(document_id));
        f(&mut entry.tracks);
        entry.rev += 1;
        entry.clone()
    }

    /// Fail the next `put` with `error` instead of applying it
    pub fn fail_next_put(&self, error: RemoteError) {
        self.injected.lock().push_back(error);
    }

    /// Every write attempted, in order, including rejected ones
    pub fn writes(&self) -> Vec<(String, PutRequest)> {
        self.writes.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn fetch_count(&self) -> usize {
        *self.fetches.lock()
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl DocumentRemote for InMemoryRemote {
    async fn fetch(&self, document_id: &str) -> Result<Document, RemoteError> {
        self.delay().await;
        *self.fetches.lock() += 1;
        self.document(document_id)
            .ok_or_else(|| RemoteError::NotFound(document_id.to_string()))
    }

    async fn put(&self, document_id: &str, request: PutRequest) -> Result<PutResponse, RemoteError> {
        self.delay().await;
        self.writes
            .lock()
            .push((document_id.to_string(), request.clone()));

        if let Some(error) = self.injected.lock().pop_front() {
            return Err(error);
        }

        let mut entry = self
            .documents
            .entry(document_id.to_string())
            .or_insert_with(|| Document::empty(document_id));

        if entry.rev != request.rev {
            return Err(RemoteError::Conflict {
                submitted: request.rev,
                current: Some(entry.rev),
            });
        }

        entry.rev += 1;
        entry.tracks = request.tracks;

        Ok(PutResponse {
            success: true,
            rev: entry.rev,
            tracks: entry.tracks.clone(),
        })
    }
}
