//! Open-document lifecycle.
//!
//! A `DocumentSession` is created when a document is loaded and torn down when
//! it is closed. It owns the document's synchronizer task and hands out editor
//! surfaces wired to the same bus channel. Nothing here is shared between
//! documents.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::bus::{ChangeBus, DocumentChannel};
use super::scheduler::{Scheduler, TokioScheduler};
use super::synchronizer::{self, SyncHandle, SyncStatus};
use super::{DocumentId, SyncConfig, SyncResult};
use crate::editor::SegmentEditor;
use crate::remote::DocumentRemote;

pub struct DocumentSession {
    document_id: DocumentId,
    bus: ChangeBus,
    channel: DocumentChannel,
    sync: SyncHandle,
    task: JoinHandle<()>,
    config: SyncConfig,
}

impl DocumentSession {
    /// Fetch `document_id` and start synchronizing it
    pub async fn open(
        document_id: impl Into<DocumentId>,
        remote: Arc<dyn DocumentRemote>,
        bus: ChangeBus,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        Self::open_with_scheduler(document_id, remote, bus, config, Arc::new(TokioScheduler)).await
    }

    pub async fn open_with_scheduler(
        document_id: impl Into<DocumentId>,
        remote: Arc<dyn DocumentRemote>,
        bus: ChangeBus,
        config: SyncConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> SyncResult<Self> {
        let document_id = document_id.into();
        let mut document = remote.fetch_or_empty(&document_id).await?;
        if document.id.is_empty() {
            document.id = document_id.clone();
        }

        info!(
            "Opened document {} at rev {} with {} segments",
            document_id,
            document.rev,
            document.subtitle_clips().len()
        );

        let channel = bus.channel(&document_id);
        let (sync, task) =
            synchronizer::spawn(document, remote, scheduler, channel.clone(), config.clone());

        Ok(Self {
            document_id,
            bus,
            channel,
            sync,
            task,
            config,
        })
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn sync(&self) -> &SyncHandle {
        &self.sync
    }

    /// New editor surface, hydrated from the last acknowledged document
    pub fn editor(&self) -> SegmentEditor {
        let mut editor = SegmentEditor::new(
            &self.channel,
            self.sync.clone(),
            self.config.default_segment_duration,
        );
        editor.refresh(&self.sync.latest_document());
        editor
    }

    /// Save anything pending, stop the synchronizer and drop the bus channel
    pub async fn close(self) -> SyncStatus {
        if self.sync.close().is_ok() {
            if let Err(e) = self.task.await {
                warn!("Synchronizer for {} ended abnormally: {}", self.document_id, e);
            }
        }
        self.bus.close(&self.document_id);

        let status = self.sync.status();
        info!(
            "Closed document {} at rev {} (unsynced: {})",
            self.document_id, status.rev, status.unsynced
        );
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{InMemoryRemote, RemoteError};
    use crate::sync::SyncError;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_open_missing_document_starts_empty() {
        let remote = Arc::new(InMemoryRemote::new());
        let bus = SyncConfig::default().change_bus();
        let session = DocumentSession::open("new-doc", remote.clone(), bus.clone(), SyncConfig::default())
            .await
            .unwrap();

        assert_eq!(session.document_id(), "new-doc");
        assert_eq!(session.sync().status().rev, 0);
        assert!(session.editor().segments().is_empty());
        assert_eq!(bus.channel_count(), 1);

        let status = session.close().await;
        assert_eq!(status.rev, 0);
        assert_eq!(bus.channel_count(), 0);
        assert_eq!(remote.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_saves_pending_edits() {
        let remote = Arc::new(InMemoryRemote::new());
        let config = SyncConfig::default().with_debounce(Duration::from_secs(10));
        let session = DocumentSession::open("doc", remote.clone(), ChangeBus::new(), config)
            .await
            .unwrap();
        let mut editor = session.editor();
        editor.append();
        editor.edit_text(0, "Goodbye").unwrap();
        let sync = session.sync().clone();

        let status = session.close().await;

        assert_eq!(status.rev, 1);
        assert_eq!(remote.write_count(), 1);
        assert_eq!(remote.document("doc").unwrap().subtitle_clips()[0].text, "Goodbye");
        assert_eq!(sync.notify(vec![]), Err(SyncError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_surfaces_transport_error() {
        struct Down;

        #[async_trait::async_trait]
        impl DocumentRemote for Down {
            async fn fetch(&self, _: &str) -> Result<crate::sync::protocol::Document, RemoteError> {
                Err(RemoteError::Transport("connection refused".to_string()))
            }

            async fn put(
                &self,
                _: &str,
                _: crate::sync::protocol::PutRequest,
            ) -> Result<crate::sync::protocol::PutResponse, RemoteError> {
                Err(RemoteError::Transport("connection refused".to_string()))
            }
        }

        let result = DocumentSession::open("doc", Arc::new(Down), ChangeBus::new(), SyncConfig::default()).await;
        assert!(matches!(result, Err(SyncError::Transport(_))));
    }
}
