//! Persistence synchronizer.
//!
//! One actor task per open document owns all save bookkeeping:
//! - Debounces local mutations before writing
//! - Keeps at most one write in flight and coalesces edits made meanwhile
//! - Tags each write with the last acknowledged revision
//! - Hands revision conflicts to the `ConflictReconciler`
//! - Publishes acknowledged server clips on the document's bus channel
//!
//! Editors talk to it through a cheap, clonable `SyncHandle`.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::bus::{DocumentChannel, Lane};
use super::protocol::{Document, PutRequest};
use super::reconcile::{acknowledged, ConflictReconciler};
use super::scheduler::Scheduler;
use super::{DocumentId, SyncConfig, SyncError, SyncResult};
use crate::remote::{DocumentRemote, RemoteError};
use crate::segment::{from_clips, to_clips, MergeSource, Segment};

/// Where the synchronizer is in its save cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Debouncing,
    Writing,
    /// A write was rejected for a stale revision and is being reconciled
    Conflicted,
}

/// Observable synchronizer state
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    /// Last acknowledged revision
    pub rev: u64,
    /// The last write failed and local edits are not on the server
    pub unsynced: bool,
    pub last_error: Option<SyncError>,
    /// Acknowledged writes
    pub writes: u64,
    /// Writes that needed reconciliation and then succeeded
    pub conflicts_resolved: u64,
}

impl SyncStatus {
    fn new(rev: u64) -> Self {
        Self {
            phase: SyncPhase::Idle,
            rev,
            unsynced: false,
            last_error: None,
            writes: 0,
            conflicts_resolved: 0,
        }
    }

    /// Whether server state may be applied without racing a local write
    pub fn is_settled(&self) -> bool {
        self.phase == SyncPhase::Idle && !self.unsynced
    }
}

/// Result of one write, reconciled or not
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Saved {
        document: Document,
        /// Reconcile attempts needed; 0 when the first write went through
        reconcile_attempts: u32,
    },
    Failed(SyncError),
}

#[derive(Debug)]
enum SyncCommand {
    Changed(Vec<Segment>),
    CompositionStarted,
    CompositionEnded,
    Blur,
    Flush(oneshot::Sender<SyncStatus>),
    Close,
}

/// Handle to a document's synchronizer
#[derive(Clone)]
pub struct SyncHandle {
    document_id: DocumentId,
    commands: mpsc::UnboundedSender<SyncCommand>,
    status: watch::Receiver<SyncStatus>,
    document: watch::Receiver<Arc<Document>>,
}

impl SyncHandle {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    fn send(&self, command: SyncCommand) -> SyncResult<()> {
        self.commands.send(command).map_err(|_| SyncError::Closed)
    }

    /// Report the latest local segment list
    pub fn notify(&self, segments: Vec<Segment>) -> SyncResult<()> {
        self.send(SyncCommand::Changed(segments))
    }

    /// Input composition opened; saves are held until it ends
    pub fn composition_started(&self) -> SyncResult<()> {
        self.send(SyncCommand::CompositionStarted)
    }

    /// Input composition closed; forces one save
    pub fn composition_ended(&self) -> SyncResult<()> {
        self.send(SyncCommand::CompositionEnded)
    }

    /// Editor lost focus; forces one save
    pub fn blur(&self) -> SyncResult<()> {
        self.send(SyncCommand::Blur)
    }

    /// Force any pending save and wait until the synchronizer is idle
    pub async fn flush(&self) -> SyncResult<SyncStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(SyncCommand::Flush(tx))?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    pub(crate) fn close(&self) -> SyncResult<()> {
        self.send(SyncCommand::Close)
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Last document acknowledged by the server
    pub fn latest_document(&self) -> Arc<Document> {
        self.document.borrow().clone()
    }
}

/// Start the synchronizer for `document`, as just fetched from `remote`.
pub fn spawn(
    document: Document,
    remote: Arc<dyn DocumentRemote>,
    scheduler: Arc<dyn Scheduler>,
    channel: DocumentChannel,
    config: SyncConfig,
) -> (SyncHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(SyncStatus::new(document.rev));
    let document = Arc::new(document);
    let (document_tx, document_rx) = watch::channel(document.clone());

    let handle = SyncHandle {
        document_id: document.id.clone(),
        commands: commands_tx,
        status: status_rx,
        document: document_rx,
    };

    let reconciler = ConflictReconciler::new(remote.clone(), scheduler.clone(), config.retry_policy());
    let synchronizer = Synchronizer {
        document_id: document.id.clone(),
        remote,
        reconciler,
        scheduler,
        channel,
        config,
        commands: commands_rx,
        status: Arc::new(status_tx),
        document: document_tx,
        base: document,
        pending: None,
        submitted: Vec::new(),
        deadline: None,
        in_flight: None,
        composing: false,
        force: false,
        closing: false,
        flush_waiters: Vec::new(),
    };

    (handle, tokio::spawn(synchronizer.run()))
}

struct Synchronizer {
    document_id: DocumentId,
    remote: Arc<dyn DocumentRemote>,
    reconciler: ConflictReconciler,
    scheduler: Arc<dyn Scheduler>,
    channel: DocumentChannel,
    config: SyncConfig,
    commands: mpsc::UnboundedReceiver<SyncCommand>,
    status: Arc<watch::Sender<SyncStatus>>,
    document: watch::Sender<Arc<Document>>,
    /// Last acknowledged document
    base: Arc<Document>,
    /// Latest local list not yet handed to a write
    pending: Option<Vec<Segment>>,
    /// Local list the in-flight write was built from
    submitted: Vec<Segment>,
    deadline: Option<Instant>,
    in_flight: Option<JoinHandle<SyncOutcome>>,
    composing: bool,
    /// Write the next pending list even while composing
    force: bool,
    closing: bool,
    flush_waiters: Vec<oneshot::Sender<SyncStatus>>,
}

impl Synchronizer {
    async fn run(mut self) {
        info!("Synchronizer started for document {} at rev {}", self.document_id, self.base.rev);

        loop {
            let timer = self
                .deadline
                .filter(|_| self.in_flight.is_none() && !self.composing);

            tokio::select! {
                command = self.commands.recv(), if !self.closing => match command {
                    Some(command) => self.handle(command),
                    None => self.begin_close(),
                },
                outcome = join_write(&mut self.in_flight), if self.in_flight.is_some() => {
                    self.in_flight = None;
                    self.complete(outcome);
                }
                _ = sleep_until(self.scheduler.as_ref(), timer), if timer.is_some() => {
                    self.start_write();
                }
                else => break,
            }

            if self.is_idle() {
                self.resolve_flushes();
                if self.closing {
                    break;
                }
            }
        }

        self.resolve_flushes();
        info!("Synchronizer stopped for document {}", self.document_id);
    }

    fn handle(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::Changed(segments) => {
                self.pending = Some(segments);
                if self.in_flight.is_none() {
                    self.deadline = Some(self.scheduler.now() + self.config.debounce);
                    self.set_phase(SyncPhase::Debouncing);
                }
            }
            SyncCommand::CompositionStarted => self.composing = true,
            SyncCommand::CompositionEnded | SyncCommand::Blur => {
                self.composing = false;
                self.force_save();
            }
            SyncCommand::Flush(waiter) => {
                self.flush_waiters.push(waiter);
                self.force_save();
            }
            SyncCommand::Close => self.begin_close(),
        }
    }

    fn begin_close(&mut self) {
        debug!("Closing synchronizer for document {}", self.document_id);
        self.closing = true;
        self.composing = false;
        self.force_save();
    }

    /// Save now, or right after the in-flight write completes
    fn force_save(&mut self) {
        if self.pending.is_none() {
            return;
        }
        if self.in_flight.is_none() {
            self.start_write();
        } else {
            self.force = true;
        }
    }

    fn start_write(&mut self) {
        let Some(pending) = self.pending.take() else {
            self.deadline = None;
            return;
        };
        self.deadline = None;
        self.force = false;

        // Carry server-owned fields the local copies may lack
        let base_segments = from_clips(self.base.subtitle_clips());
        let outgoing: Vec<Segment> = pending
            .iter()
            .map(|segment| match base_segments.iter().find(|b| b.id == segment.id) {
                Some(server_copy) => segment.merge(server_copy, MergeSource::Write),
                None => segment.clone(),
            })
            .collect();

        let job = WriteJob {
            document_id: self.document_id.clone(),
            remote: self.remote.clone(),
            reconciler: self.reconciler.clone(),
            status: self.status.clone(),
            base: self.base.clone(),
            segments: outgoing,
        };

        debug!(
            "Writing {} segments to document {} at rev {}",
            pending.len(),
            self.document_id,
            self.base.rev
        );
        self.set_phase(SyncPhase::Writing);
        self.submitted = pending;
        self.in_flight = Some(tokio::spawn(job.run()));
    }

    fn complete(&mut self, outcome: SyncOutcome) {
        let submitted = std::mem::take(&mut self.submitted);
        match outcome {
            SyncOutcome::Saved {
                document,
                reconcile_attempts,
            } => {
                debug!("Document {} saved at rev {}", self.document_id, document.rev);
                let document = Arc::new(document);
                self.base = document.clone();
                self.status.send_modify(|status| {
                    status.rev = document.rev;
                    status.unsynced = false;
                    status.last_error = None;
                    status.writes += 1;
                    if reconcile_attempts > 0 {
                        status.conflicts_resolved += 1;
                    }
                });
                self.document.send_replace(document.clone());
                self.channel.publish_ack(
                    Lane::Text,
                    document.subtitle_clips().to_vec(),
                    to_clips(&submitted),
                );
            }
            SyncOutcome::Failed(error) => {
                warn!("Save failed for document {}: {}", self.document_id, error);
                self.status.send_modify(|status| {
                    status.unsynced = true;
                    status.last_error = Some(error);
                });
            }
        }

        if self.pending.is_some() {
            if self.force || !self.composing {
                self.start_write();
            } else {
                self.deadline = Some(self.scheduler.now() + self.config.debounce);
                self.set_phase(SyncPhase::Debouncing);
            }
        } else {
            self.set_phase(SyncPhase::Idle);
        }
    }

    fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_none()
    }

    fn resolve_flushes(&mut self) {
        if self.flush_waiters.is_empty() {
            return;
        }
        let status = self.status.borrow().clone();
        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(status.clone());
        }
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.status.send_if_modified(|status| {
            if status.phase == phase {
                return false;
            }
            status.phase = phase;
            true
        });
    }
}

/// One write plus whatever reconciliation it needs, run off the actor task
struct WriteJob {
    document_id: DocumentId,
    remote: Arc<dyn DocumentRemote>,
    reconciler: ConflictReconciler,
    status: Arc<watch::Sender<SyncStatus>>,
    base: Arc<Document>,
    segments: Vec<Segment>,
}

impl WriteJob {
    async fn run(self) -> SyncOutcome {
        let tracks = self.base.tracks_with_subtitles(to_clips(&self.segments));
        let request = PutRequest {
            tracks: tracks.clone(),
            rev: self.base.rev,
        };

        match self.remote.put(&self.document_id, request).await {
            Ok(response) => SyncOutcome::Saved {
                document: acknowledged(&self.document_id, response, tracks),
                reconcile_attempts: 0,
            },
            Err(RemoteError::Conflict { submitted, current }) => {
                info!(
                    "Revision conflict on document {} (submitted {}, current {:?})",
                    self.document_id, submitted, current
                );
                self.status
                    .send_modify(|status| status.phase = SyncPhase::Conflicted);
                match self
                    .reconciler
                    .resolve(&self.document_id, &self.base, &self.segments)
                    .await
                {
                    Ok(resolved) => SyncOutcome::Saved {
                        document: resolved.document,
                        reconcile_attempts: resolved.attempts,
                    },
                    Err(error) => SyncOutcome::Failed(error),
                }
            }
            Err(error) => SyncOutcome::Failed(error.into()),
        }
    }
}

async fn join_write(in_flight: &mut Option<JoinHandle<SyncOutcome>>) -> SyncOutcome {
    match in_flight {
        Some(handle) => match handle.await {
            Ok(outcome) => outcome,
            Err(e) => SyncOutcome::Failed(SyncError::Internal(e.to_string())),
        },
        None => std::future::pending().await,
    }
}

async fn sleep_until(scheduler: &dyn Scheduler, deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => scheduler.sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
