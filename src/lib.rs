//! Segment Sync - keeps timed caption segments consistent between editors and
//! a revisioned document store.
//!
//! - `segment`: the segment model, field ownership and mutation operations
//! - `editor`: editor surfaces and their local segment stores
//! - `sync`: change bus, debounced persistence and conflict reconciliation
//! - `remote`: the document store port and its clients
//! - `storage` / `server`: a sled-backed document service

pub mod editor;
pub mod remote;
pub mod segment;
pub mod server;
pub mod storage;
pub mod sync;

pub use editor::{LocalSegmentStore, SegmentEditor};
pub use remote::{DocumentRemote, HttpRemote, InMemoryRemote, RemoteError};
pub use segment::ops::{EditError, SegmentPatch};
pub use segment::{Segment, VoiceParams};
pub use storage::{DocumentStore, StorageConfig};
pub use sync::{ChangeBus, DocumentSession, SyncConfig, SyncError, SyncHandle, SyncPhase, SyncStatus};
