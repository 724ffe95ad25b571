//! Local segment store.
//!
//! Canonical in-memory list for one editor surface. All reads and writes are
//! synchronous. Local replacements are mirrored onto the document's bus
//! channel; peer and server updates are merged in without re-publishing.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::segment::ops::sort_by_start;
use crate::segment::{from_clips, sync_key, to_clips, MergeSource, Segment};
use crate::sync::bus::{DocumentChannel, Lane, Origin};
use crate::sync::protocol::Clip;
use crate::sync::EditorId;

#[derive(Default)]
struct StoreState {
    segments: Vec<Segment>,
    sync_key: String,
    /// Ids removed locally or by a peer; server updates never bring them back.
    /// Dropped once an acknowledged list no longer carries the id.
    tombstones: HashSet<String>,
    version: u64,
}

impl StoreState {
    fn set(&mut self, mut segments: Vec<Segment>) {
        sort_by_start(&mut segments);
        self.sync_key = sync_key(&segments);
        self.segments = segments;
        self.version += 1;
    }

    fn bury_removed(&mut self, next: &[Segment]) {
        let kept: HashSet<&str> = next.iter().map(|s| s.id.as_str()).collect();
        for segment in &self.segments {
            if !kept.contains(segment.id.as_str()) {
                self.tombstones.insert(segment.id.clone());
            }
        }
    }
}

#[derive(Clone)]
pub struct LocalSegmentStore {
    state: Arc<RwLock<StoreState>>,
    channel: DocumentChannel,
    origin: EditorId,
}

impl LocalSegmentStore {
    pub fn new(channel: DocumentChannel, origin: impl Into<EditorId>) -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            channel,
            origin: origin.into(),
        }
    }

    pub fn segments(&self) -> Vec<Segment> {
        self.state.read().segments.clone()
    }

    pub fn get(&self, index: usize) -> Option<Segment> {
        self.state.read().segments.get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.state.read().segments.iter().position(|s| s.id == id)
    }

    /// Memoized `id:voiceId` key of the current list
    pub fn sync_key(&self) -> String {
        self.state.read().sync_key.clone()
    }

    /// Bumped on every change
    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.state.read().tombstones.contains(id)
    }

    pub fn clips(&self) -> Vec<Clip> {
        to_clips(&self.state.read().segments)
    }

    /// Replace the list after a local mutation and publish it to siblings
    pub fn replace(&self, segments: Vec<Segment>) {
        let clips = {
            let mut state = self.state.write();
            state.bury_removed(&segments);
            for segment in &segments {
                state.tombstones.remove(&segment.id);
            }
            state.set(segments);
            to_clips(&state.segments)
        };

        let receivers = self
            .channel
            .publish(Lane::Text, clips, Origin::Editor(self.origin.clone()));
        debug!(
            "Editor {} published {} segments to {} receivers",
            self.origin,
            self.len(),
            receivers
        );
    }

    /// Load a server document wholesale, forgetting local history
    pub fn hydrate(&self, segments: Vec<Segment>) {
        let mut state = self.state.write();
        state.tombstones.clear();
        state.set(segments);
    }

    /// Merge a sibling editor's list: its id set wins, fields it leaves
    /// unset are carried over from ours.
    pub fn apply_peer(&self, clips: &[Clip]) -> bool {
        let incoming = from_clips(clips);
        let mut state = self.state.write();
        let previous: HashMap<&str, &Segment> =
            state.segments.iter().map(|s| (s.id.as_str(), s)).collect();

        let next: Vec<Segment> = incoming
            .iter()
            .map(|segment| match previous.get(segment.id.as_str()) {
                Some(local) => local.merge(segment, MergeSource::Peer),
                None => segment.clone(),
            })
            .collect();

        if next == state.segments {
            return false;
        }
        state.bury_removed(&next);
        for segment in &next {
            state.tombstones.remove(&segment.id);
        }
        state.set(next);
        true
    }

    /// Merge an acknowledged server list.
    ///
    /// `submitted` is the local list the acknowledged write was built from.
    /// Segments still equal to their submitted copy take the server's copy,
    /// so changes other actors made on the server come through. Segments
    /// changed since then keep their local content and only pick up
    /// server-owned fields. Server-only ids are added unless tombstoned, and
    /// unchanged submitted ids the server no longer has are dropped.
    pub fn apply_server(&self, clips: &[Clip], submitted: &[Clip]) -> bool {
        let server = from_clips(clips);
        let submitted = from_clips(submitted);
        let mut state = self.state.write();
        let server_by_id: HashMap<&str, &Segment> =
            server.iter().map(|s| (s.id.as_str(), s)).collect();
        let submitted_by_id: HashMap<&str, &Segment> =
            submitted.iter().map(|s| (s.id.as_str(), s)).collect();
        let local_ids: HashSet<&str> = state.segments.iter().map(|s| s.id.as_str()).collect();

        let mut next: Vec<Segment> = state
            .segments
            .iter()
            .filter_map(|local| {
                let unchanged = submitted_by_id
                    .get(local.id.as_str())
                    .map(|copy| *copy == local);
                let source = match unchanged {
                    Some(true) => MergeSource::Peer,
                    Some(false) => MergeSource::Write,
                    None => MergeSource::Server,
                };
                match server_by_id.get(local.id.as_str()) {
                    Some(server_copy) => Some(local.merge(server_copy, source)),
                    // Removed on the server by someone else
                    None if unchanged == Some(true) => None,
                    None => Some(local.clone()),
                }
            })
            .collect();
        next.extend(
            server
                .iter()
                .filter(|s| !local_ids.contains(s.id.as_str()) && !state.tombstones.contains(&s.id))
                .cloned(),
        );
        sort_by_start(&mut next);

        let buried = state.tombstones.len();
        state.tombstones.retain(|id| server_by_id.contains_key(id.as_str()));
        if state.tombstones.len() < buried {
            debug!(
                "Editor {} dropped {} tombstones",
                self.origin,
                buried - state.tombstones.len()
            );
        }

        if next == state.segments {
            return false;
        }
        state.set(next);
        true
    }
}
