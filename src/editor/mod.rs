//! Segment editor surface.
//!
//! A `SegmentEditor` is one view onto a document's subtitle track. It owns a
//! local store and a selection, applies mutation operations synchronously,
//! tells the synchronizer about every change and merges updates from sibling
//! editors and server acknowledgements.

pub mod store;

pub use store::LocalSegmentStore;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::segment::ops::{self, EditError, Edited, SegmentPatch};
use crate::segment::{from_clips, Segment};
use crate::sync::bus::{DocumentChannel, Lane, Origin, SegmentsReplaced, Subscription};
use crate::sync::protocol::Document;
use crate::sync::{EditorId, SyncHandle};

pub struct SegmentEditor {
    id: EditorId,
    store: LocalSegmentStore,
    selected: Option<usize>,
    sync: SyncHandle,
    updates: Subscription,
    composing: bool,
    hydrated: bool,
    default_duration: f64,
}

impl SegmentEditor {
    pub fn new(channel: &DocumentChannel, sync: SyncHandle, default_duration: f64) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            store: LocalSegmentStore::new(channel.clone(), id.clone()),
            updates: channel.subscribe(),
            id,
            selected: None,
            sync,
            composing: false,
            hydrated: false,
            default_duration,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> &LocalSegmentStore {
        &self.store
    }

    pub fn segments(&self) -> Vec<Segment> {
        self.store.segments()
    }

    pub fn selected(&self) -> Option<usize> {
        self.selected
    }

    pub fn selected_segment(&self) -> Option<Segment> {
        self.selected.and_then(|i| self.store.get(i))
    }

    pub fn sync_key(&self) -> String {
        self.store.sync_key()
    }

    pub fn is_composing(&self) -> bool {
        self.composing
    }

    pub fn select(&mut self, index: Option<usize>) -> Result<(), EditError> {
        if let Some(index) = index {
            let len = self.store.len();
            if index >= len {
                return Err(EditError::IndexOutOfRange { index, len });
            }
        }
        self.selected = index;
        Ok(())
    }

    pub fn edit(&mut self, index: usize, patch: SegmentPatch) -> Result<(), EditError> {
        let edited = ops::edit(&self.store.segments(), self.selected, index, patch)?;
        self.commit(edited);
        Ok(())
    }

    pub fn edit_text(&mut self, index: usize, text: impl Into<String>) -> Result<(), EditError> {
        self.edit(index, SegmentPatch::text(text))
    }

    pub fn split(&mut self, index: usize, cursor: usize) -> Result<(), EditError> {
        let edited = ops::split(&self.store.segments(), index, cursor)?;
        self.commit(edited);
        Ok(())
    }

    pub fn delete(&mut self, index: usize) -> Result<(), EditError> {
        let edited = ops::delete(&self.store.segments(), self.selected, index)?;
        self.commit(edited);
        Ok(())
    }

    pub fn append(&mut self) {
        let edited = ops::append(&self.store.segments(), self.default_duration);
        self.commit(edited);
    }

    fn commit(&mut self, edited: Edited) {
        self.store.replace(edited.segments);
        self.selected = edited.selected;
        // The local list stays authoritative even if nobody is saving it
        if let Err(e) = self.sync.notify(self.store.segments()) {
            warn!("Editor {} could not schedule save: {}", self.id, e);
        }
    }

    /// Input method composition opened
    pub fn begin_composition(&mut self) {
        if self.composing {
            return;
        }
        self.composing = true;
        if let Err(e) = self.sync.composition_started() {
            warn!("Editor {}: {}", self.id, e);
        }
    }

    /// Input method composition closed; saves once
    pub fn end_composition(&mut self) {
        if !self.composing {
            return;
        }
        self.composing = false;
        if let Err(e) = self.sync.composition_ended() {
            warn!("Editor {}: {}", self.id, e);
        }
    }

    /// Focus left the editor; saves once
    pub fn blur(&mut self) {
        self.composing = false;
        if let Err(e) = self.sync.blur() {
            warn!("Editor {}: {}", self.id, e);
        }
    }

    /// Merge one bus event. Returns whether the local list changed.
    pub fn apply_update(&mut self, event: &SegmentsReplaced) -> bool {
        if event.lane != Lane::Text {
            return false;
        }

        let keep = self.selected_segment().map(|s| s.id);
        let changed = match &event.origin {
            Origin::Editor(origin) if *origin == self.id => return false,
            Origin::Editor(origin) => {
                debug!("Editor {} merging update from editor {}", self.id, origin);
                self.store.apply_peer(&event.clips)
            }
            Origin::Server => self
                .store
                .apply_server(&event.clips, event.submitted.as_deref().unwrap_or(&[])),
        };

        if changed {
            self.selected = keep.and_then(|id| self.store.index_of(&id));
        }
        changed
    }

    /// Apply every update already delivered. Returns how many changed the list.
    pub fn drain_updates(&mut self) -> usize {
        let mut changed = 0;
        while let Some(event) = self.updates.try_recv() {
            if self.apply_update(&event) {
                changed += 1;
            }
        }
        changed
    }

    /// Wait for the next update and apply it; `None` once the channel is gone
    pub async fn next_update(&mut self) -> Option<bool> {
        let event = self.updates.recv().await?;
        Some(self.apply_update(&event))
    }

    /// Take in a freshly fetched document.
    ///
    /// The first document hydrates the store. Later ones are only merged
    /// while nothing local is waiting to be saved and only when newer than
    /// the last acknowledged revision, so a stale fetch cannot overwrite an
    /// edit. Segments unchanged since that revision take the fetched copy.
    pub fn refresh(&mut self, document: &Document) -> bool {
        if !self.hydrated {
            self.store.hydrate(from_clips(document.subtitle_clips()));
            self.hydrated = true;
            self.selected = None;
            return true;
        }

        let status = self.sync.status();
        if !status.is_settled() {
            debug!(
                "Editor {} skipped refresh to rev {} with a save in progress",
                self.id, document.rev
            );
            return false;
        }
        if document.rev <= status.rev {
            debug!(
                "Editor {} ignored rev {}, already at rev {}",
                self.id, document.rev, status.rev
            );
            return false;
        }

        let acknowledged = self.sync.latest_document();
        let keep = self.selected_segment().map(|s| s.id);
        let changed = self
            .store
            .apply_server(document.subtitle_clips(), acknowledged.subtitle_clips());
        if changed {
            self.selected = keep.and_then(|id| self.store.index_of(&id));
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryRemote;
    use crate::segment::{to_clips, VoiceParams};
    use crate::sync::bus::ChangeBus;
    use crate::sync::protocol::{Track, WordTiming};
    use crate::sync::{DocumentSession, SyncConfig, SyncPhase};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;
    use tokio_test::{assert_err, assert_ok};

    fn seg(id: &str, text: &str, start: f64) -> Segment {
        Segment::new(id, text, start, 1.0)
    }

    async fn session_with(remote: Arc<InMemoryRemote>, segments: &[Segment]) -> DocumentSession {
        remote.update_external("doc", |tracks| {
            tracks.push(Track::subtitle(to_clips(segments)));
        });
        DocumentSession::open("doc", remote, ChangeBus::new(), SyncConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_sibling_editors_converge() {
        let remote = Arc::new(InMemoryRemote::new());
        let timing = vec![WordTiming::new("Hello", 0.0, 0.5)];
        let session = session_with(
            remote.clone(),
            &[seg("a", "Hello", 0.0).with_word_timing(timing.clone())],
        )
        .await;
        let mut left = session.editor();
        let mut right = session.editor();

        left.edit(
            0,
            SegmentPatch::text("Hello there").with_voice(VoiceParams::with_voice("v1")),
        )
        .unwrap();
        assert_eq!(left.drain_updates(), 0);
        assert_eq!(right.drain_updates(), 1);

        let seen = right.segments();
        assert_eq!(seen[0].text, "Hello there");
        assert_eq!(seen[0].voice.voice_id.as_deref(), Some("v1"));
        assert_eq!(seen[0].word_timing, Some(timing));
        assert_eq!(left.sync_key(), right.sync_key());

        right.split(0, 5).unwrap();
        left.drain_updates();
        assert_eq!(left.segments().len(), 2);
        assert_eq!(left.sync_key(), right.sync_key());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_ack_brings_in_reconciled_clips() {
        let remote = Arc::new(InMemoryRemote::new());
        let session = session_with(remote.clone(), &[seg("a", "Hello", 0.0)]).await;
        let mut editor = session.editor();

        remote.update_external("doc", |tracks| {
            tracks[0].clips.extend(to_clips(&[seg("x", "Generated", 8.0)]));
        });
        editor.edit_text(0, "Hello edited").unwrap();
        session.sync().flush().await.unwrap();
        editor.drain_updates();

        let texts: Vec<_> = editor.segments().into_iter().map(|s| s.text).collect();
        assert_eq!(texts, vec!["Hello edited", "Generated"]);
        assert_eq!(session.sync().status().rev, 3);
    }

    fn texts(editor: &SegmentEditor) -> Vec<String> {
        editor.segments().into_iter().map(|s| s.text).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_brings_in_server_edit_to_untouched_segment() {
        let remote = Arc::new(InMemoryRemote::new());
        let session = session_with(
            remote.clone(),
            &[seg("a", "Hello", 0.0), seg("b", "two", 1.0)],
        )
        .await;
        let mut editor = session.editor();

        remote.update_external("doc", |tracks| {
            tracks[0].clips[1].text = "two (server)".to_string();
        });
        editor.edit_text(0, "Hello edited").unwrap();
        session.sync().flush().await.unwrap();
        editor.drain_updates();
        assert_eq!(texts(&editor), vec!["Hello edited", "two (server)"]);

        // The next write must not put the old text back
        editor.edit_text(0, "Hello again").unwrap();
        let status = session.sync().flush().await.unwrap();
        assert_eq!(status.conflicts_resolved, 1);

        let stored = remote.document("doc").unwrap();
        let stored: Vec<_> = stored.subtitle_clips().iter().map(|c| c.text.as_str()).collect();
        assert_eq!(stored, vec!["Hello again", "two (server)"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_voice_stays_cleared() {
        let remote = Arc::new(InMemoryRemote::new());
        let session = session_with(
            remote.clone(),
            &[seg("a", "Hello", 0.0).with_voice(VoiceParams::with_voice("v1"))],
        )
        .await;
        let mut editor = session.editor();

        editor
            .edit(0, SegmentPatch::default().with_voice(VoiceParams::default()))
            .unwrap();
        session.sync().flush().await.unwrap();
        editor.drain_updates();

        assert!(editor.segments()[0].voice.is_empty());
        assert_eq!(editor.sync_key(), "a:");
        let stored = remote.document("doc").unwrap();
        assert_eq!(stored.subtitle_clips()[0].voice_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_does_not_roll_back_edits_made_during_write() {
        let remote = Arc::new(InMemoryRemote::new().with_latency(Duration::from_millis(300)));
        let session = session_with(
            remote.clone(),
            &[seg("a", "Hello", 0.0), seg("b", "two", 1.0)],
        )
        .await;
        let mut left = session.editor();
        let mut right = session.editor();

        left.edit_text(0, "Hello v1").unwrap();
        right.drain_updates();
        sleep(Duration::from_millis(600)).await;
        assert_eq!(session.sync().status().phase, SyncPhase::Writing);

        // Both surfaces edit while the first write is in flight
        left.edit_text(0, "Hello v2").unwrap();
        right.drain_updates();
        right.edit_text(1, "two, by right").unwrap();
        left.drain_updates();

        sleep(Duration::from_millis(300)).await;
        assert_eq!(session.sync().status().writes, 1);
        left.drain_updates();
        right.drain_updates();
        assert_eq!(texts(&left), vec!["Hello v2", "two, by right"]);
        assert_eq!(texts(&right), vec!["Hello v2", "two, by right"]);

        session.sync().flush().await.unwrap();
        left.drain_updates();
        right.drain_updates();
        assert_eq!(texts(&left), vec!["Hello v2", "two, by right"]);
        assert_eq!(left.sync_key(), right.sync_key());

        let stored = remote.document("doc").unwrap();
        let stored: Vec<_> = stored.subtitle_clips().iter().map(|c| c.text.as_str()).collect();
        assert_eq!(stored, vec!["Hello v2", "two, by right"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_takes_newer_copy_of_untouched_segments() {
        let remote = Arc::new(InMemoryRemote::new());
        let session = session_with(
            remote.clone(),
            &[seg("a", "Hello", 0.0), seg("b", "two", 1.0)],
        )
        .await;
        let mut editor = session.editor();
        editor.edit_text(0, "Hello edited").unwrap();
        session.sync().flush().await.unwrap();
        editor.drain_updates();

        let newer = remote.update_external("doc", |tracks| {
            tracks[0].clips[1].text = "two (server)".to_string();
        });
        assert!(editor.refresh(&newer));
        assert_eq!(texts(&editor), vec!["Hello edited", "two (server)"]);

        assert!(!editor.refresh(&session.sync().latest_document()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_is_skipped_while_saving() {
        let remote = Arc::new(InMemoryRemote::new().with_latency(Duration::from_millis(300)));
        let session = session_with(remote.clone(), &[seg("a", "Hello", 0.0)]).await;
        let mut editor = session.editor();
        let stale = session.sync().latest_document();

        editor.edit_text(0, "Hello, world").unwrap();
        sleep(Duration::from_millis(600)).await;
        assert_eq!(session.sync().status().phase, SyncPhase::Writing);

        assert!(!editor.refresh(&stale));
        assert_eq!(editor.segments()[0].text, "Hello, world");

        session.sync().flush().await.unwrap();
        assert!(!editor.refresh(&stale));
        assert_eq!(editor.segments()[0].text, "Hello, world");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_only_selected_segment() {
        let remote = Arc::new(InMemoryRemote::new());
        let session = session_with(remote.clone(), &[seg("a", "only", 0.0)]).await;
        let mut editor = session.editor();

        assert_ok!(editor.select(Some(0)));
        assert_ok!(editor.delete(0));

        assert!(editor.segments().is_empty());
        assert_eq!(editor.selected(), None);
        assert_err!(editor.delete(0));

        let status = session.sync().flush().await.unwrap();
        assert_eq!(status.rev, 2);
        assert!(remote.document("doc").unwrap().subtitle_clips().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_then_split_keeps_order_and_selection() {
        let remote = Arc::new(InMemoryRemote::new());
        let session = session_with(
            remote.clone(),
            &[seg("a", "First", 0.0).with_language("fr")],
        )
        .await;
        let mut editor = session.editor();

        editor.append();
        assert_eq!(editor.selected(), Some(1));
        let appended = editor.selected_segment().unwrap();
        assert_eq!(appended.start, 1.0);
        assert_eq!(appended.language.as_deref(), Some("fr"));

        editor.edit_text(1, "deux mots").unwrap();
        editor.split(1, 4).unwrap();
        assert_eq!(editor.selected(), Some(2));
        let starts: Vec<f64> = editor.segments().iter().map(|s| s.start).collect();
        assert!(starts.windows(2).all(|w| w[0] <= w[1]));

        assert_err!(editor.split(0, 0));
        assert_eq!(editor.segments().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_composition_defers_save_until_end() {
        let remote = Arc::new(InMemoryRemote::new());
        let session = session_with(remote.clone(), &[seg("a", "", 0.0)]).await;
        let mut editor = session.editor();
        let writes_before = remote.write_count();

        editor.begin_composition();
        editor.edit_text(0, "にほ").unwrap();
        editor.edit_text(0, "日本").unwrap();
        sleep(Duration::from_secs(2)).await;
        assert_eq!(remote.write_count(), writes_before);

        editor.end_composition();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(remote.write_count(), writes_before + 1);
        assert!(!editor.is_composing());
    }
}
