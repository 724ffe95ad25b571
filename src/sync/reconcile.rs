//! Conflict reconciliation.
//!
//! Runs only after a write was rejected for a stale revision:
//! - Fetch the authoritative document
//! - Merge by id: server clips first, the client's touched ids on top
//! - Re-submit at the fresh revision
//! - Repeat on a new conflict, up to the retry policy's attempt bound

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::protocol::{Document, PutRequest, PutResponse, Track};
use super::scheduler::Scheduler;
use super::{RetryPolicy, SyncError, SyncResult};
use crate::remote::{DocumentRemote, RemoteError};
use crate::segment::ops::sort_by_start;
use crate::segment::{from_clips, to_clips, MergeSource, Segment};

/// Outcome of a reconciled write
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    /// Document as acknowledged by the server
    pub document: Document,
    /// Reconcile attempts used, 1-based
    pub attempts: u32,
}

/// Ids the client produced, edited or deleted relative to `base`
pub fn touched_ids(base: &[Segment], pending: &[Segment]) -> HashSet<String> {
    let base_by_id: HashMap<&str, &Segment> = base.iter().map(|s| (s.id.as_str(), s)).collect();
    let pending_ids: HashSet<&str> = pending.iter().map(|s| s.id.as_str()).collect();

    let mut touched: HashSet<String> = pending
        .iter()
        .filter(|s| base_by_id.get(s.id.as_str()).map_or(true, |b| *b != *s))
        .map(|s| s.id.clone())
        .collect();

    touched.extend(
        base.iter()
            .filter(|s| !pending_ids.contains(s.id.as_str()))
            .map(|s| s.id.clone()),
    );
    touched
}

/// Merge the client's pending list onto the current server list.
///
/// Ids the client did not touch keep the server's copy, including clips
/// another actor added. Touched ids take the client's copy, with only
/// server-owned fields filled from the server. A touched id the client
/// deleted stays deleted.
pub fn merge_pending(server: &[Segment], base: &[Segment], pending: &[Segment]) -> Vec<Segment> {
    let touched = touched_ids(base, pending);
    let pending_by_id: HashMap<&str, &Segment> =
        pending.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut merged: Vec<Segment> = server
        .iter()
        .filter_map(|server_copy| {
            if !touched.contains(&server_copy.id) {
                return Some(server_copy.clone());
            }
            pending_by_id
                .get(server_copy.id.as_str())
                .map(|local| local.merge(server_copy, MergeSource::Write))
        })
        .collect();

    let server_ids: HashSet<&str> = server.iter().map(|s| s.id.as_str()).collect();
    merged.extend(
        pending
            .iter()
            .filter(|s| touched.contains(&s.id) && !server_ids.contains(s.id.as_str()))
            .cloned(),
    );

    sort_by_start(&mut merged);
    merged
}

/// Document built from a successful write response.
///
/// Servers that omit `tracks` from the response acknowledge the submitted ones.
pub(crate) fn acknowledged(document_id: &str, response: PutResponse, submitted: Vec<Track>) -> Document {
    let tracks = if response.tracks.is_empty() {
        submitted
    } else {
        response.tracks
    };
    Document {
        id: document_id.to_string(),
        rev: response.rev,
        tracks,
    }
}

/// Fetch-merge-resubmit loop with bounded linear backoff
#[derive(Clone)]
pub struct ConflictReconciler {
    remote: Arc<dyn DocumentRemote>,
    scheduler: Arc<dyn Scheduler>,
    policy: RetryPolicy,
}

impl ConflictReconciler {
    pub fn new(
        remote: Arc<dyn DocumentRemote>,
        scheduler: Arc<dyn Scheduler>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            remote,
            scheduler,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Reconcile `pending` (edited on top of `base`) with the server.
    pub async fn resolve(
        &self,
        document_id: &str,
        base: &Document,
        pending: &[Segment],
    ) -> SyncResult<Resolved> {
        let base_segments = from_clips(base.subtitle_clips());

        for attempt in 1..=self.policy.max_attempts {
            self.scheduler.sleep(self.policy.backoff(attempt)).await;

            let fresh = self.remote.fetch_or_empty(document_id).await?;
            let merged = merge_pending(&from_clips(fresh.subtitle_clips()), &base_segments, pending);
            let tracks = fresh.tracks_with_subtitles(to_clips(&merged));

            debug!(
                "Reconcile attempt {} for document {} at rev {}",
                attempt, document_id, fresh.rev
            );

            let request = PutRequest {
                tracks: tracks.clone(),
                rev: fresh.rev,
            };
            match self.remote.put(document_id, request).await {
                Ok(response) => {
                    info!(
                        "Document {} reconciled at rev {} after {} attempt(s)",
                        document_id, response.rev, attempt
                    );
                    return Ok(Resolved {
                        document: acknowledged(document_id, response, tracks),
                        attempts: attempt,
                    });
                }
                Err(RemoteError::Conflict { current, .. }) => {
                    debug!(
                        "Document {} moved again (now {:?}), retrying",
                        document_id, current
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(
            "Giving up on document {} after {} reconcile attempts",
            document_id, self.policy.max_attempts
        );
        Err(SyncError::ConflictUnresolved {
            attempts: self.policy.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryRemote;
    use crate::segment::VoiceParams;
    use crate::sync::protocol::WordTiming;
    use crate::sync::scheduler::TokioScheduler;
    use std::time::Duration;

    fn seg(id: &str, text: &str, start: f64) -> Segment {
        Segment::new(id, text, start, 1.0)
    }

    fn ids(segments: &[Segment]) -> Vec<&str> {
        segments.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn test_touched_ids() {
        let base = vec![seg("a", "one", 0.0), seg("b", "two", 1.0), seg("c", "three", 2.0)];
        let pending = vec![seg("a", "one", 0.0), seg("b", "TWO", 1.0), seg("d", "four", 3.0)];

        let touched = touched_ids(&base, &pending);
        let mut touched: Vec<_> = touched.into_iter().collect();
        touched.sort();
        assert_eq!(touched, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_merge_keeps_concurrent_server_clip() {
        let base = vec![seg("a", "Hello", 0.0)];
        let pending = vec![seg("a", "Hello edited", 0.0)];
        let server = vec![seg("a", "Hello", 0.0), seg("x", "From elsewhere", 5.0)];

        let merged = merge_pending(&server, &base, &pending);
        assert_eq!(ids(&merged), vec!["a", "x"]);
        assert_eq!(merged[0].text, "Hello edited");
        assert_eq!(merged[1].text, "From elsewhere");
    }

    #[test]
    fn test_merge_untouched_ids_follow_server() {
        let base = vec![seg("a", "one", 0.0), seg("b", "two", 1.0)];
        let pending = vec![seg("a", "ONE", 0.0), seg("b", "two", 1.0)];
        let server = vec![seg("a", "one", 0.0), seg("b", "two (server)", 1.0)];

        let merged = merge_pending(&server, &base, &pending);
        assert_eq!(merged[0].text, "ONE");
        assert_eq!(merged[1].text, "two (server)");
    }

    #[test]
    fn test_merge_client_deletion_wins_for_touched_id() {
        let base = vec![seg("a", "one", 0.0), seg("b", "two", 1.0)];
        let pending = vec![seg("a", "one", 0.0)];
        let server = vec![seg("a", "one", 0.0), seg("b", "two", 1.0), seg("c", "new", 2.0)];

        let merged = merge_pending(&server, &base, &pending);
        assert_eq!(ids(&merged), vec!["a", "c"]);
    }

    #[test]
    fn test_merge_fills_server_owned_fields() {
        let base = vec![seg("a", "Hello", 0.0)];
        let pending = vec![seg("a", "Hello!", 0.0).with_voice(VoiceParams::with_voice("v2"))];
        let server = vec![seg("a", "Hello", 0.0)
            .with_word_timing(vec![WordTiming::new("Hello", 0.0, 0.5)])
            .with_voice(VoiceParams::with_voice("v1"))];

        let merged = merge_pending(&server, &base, &pending);
        assert_eq!(merged[0].text, "Hello!");
        assert_eq!(merged[0].voice.voice_id.as_deref(), Some("v2"));
        assert!(merged[0].word_timing.is_some());
    }

    #[test]
    fn test_merge_keeps_client_clearing_a_field() {
        let base = vec![seg("a", "Hello", 0.0).with_voice(VoiceParams::with_voice("v1"))];
        let pending = vec![seg("a", "Hello", 0.0)];
        let server = vec![seg("a", "Hello", 0.0)
            .with_language("en")
            .with_voice(VoiceParams::with_voice("v1"))];

        let merged = merge_pending(&server, &base, &pending);
        assert!(merged[0].voice.is_empty());
        assert_eq!(merged[0].language, None);
    }

    fn reconciler(remote: Arc<InMemoryRemote>) -> ConflictReconciler {
        ConflictReconciler::new(remote, Arc::new(TokioScheduler), RetryPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_converges_with_concurrent_write() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.update_external("doc", |tracks| {
            tracks.push(Track::subtitle(to_clips(&[seg("a", "Hello", 0.0)])));
        });
        let base = remote.document("doc").unwrap();
        remote.update_external("doc", |tracks| {
            tracks[0].clips.push(to_clips(&[seg("x", "Concurrent", 4.0)]).remove(0));
        });

        let pending = vec![seg("a", "Hello edited", 0.0)];
        let resolved = reconciler(remote.clone())
            .resolve("doc", &base, &pending)
            .await
            .unwrap();

        assert_eq!(resolved.attempts, 1);
        assert_eq!(resolved.document.rev, 3);
        let stored = remote.document("doc").unwrap();
        let clips = stored.subtitle_clips();
        assert_eq!(clips.len(), 2);
        assert_eq!(clips[0].text, "Hello edited");
        assert_eq!(clips[1].id, "x");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_gives_up_after_bounded_attempts() {
        let remote = Arc::new(InMemoryRemote::new());
        for _ in 0..3 {
            remote.fail_next_put(RemoteError::Conflict {
                submitted: 0,
                current: None,
            });
        }

        let started = tokio::time::Instant::now();
        let result = reconciler(remote.clone())
            .resolve("doc", &Document::empty("doc"), &[seg("a", "x", 0.0)])
            .await;

        assert_eq!(result, Err(SyncError::ConflictUnresolved { attempts: 3 }));
        assert_eq!(remote.write_count(), 3);
        assert_eq!(remote.fetch_count(), 3);
        // 100 + 200 + 300 ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_surfaces_transport_error() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.fail_next_put(RemoteError::Transport("502".to_string()));

        let result = reconciler(remote.clone())
            .resolve("doc", &Document::empty("doc"), &[seg("a", "x", 0.0)])
            .await;

        assert_eq!(result, Err(SyncError::Transport("502".to_string())));
        assert_eq!(remote.write_count(), 1);
    }
}
