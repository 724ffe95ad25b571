//! Wire shapes exchanged with the remote document store.
//!
//! A document is a revision counter plus an ordered list of tracks. Exactly one
//! track of kind `"subtitle"` carries the caption clips this crate edits; every
//! other track is passed through untouched. Unknown fields on clips and tracks
//! are kept in `extra` so a round trip never drops data the client doesn't own.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Track kind holding the editable caption clips
pub const SUBTITLE_TRACK: &str = "subtitle";

/// Per-word timing annotation produced server-side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    pub start: f64,
    pub end: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WordTiming {
    pub fn new(word: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            word: word.into(),
            start,
            end,
            extra: Map::new(),
        }
    }
}

/// Canonical clip shape persisted on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clip {
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub duration_sec: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_timing: Option<Vec<WordTiming>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_stability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_similarity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_style_exaggeration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_speaker_boost: Option<bool>,
    /// Fields this client doesn't model
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A track of the document timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub clips: Vec<Clip>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Track {
    pub fn new(kind: impl Into<String>, clips: Vec<Clip>) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            clips,
            extra: Map::new(),
        }
    }

    pub fn subtitle(clips: Vec<Clip>) -> Self {
        Self::new(SUBTITLE_TRACK, clips)
    }

    pub fn is_subtitle(&self) -> bool {
        self.kind == SUBTITLE_TRACK
    }
}

/// The authoritative, revisioned container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub id: String,
    pub rev: u64,
    #[serde(default)]
    pub tracks: Vec<Track>,
}

impl Document {
    /// A document that has never been written (revision 0, no tracks)
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: 0,
            tracks: Vec::new(),
        }
    }

    pub fn subtitle_track(&self) -> Option<&Track> {
        self.tracks.iter().find(|t| t.is_subtitle())
    }

    /// Clips of the subtitle track, empty if the document has none
    pub fn subtitle_clips(&self) -> &[Clip] {
        self.subtitle_track()
            .map(|t| t.clips.as_slice())
            .unwrap_or(&[])
    }

    /// Copy of the tracks with the subtitle track's clips replaced.
    ///
    /// Appends a subtitle track when the document doesn't have one yet.
    pub fn tracks_with_subtitles(&self, clips: Vec<Clip>) -> Vec<Track> {
        let mut tracks = self.tracks.clone();
        match tracks.iter_mut().find(|t| t.is_subtitle()) {
            Some(track) => track.clips = clips,
            None => tracks.push(Track::subtitle(clips)),
        }
        tracks
    }
}

/// Body of `PUT document`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutRequest {
    pub tracks: Vec<Track>,
    /// Revision the write is based on
    pub rev: u64,
}

/// Successful response of `PUT document`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutResponse {
    pub success: bool,
    pub rev: u64,
    #[serde(default)]
    pub tracks: Vec<Track>,
}

/// Body returned alongside a 409 when the submitted revision is stale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictBody {
    pub success: bool,
    pub error: String,
    /// Current server revision
    pub rev: u64,
}
