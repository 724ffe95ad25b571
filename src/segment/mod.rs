//! Segment model: one timed caption unit and the rules for merging copies of it.
//!
//! A segment exists in several places at once: the local store of every editor
//! showing the document, the sibling editor that just changed it, and the
//! server. Each optional field has an owner. Merging two copies is a total
//! function over two `Option` values per field, so a `None` on one side never
//! erases a value the other side already holds.

pub mod ops;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::sync::protocol::{Clip, WordTiming};

/// Duration given to appended segments, in seconds
pub const DEFAULT_SEGMENT_DURATION: f64 = 5.0;

/// Who produces a field's value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOwner {
    /// Set by editors (text, timing, classification, voice parameters)
    Client,
    /// Computed by a server-side process
    Server,
}

/// Where the incoming copy of a segment comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSource {
    /// A sibling editor's local edit, newer than ours
    Peer,
    /// A server response, possibly older than our latest edit
    Server,
    /// Our own copy on its way to the server. Only server-owned fields are
    /// taken from the server copy, so a cleared client field stays cleared.
    Write,
}

/// Optional, mergeable segment fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentField {
    Language,
    AssetId,
    Kind,
    VoiceId,
    VoiceModelId,
    VoiceSpeed,
    VoiceStability,
    VoiceSimilarity,
    VoiceStyleExaggeration,
    VoiceSpeakerBoost,
    WordTiming,
}

impl SegmentField {
    pub const fn owner(self) -> FieldOwner {
        match self {
            SegmentField::WordTiming => FieldOwner::Server,
            _ => FieldOwner::Client,
        }
    }
}

/// Resolve one field from the local and the incoming copy.
pub fn merge_field<T>(
    field: SegmentField,
    source: MergeSource,
    local: Option<T>,
    incoming: Option<T>,
) -> Option<T> {
    match (source, field.owner()) {
        (MergeSource::Peer, _) => incoming.or(local),
        (MergeSource::Server, FieldOwner::Client) => local.or(incoming),
        (MergeSource::Server, FieldOwner::Server) => incoming.or(local),
        (MergeSource::Write, FieldOwner::Client) => local,
        (MergeSource::Write, FieldOwner::Server) => incoming.or(local),
    }
}

/// Voice synthesis parameters, set by the voice picker and carried through edits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoiceParams {
    pub voice_id: Option<String>,
    pub model_id: Option<String>,
    pub speed: Option<f64>,
    pub stability: Option<f64>,
    pub similarity: Option<f64>,
    pub style_exaggeration: Option<f64>,
    pub speaker_boost: Option<bool>,
}

impl VoiceParams {
    pub fn with_voice(voice_id: impl Into<String>) -> Self {
        Self {
            voice_id: Some(voice_id.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn merge(&self, incoming: &VoiceParams, source: MergeSource) -> VoiceParams {
        use SegmentField::*;
        VoiceParams {
            voice_id: merge_field(VoiceId, source, self.voice_id.clone(), incoming.voice_id.clone()),
            model_id: merge_field(VoiceModelId, source, self.model_id.clone(), incoming.model_id.clone()),
            speed: merge_field(VoiceSpeed, source, self.speed, incoming.speed),
            stability: merge_field(VoiceStability, source, self.stability, incoming.stability),
            similarity: merge_field(VoiceSimilarity, source, self.similarity, incoming.similarity),
            style_exaggeration: merge_field(
                VoiceStyleExaggeration,
                source,
                self.style_exaggeration,
                incoming.style_exaggeration,
            ),
            speaker_boost: merge_field(
                VoiceSpeakerBoost,
                source,
                self.speaker_boost,
                incoming.speaker_boost,
            ),
        }
    }
}

/// One timed, editable caption unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Unique within a document
    pub id: String,
    pub text: String,
    /// Seconds from the start of the document
    pub start: f64,
    /// Seconds
    pub duration: f64,
    pub language: Option<String>,
    pub asset_id: Option<String>,
    pub kind: Option<String>,
    pub voice: VoiceParams,
    pub word_timing: Option<Vec<WordTiming>>,
    /// Unmodelled wire fields, carried through unchanged
    pub extra: Map<String, Value>,
}

impl Segment {
    pub fn new(id: impl Into<String>, text: impl Into<String>, start: f64, duration: f64) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            start,
            duration,
            language: None,
            asset_id: None,
            kind: None,
            voice: VoiceParams::default(),
            word_timing: None,
            extra: Map::new(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_voice(mut self, voice: VoiceParams) -> Self {
        self.voice = voice;
        self
    }

    pub fn with_word_timing(mut self, timing: Vec<WordTiming>) -> Self {
        self.word_timing = Some(timing);
        self
    }

    /// End time in seconds
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// Merge an incoming copy of the same segment into this one.
    ///
    /// Required fields (text, start, duration) follow the newer side: the
    /// incoming copy for a peer edit, the local copy otherwise.
    pub fn merge(&self, incoming: &Segment, source: MergeSource) -> Segment {
        use SegmentField::{AssetId, Kind, Language};
        let newer = match source {
            MergeSource::Peer => incoming,
            MergeSource::Server | MergeSource::Write => self,
        };

        let mut extra = self.extra.clone();
        extra.extend(incoming.extra.clone());

        Segment {
            id: self.id.clone(),
            text: newer.text.clone(),
            start: newer.start,
            duration: newer.duration,
            language: merge_field(Language, source, self.language.clone(), incoming.language.clone()),
            asset_id: merge_field(AssetId, source, self.asset_id.clone(), incoming.asset_id.clone()),
            kind: merge_field(Kind, source, self.kind.clone(), incoming.kind.clone()),
            voice: self.voice.merge(&incoming.voice, source),
            word_timing: merge_field(
                SegmentField::WordTiming,
                source,
                self.word_timing.clone(),
                incoming.word_timing.clone(),
            ),
            extra,
        }
    }
}

impl From<Clip> for Segment {
    fn from(clip: Clip) -> Self {
        Segment {
            id: clip.id,
            text: clip.text,
            start: clip.start,
            duration: clip.duration_sec,
            language: clip.lang,
            asset_id: clip.asset_id,
            kind: clip.kind,
            voice: VoiceParams {
                voice_id: clip.voice_id,
                model_id: clip.voice_model_id,
                speed: clip.voice_speed,
                stability: clip.voice_stability,
                similarity: clip.voice_similarity,
                style_exaggeration: clip.voice_style_exaggeration,
                speaker_boost: clip.voice_speaker_boost,
            },
            word_timing: clip.word_timing,
            extra: clip.extra,
        }
    }
}

impl From<Segment> for Clip {
    fn from(segment: Segment) -> Self {
        Clip {
            id: segment.id,
            text: segment.text,
            start: segment.start,
            duration_sec: segment.duration,
            lang: segment.language,
            asset_id: segment.asset_id,
            kind: segment.kind,
            voice_id: segment.voice.voice_id,
            word_timing: segment.word_timing,
            voice_model_id: segment.voice.model_id,
            voice_speed: segment.voice.speed,
            voice_stability: segment.voice.stability,
            voice_similarity: segment.voice.similarity,
            voice_style_exaggeration: segment.voice.style_exaggeration,
            voice_speaker_boost: segment.voice.speaker_boost,
            extra: segment.extra,
        }
    }
}

pub fn to_clips(segments: &[Segment]) -> Vec<Clip> {
    segments.iter().cloned().map(Clip::from).collect()
}

pub fn from_clips(clips: &[Clip]) -> Vec<Segment> {
    clips.iter().cloned().map(Segment::from).collect()
}

/// Ordered concatenation of `id:voiceId` pairs.
///
/// Cheap change detector for anything a renderer keys on, without deep
/// comparison of the whole list.
pub fn sync_key(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|s| format!("{}:{}", s.id, s.voice.voice_id.as_deref().unwrap_or("")))
        .collect::<Vec<_>>()
        .join("|")
}

/// Fresh client-side id: `segment_<millis>_<random>`
pub fn generate_segment_id() -> String {
    format!("segment_{}_{}", Utc::now().timestamp_millis(), random_suffix(9))
}

/// Id for the trailing half of a split, unique within `existing`
pub fn split_segment_id(original: &str, existing: &[Segment]) -> String {
    let base = format!("{}_split_{}", original, Utc::now().timestamp_millis());
    if !existing.iter().any(|s| s.id == base) {
        return base;
    }
    (2..)
        .map(|n| format!("{}_{}", base, n))
        .find(|candidate| !existing.iter().any(|s| &s.id == candidate))
        .unwrap_or(base)
}

fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}
