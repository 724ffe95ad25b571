//! Mutation operations over a segment list.
//!
//! Every operation borrows the current list, validates its index, and returns
//! a new list plus the new selection. A rejected operation returns an
//! `EditError` and leaves the caller's list untouched. Results are always
//! sorted by `start`.

use thiserror::Error;

use super::{generate_segment_id, split_segment_id, Segment, VoiceParams};

/// Validation failures; never reach the network
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EditError {
    #[error("Segment index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Cursor {cursor} out of range for {len} characters")]
    CursorOutOfRange { cursor: usize, len: usize },

    #[error("Split at {cursor} leaves an empty half")]
    EmptySplitHalf { cursor: usize },

    #[error("Invalid duration: {0}")]
    InvalidDuration(f64),
}

/// Result of an accepted operation
#[derive(Debug, Clone, PartialEq)]
pub struct Edited {
    pub segments: Vec<Segment>,
    pub selected: Option<usize>,
}

/// Fields an edit may replace; `None` keeps the current value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentPatch {
    pub text: Option<String>,
    pub duration: Option<f64>,
    pub language: Option<String>,
    pub voice: Option<VoiceParams>,
}

impl SegmentPatch {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_voice(mut self, voice: VoiceParams) -> Self {
        self.voice = Some(voice);
        self
    }
}

/// Stable sort by start time
pub fn sort_by_start(segments: &mut [Segment]) {
    segments.sort_by(|a, b| a.start.total_cmp(&b.start));
}

fn check_index(segments: &[Segment], index: usize) -> Result<(), EditError> {
    if index >= segments.len() {
        return Err(EditError::IndexOutOfRange {
            index,
            len: segments.len(),
        });
    }
    Ok(())
}

/// Sort and point the selection back at the segment with `selected_id`
fn normalize(mut segments: Vec<Segment>, selected_id: Option<&str>) -> Edited {
    sort_by_start(&mut segments);
    let selected = selected_id.and_then(|id| segments.iter().position(|s| s.id == id));
    Edited { segments, selected }
}

fn selected_id(segments: &[Segment], selected: Option<usize>) -> Option<String> {
    selected
        .and_then(|i| segments.get(i))
        .map(|s| s.id.clone())
}

/// Replace fields of the segment at `index`.
pub fn edit(
    segments: &[Segment],
    selected: Option<usize>,
    index: usize,
    patch: SegmentPatch,
) -> Result<Edited, EditError> {
    check_index(segments, index)?;
    if let Some(duration) = patch.duration {
        if !duration.is_finite() || duration < 0.0 {
            return Err(EditError::InvalidDuration(duration));
        }
    }

    let keep = selected_id(segments, selected);
    let mut next = segments.to_vec();
    let segment = &mut next[index];
    if let Some(text) = patch.text {
        segment.text = text;
    }
    if let Some(duration) = patch.duration {
        segment.duration = duration;
    }
    if let Some(language) = patch.language {
        segment.language = Some(language);
    }
    if let Some(voice) = patch.voice {
        segment.voice = voice;
    }

    let mut edited = normalize(next, keep.as_deref());
    if keep.is_none() {
        edited.selected = selected;
    }
    Ok(edited)
}

pub fn edit_text(
    segments: &[Segment],
    selected: Option<usize>,
    index: usize,
    text: impl Into<String>,
) -> Result<Edited, EditError> {
    edit(segments, selected, index, SegmentPatch::text(text))
}

/// Split the segment at `index` at character position `cursor`.
///
/// Both halves must be non-empty after trimming. Duration is divided by the
/// character-length ratio of the untrimmed halves. The head keeps the word
/// timing of its own words. The trailing segment gets a fresh id, inherits
/// classification and voice parameters, and is selected.
pub fn split(segments: &[Segment], index: usize, cursor: usize) -> Result<Edited, EditError> {
    check_index(segments, index)?;
    let original = &segments[index];

    let total_len = original.text.chars().count();
    if cursor > total_len {
        return Err(EditError::CursorOutOfRange {
            cursor,
            len: total_len,
        });
    }

    let byte_at = original
        .text
        .char_indices()
        .nth(cursor)
        .map(|(i, _)| i)
        .unwrap_or(original.text.len());
    let (before, after) = original.text.split_at(byte_at);
    let (before_text, after_text) = (before.trim(), after.trim());
    if before_text.is_empty() || after_text.is_empty() {
        return Err(EditError::EmptySplitHalf { cursor });
    }

    let before_duration = original.duration * cursor as f64 / total_len as f64;

    let mut head = original.clone();
    head.text = before_text.to_string();
    head.duration = before_duration;
    // Keep timing only for the words that stayed in the head
    let head_words = before_text.split_whitespace().count();
    head.word_timing = original
        .word_timing
        .as_ref()
        .map(|timing| timing.iter().take(head_words).cloned().collect::<Vec<_>>())
        .filter(|timing| !timing.is_empty());

    let tail = Segment {
        id: split_segment_id(&original.id, segments),
        text: after_text.to_string(),
        start: original.start + before_duration,
        duration: original.duration - before_duration,
        language: original.language.clone(),
        asset_id: original.asset_id.clone(),
        kind: original.kind.clone(),
        voice: original.voice.clone(),
        word_timing: None,
        extra: Default::default(),
    };
    let tail_id = tail.id.clone();

    let mut next = segments.to_vec();
    next[index] = head;
    next.insert(index + 1, tail);
    Ok(normalize(next, Some(&tail_id)))
}

/// Remove the segment at `index`, keeping the selection on the same segment.
pub fn delete(
    segments: &[Segment],
    selected: Option<usize>,
    index: usize,
) -> Result<Edited, EditError> {
    check_index(segments, index)?;

    let mut next = segments.to_vec();
    next.remove(index);

    let selected = match selected {
        Some(current) if current == index => {
            if next.is_empty() {
                None
            } else {
                Some(index.min(next.len() - 1))
            }
        }
        Some(current) if current > index => Some(current - 1),
        other => other,
    };

    Ok(Edited {
        segments: next,
        selected,
    })
}

/// Append an empty segment after the last one and select it.
pub fn append(segments: &[Segment], duration: f64) -> Edited {
    let start = segments.last().map(Segment::end).unwrap_or(0.0);
    let mut segment = Segment::new(generate_segment_id(), "", start, duration);
    segment.language = segments.last().and_then(|s| s.language.clone());
    let id = segment.id.clone();

    let mut next = segments.to_vec();
    next.push(segment);
    normalize(next, Some(&id))
}
