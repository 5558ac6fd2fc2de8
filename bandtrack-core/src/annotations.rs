//! Annotation merge
//!
//! Per-member progress on a rehearsal: a skill level, a free-text note and a
//! list of recorded audio notes. Each map is keyed by the member's user id.
//! A member only ever edits their own entries; [`Annotations::apply`] merges
//! one member's change into the full maps read in the same transaction, so
//! other members' entries are carried through untouched.

use crate::access::UserId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MIN_LEVEL: i64 = 0;
pub const MAX_LEVEL: i64 = 10;

/// One recorded audio note
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioNote {
    #[serde(default)]
    pub title: String,
    /// Encoded payload reference, opaque to the core
    pub audio: String,
}

impl AudioNote {
    pub fn new(title: impl Into<String>, audio: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            audio: audio.into(),
        }
    }
}

/// Audio notes in any layout the store has used over time
///
/// Older rows hold a bare string per member, or lists mixing strings and
/// `{title, audio}` objects.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StoredAudioNotes {
    List(Vec<StoredAudioNote>),
    Single(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StoredAudioNote {
    Note(AudioNote),
    Bare(String),
}

impl From<StoredAudioNote> for AudioNote {
    fn from(stored: StoredAudioNote) -> Self {
        match stored {
            StoredAudioNote::Note(note) => note,
            StoredAudioNote::Bare(audio) => AudioNote::new("", audio),
        }
    }
}

impl From<StoredAudioNotes> for Vec<AudioNote> {
    fn from(stored: StoredAudioNotes) -> Self {
        match stored {
            StoredAudioNotes::List(items) => items.into_iter().map(AudioNote::from).collect(),
            StoredAudioNotes::Single(audio) if audio.is_empty() => Vec::new(),
            StoredAudioNotes::Single(audio) => vec![AudioNote::new("", audio)],
        }
    }
}

/// Change to one member's audio note list
#[derive(Debug, Clone, PartialEq)]
pub enum AudioChange {
    /// Append a note; an empty payload clears the whole list instead
    Append(AudioNote),
    /// Remove by position in the list as last read; out of range is ignored
    Remove(usize),
}

/// One member's partial annotation edit
///
/// Fields left `None` keep their stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotationUpdate {
    /// Clamped into `0..=10`
    pub level: Option<i64>,
    pub note: Option<String>,
    pub audio: Option<AudioChange>,
}

impl AnnotationUpdate {
    pub fn is_empty(&self) -> bool {
        self.level.is_none() && self.note.is_none() && self.audio.is_none()
    }
}

/// All members' annotations on one rehearsal
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Annotations {
    pub levels: BTreeMap<UserId, i64>,
    pub notes: BTreeMap<UserId, String>,
    pub audio_notes: BTreeMap<UserId, Vec<AudioNote>>,
}

/// JSON text of the three annotation columns
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedAnnotations {
    pub levels_json: String,
    pub notes_json: String,
    pub audio_notes_json: String,
}

impl Annotations {
    /// Decode the stored column text
    pub fn decode(levels_json: &str, notes_json: &str, audio_notes_json: &str) -> Result<Self> {
        let audio: BTreeMap<UserId, StoredAudioNotes> = decode_column("audio_notes_json", audio_notes_json)?;
        let audio_notes = audio
            .into_iter()
            .map(|(user_id, stored)| (user_id, Vec::from(stored)))
            .filter(|(_, notes)| !notes.is_empty())
            .collect();

        Ok(Self {
            levels: decode_column("levels_json", levels_json)?,
            notes: decode_column("notes_json", notes_json)?,
            audio_notes,
        })
    }

    pub fn encode(&self) -> Result<EncodedAnnotations> {
        Ok(EncodedAnnotations {
            levels_json: encode_column("levels_json", &self.levels)?,
            notes_json: encode_column("notes_json", &self.notes)?,
            audio_notes_json: encode_column("audio_notes_json", &self.audio_notes)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty() && self.notes.is_empty() && self.audio_notes.is_empty()
    }

    /// Members holding at least one annotation
    pub fn member_count(&self) -> usize {
        let mut members: Vec<UserId> = self
            .levels
            .keys()
            .chain(self.notes.keys())
            .chain(self.audio_notes.keys())
            .copied()
            .collect();
        members.sort_unstable();
        members.dedup();
        members.len()
    }

    /// Mean of all members' levels, `None` when nobody has rated
    pub fn mean_level(&self) -> Option<f64> {
        if self.levels.is_empty() {
            return None;
        }
        let total: i64 = self.levels.values().sum();
        Some(total as f64 / self.levels.len() as f64)
    }

    /// Merge one member's edit; entries of other members are never touched
    pub fn apply(&mut self, user_id: UserId, update: &AnnotationUpdate) {
        if let Some(level) = update.level {
            self.levels.insert(user_id, level.clamp(MIN_LEVEL, MAX_LEVEL));
        }

        if let Some(note) = &update.note {
            self.notes.insert(user_id, note.clone());
        }

        match &update.audio {
            Some(AudioChange::Append(note)) if note.audio.is_empty() => {
                self.audio_notes.remove(&user_id);
            }
            Some(AudioChange::Append(note)) => {
                self.audio_notes
                    .entry(user_id)
                    .or_default()
                    .push(AudioNote::new(note.title.trim(), note.audio.clone()));
            }
            Some(AudioChange::Remove(index)) => {
                if let Some(list) = self.audio_notes.get_mut(&user_id) {
                    if *index < list.len() {
                        list.remove(*index);
                    }
                    if list.is_empty() {
                        self.audio_notes.remove(&user_id);
                    }
                }
            }
            None => {}
        }
    }
}

fn decode_column<T: serde::de::DeserializeOwned + Default>(column: &str, raw: &str) -> Result<T> {
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(raw)
        .map_err(|e| Error::Internal(format!("Corrupt annotation column {}: {}", column, e)))
}

fn encode_column<T: Serialize>(column: &str, value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| Error::Internal(format!("Failed to encode {}: {}", column, e)))
}
