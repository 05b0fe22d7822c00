use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::engine::Subscription;
use crate::error::SpeechError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voice {
    pub name: String,
    pub lang: String,
    pub default: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeechSettings {
    pub rate: f32,
    pub volume: f32,
    /// Voice name; `None` lets the engine pick.
    pub voice: Option<String>,
}

impl Default for SpeechSettings {
    fn default() -> Self {
        Self {
            rate: 1.0,
            volume: 0.8,
            voice: None,
        }
    }
}

pub type UtteranceId = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub id: UtteranceId,
    pub text: String,
    pub rate: f32,
    pub volume: f32,
    pub voice: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechEventKind {
    Started,
    Ended,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechEvent {
    pub utterance: UtteranceId,
    pub kind: SpeechEventKind,
}

pub type SpeechListener = Arc<dyn Fn(SpeechEvent) + Send + Sync>;

/// Platform text-to-speech.
pub trait SpeechEngine: Send + Sync {
    fn voices(&self) -> Vec<Voice>;
    fn speak(&self, utterance: Utterance) -> Result<(), SpeechError>;
    fn pause(&self);
    fn resume(&self);
    /// Drops the current utterance. No `Ended` event follows.
    fn cancel(&self);
    fn on(&self, listener: SpeechListener) -> Subscription;
}

/// Picks an English default voice, then any default, then the first one.
pub fn preferred_voice(voices: &[Voice]) -> Option<&Voice> {
    voices
        .iter()
        .find(|voice| voice.default && (voice.lang == "en-US" || voice.lang == "en-GB"))
        .or_else(|| voices.iter().find(|voice| voice.default))
        .or_else(|| voices.first())
}

/// Engine for hosts without speech output.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentSpeech;

impl SpeechEngine for SilentSpeech {
    fn voices(&self) -> Vec<Voice> {
        Vec::new()
    }

    fn speak(&self, _utterance: Utterance) -> Result<(), SpeechError> {
        Err(SpeechError::Unavailable)
    }

    fn pause(&self) {}

    fn resume(&self) {}

    fn cancel(&self) {}

    fn on(&self, _listener: SpeechListener) -> Subscription {
        Subscription::detached()
    }
}
