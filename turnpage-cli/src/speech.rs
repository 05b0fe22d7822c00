use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use turnpage_core::{
    SpeechEngine, SpeechError, SpeechEvent, SpeechEventKind, SpeechListener, Subscription,
    Utterance, UtteranceId, Voice,
};

/// Speaking pace at rate 1.0.
const WORDS_PER_SECOND: f32 = 2.5;

struct Playback {
    utterance: UtteranceId,
    remaining: Duration,
    resumed_at: Instant,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Shared {
    listeners: Mutex<Vec<(u64, SpeechListener)>>,
    next_listener: AtomicU64,
    current: Mutex<Option<Playback>>,
}

impl Shared {
    fn emit(&self, event: SpeechEvent) {
        let listeners: Vec<SpeechListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(event.clone());
        }
    }
}

/// Terminal stand-in for a TTS voice: no audio, but utterances take as long
/// as reading them out would and report start and end like a real engine.
#[derive(Clone, Default)]
pub struct SimulatedSpeech {
    shared: Arc<Shared>,
}

impl SimulatedSpeech {
    pub fn new() -> Self {
        Self::default()
    }

    fn duration(utterance: &Utterance) -> Duration {
        let words = utterance.text.split_whitespace().count().max(1) as f32;
        let rate = utterance.rate.clamp(0.1, 10.0);
        Duration::from_secs_f32(words / (WORDS_PER_SECOND * rate))
    }

    fn play(&self, handle: &Handle, utterance: UtteranceId, after: Duration) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        handle.spawn(async move {
            tokio::time::sleep(after).await;
            let finished = {
                let mut current = shared.current.lock();
                if current.as_ref().map(|playback| playback.utterance) == Some(utterance) {
                    current.take()
                } else {
                    None
                }
            };
            if finished.is_some() {
                shared.emit(SpeechEvent {
                    utterance,
                    kind: SpeechEventKind::Ended,
                });
            }
        })
    }
}

impl SpeechEngine for SimulatedSpeech {
    fn voices(&self) -> Vec<Voice> {
        vec![Voice {
            name: "Simulated".to_string(),
            lang: "en-US".to_string(),
            default: true,
        }]
    }

    fn speak(&self, utterance: Utterance) -> Result<(), SpeechError> {
        let handle = Handle::try_current().map_err(|_| SpeechError::Unavailable)?;
        self.cancel();

        let remaining = Self::duration(&utterance);
        debug!(utterance = utterance.id, ?remaining, "speaking");
        let task = self.play(&handle, utterance.id, remaining);
        *self.shared.current.lock() = Some(Playback {
            utterance: utterance.id,
            remaining,
            resumed_at: Instant::now(),
            task: Some(task),
        });
        self.shared.emit(SpeechEvent {
            utterance: utterance.id,
            kind: SpeechEventKind::Started,
        });
        Ok(())
    }

    fn pause(&self) {
        let mut current = self.shared.current.lock();
        if let Some(playback) = current.as_mut() {
            if let Some(task) = playback.task.take() {
                task.abort();
                playback.remaining = playback
                    .remaining
                    .saturating_sub(playback.resumed_at.elapsed());
            }
        }
    }

    fn resume(&self) {
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let mut current = self.shared.current.lock();
        if let Some(playback) = current.as_mut() {
            if playback.task.is_none() {
                playback.resumed_at = Instant::now();
                playback.task = Some(self.play(&handle, playback.utterance, playback.remaining));
            }
        }
    }

    fn cancel(&self) {
        if let Some(playback) = self.shared.current.lock().take() {
            if let Some(task) = playback.task {
                task.abort();
            }
        }
    }

    fn on(&self, listener: SpeechListener) -> Subscription {
        let id = self.shared.next_listener.fetch_add(1, Ordering::SeqCst);
        self.shared.listeners.lock().push((id, listener));
        let shared = Arc::clone(&self.shared);
        Subscription::new(move || shared.listeners.lock().retain(|(entry, _)| *entry != id))
    }
}
