//! Narration playback control
//!
//! Owns `PlaybackState` and the single in-flight utterance slot. Speech runs
//! on a spawned task; its completion comes back through the receiver returned
//! by `NarrationController::new` and must be fed to `on_finished`.

use crate::domain::PlaybackState;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::speech::{SpeechEngine, SpeechError, Utterance};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// App language codes whose speech locale differs from the code itself
const DEFAULT_LOCALES: &[(&str, &str)] = &[("zh", "zh-CN")];

static BLOCK_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<\s*/?\s*(br|div|p|li)\b[^>]*>").expect("static regex")
});
static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("static regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

/// Speech locale for an app language code
pub fn speech_locale(code: &str, overrides: &HashMap<String, String>) -> String {
    if let Some(locale) = overrides.get(code) {
        return locale.clone();
    }
    DEFAULT_LOCALES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, locale)| (*locale).to_string())
        .unwrap_or_else(|| code.to_string())
}

/// Plain text from instruction markup
pub fn strip_markup(text: &str) -> String {
    let text = BLOCK_TAG.replace_all(text, " ");
    let text = ANY_TAG.replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

#[derive(Debug, Clone, PartialEq)]
pub struct NarrationConfig {
    pub language: String,
    pub rate: f32,
    pub pitch: f32,
    pub locale_overrides: HashMap<String, String>,
}

impl Default for NarrationConfig {
    fn default() -> Self {
        Self { language: "en".to_string(), rate: 0.9, pitch: 1.0, locale_overrides: HashMap::new() }
    }
}

impl From<&Config> for NarrationConfig {
    fn from(config: &Config) -> Self {
        Self {
            language: config.language().to_string(),
            rate: config.speech_rate(),
            pitch: config.speech_pitch(),
            locale_overrides: config.locale_overrides().clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UtteranceId(pub u64);

/// Completion report from the speech task
#[derive(Debug)]
pub struct SpeechDone {
    pub id: UtteranceId,
    pub result: Result<(), SpeechError>,
}

struct InFlight {
    id: UtteranceId,
    handle: JoinHandle<()>,
}

pub struct NarrationController {
    engine: Arc<dyn SpeechEngine>,
    config: NarrationConfig,
    metrics: Arc<Metrics>,
    playback: PlaybackState,
    /// Narration for the current step or point, replayed on resume/unmute
    current_text: Option<String>,
    in_flight: Option<InFlight>,
    next_id: u64,
    done_tx: mpsc::Sender<SpeechDone>,
}

impl NarrationController {
    pub fn new(
        engine: Arc<dyn SpeechEngine>,
        config: NarrationConfig,
        metrics: Arc<Metrics>,
    ) -> (Self, mpsc::Receiver<SpeechDone>) {
        let (done_tx, done_rx) = mpsc::channel(8);
        let controller = Self {
            engine,
            config,
            metrics,
            playback: PlaybackState::default(),
            current_text: None,
            in_flight: None,
            next_id: 0,
            done_tx,
        };
        (controller, done_rx)
    }

    /// Speak `text` now, replacing anything in flight. No-op while muted or
    /// when nothing is left after stripping markup.
    pub fn speak(&mut self, text: &str) -> Option<UtteranceId> {
        if self.playback.is_muted {
            return None;
        }
        let text = strip_markup(text);
        if text.is_empty() {
            return None;
        }

        self.cancel_in_flight();

        self.next_id += 1;
        let id = UtteranceId(self.next_id);
        let utterance = Utterance {
            text,
            locale: speech_locale(&self.config.language, &self.config.locale_overrides),
            rate: self.config.rate,
            pitch: self.config.pitch,
        };
        debug!(utterance_id = id.0, locale = %utterance.locale, "utterance_started");

        let engine = self.engine.clone();
        let done_tx = self.done_tx.clone();
        let handle = tokio::spawn(async move {
            let result = engine.speak(&utterance).await;
            let _ = done_tx.send(SpeechDone { id, result }).await;
        });
        self.metrics.record_utterance_started();
        self.in_flight = Some(InFlight { id, handle });
        Some(id)
    }

    /// Make `text` the current narration and speak it if playing
    pub fn announce(&mut self, text: &str) -> Option<UtteranceId> {
        self.current_text = Some(text.to_string());
        if self.playback.is_playing {
            self.speak(text)
        } else {
            None
        }
    }

    /// Replace the current narration without speaking it
    pub fn set_current(&mut self, text: Option<String>) {
        self.current_text = text;
    }

    pub fn toggle_play(&mut self) -> PlaybackState {
        self.playback.is_playing = !self.playback.is_playing;
        if self.playback.is_playing {
            self.replay_current();
        } else {
            self.cancel_in_flight();
        }
        info!(is_playing = self.playback.is_playing, "playback_toggled");
        self.playback
    }

    pub fn toggle_mute(&mut self) -> PlaybackState {
        self.playback.is_muted = !self.playback.is_muted;
        if self.playback.is_muted {
            self.cancel_in_flight();
        } else if self.playback.is_playing {
            self.replay_current();
        }
        info!(is_muted = self.playback.is_muted, "mute_toggled");
        self.playback
    }

    /// Set playing without replaying (session start)
    pub fn set_playing(&mut self, playing: bool) {
        self.playback.is_playing = playing;
        if !playing {
            self.cancel_in_flight();
        }
    }

    pub fn set_language(&mut self, language: &str) {
        self.config.language = language.to_string();
    }

    pub fn language(&self) -> &str {
        &self.config.language
    }

    /// Handle a completion; reports for superseded utterances are ignored.
    /// Returns the failure of the current utterance, if it failed.
    pub fn on_finished(&mut self, done: SpeechDone) -> Option<SpeechError> {
        match &self.in_flight {
            Some(current) if current.id == done.id => {
                self.in_flight = None;
            }
            _ => {
                debug!(utterance_id = done.id.0, "stale_speech_completion");
                return None;
            }
        }
        let err = done.result.err()?;
        self.metrics.record_speech_error();
        log_speech_failed(&err);
        Some(err)
    }

    /// Cancel speech and pause playback
    pub fn stop(&mut self) {
        self.cancel_in_flight();
        self.playback.is_playing = false;
        self.current_text = None;
    }

    pub fn is_speaking(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn state(&self) -> PlaybackState {
        self.playback
    }

    fn replay_current(&mut self) {
        if let Some(text) = self.current_text.clone() {
            self.speak(&text);
        }
    }

    fn cancel_in_flight(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.handle.abort();
            self.engine.cancel();
            self.metrics.record_utterance_cancelled();
            debug!(utterance_id = in_flight.id.0, "utterance_cancelled");
        }
    }
}

impl Drop for NarrationController {
    fn drop(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.handle.abort();
        }
    }
}

#[cold]
fn log_speech_failed(e: &SpeechError) {
    warn!(error = %e, "speech_failed");
}
