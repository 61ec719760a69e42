//! Text-to-speech engines
//!
//! - `LogSpeechEngine` - logs each utterance and holds for its spoken length
//! - `CommandSpeechEngine` - runs an external synthesizer (e.g. `espeak-ng`)

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info};

/// Speech could not be produced
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpeechError {
    #[error("speech engine unavailable: {0}")]
    Unavailable(String),
    #[error("speech engine rejected utterance: {0}")]
    Rejected(String),
}

/// Text ready for synthesis
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    /// Plain text, markup already stripped
    pub text: String,
    /// BCP 47 tag, e.g. `zh-CN`
    pub locale: String,
    pub rate: f32,
    pub pitch: f32,
}

/// Speech synthesizer
///
/// `speak` resolves when the utterance finished, failed, or was cancelled.
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    async fn speak(&self, utterance: &Utterance) -> Result<(), SpeechError>;

    /// Stop whatever is currently being spoken
    fn cancel(&self);
}

/// Rough spoken length: about 150 words per minute at rate 1.0
pub fn estimated_duration(utterance: &Utterance) -> Duration {
    let words = utterance.text.split_whitespace().count().max(1) as f64;
    let rate = f64::from(utterance.rate).max(0.1);
    Duration::from_secs_f64(words * 0.4 / rate)
}

/// Logs utterances instead of producing audio
pub struct LogSpeechEngine {
    cancel_tx: watch::Sender<u64>,
}

impl LogSpeechEngine {
    pub fn new() -> Self {
        let (cancel_tx, _) = watch::channel(0);
        Self { cancel_tx }
    }
}

impl Default for LogSpeechEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpeechEngine for LogSpeechEngine {
    async fn speak(&self, utterance: &Utterance) -> Result<(), SpeechError> {
        let mut cancel_rx = self.cancel_tx.subscribe();
        info!(locale = %utterance.locale, text = %utterance.text, "speak");
        tokio::select! {
            _ = tokio::time::sleep(estimated_duration(utterance)) => {}
            _ = cancel_rx.changed() => {
                debug!("speak_cancelled");
            }
        }
        Ok(())
    }

    fn cancel(&self) {
        self.cancel_tx.send_modify(|n| *n += 1);
    }
}

/// Spawns a synthesizer process per utterance
///
/// Argument templates may contain `{text}`, `{locale}`, `{rate}` and `{pitch}`.
pub struct CommandSpeechEngine {
    program: String,
    args: Vec<String>,
    cancel_tx: watch::Sender<u64>,
    last_error: Mutex<Option<SpeechError>>,
}

impl CommandSpeechEngine {
    pub fn new(program: &str, args: &[String]) -> Self {
        let (cancel_tx, _) = watch::channel(0);
        Self {
            program: program.to_string(),
            args: args.to_vec(),
            cancel_tx,
            last_error: Mutex::new(None),
        }
    }

    fn render_args(&self, utterance: &Utterance) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{locale}", &utterance.locale)
                    .replace("{rate}", &format!("{:.2}", utterance.rate))
                    .replace("{pitch}", &format!("{:.2}", utterance.pitch))
                    .replace("{text}", &utterance.text)
            })
            .collect()
    }

    /// Last failure, kept for status output
    pub fn last_error(&self) -> Option<SpeechError> {
        self.last_error.lock().clone()
    }

    fn fail(&self, err: SpeechError) -> Result<(), SpeechError> {
        *self.last_error.lock() = Some(err.clone());
        Err(err)
    }
}

#[async_trait]
impl SpeechEngine for CommandSpeechEngine {
    async fn speak(&self, utterance: &Utterance) -> Result<(), SpeechError> {
        let mut cancel_rx = self.cancel_tx.subscribe();
        let spawned = Command::new(&self.program)
            .args(self.render_args(utterance))
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return self.fail(SpeechError::Unavailable(format!("{} not found", self.program)));
            }
            Err(e) => return self.fail(SpeechError::Unavailable(e.to_string())),
        };

        tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => self.fail(SpeechError::Rejected(format!(
                    "{} exited with {}", self.program, status
                ))),
                Err(e) => self.fail(SpeechError::Unavailable(e.to_string())),
            },
            _ = cancel_rx.changed() => {
                let _ = child.kill().await;
                debug!(program = %self.program, "speak_cancelled");
                Ok(())
            }
        }
    }

    fn cancel(&self) {
        self.cancel_tx.send_modify(|n| *n += 1);
    }
}
