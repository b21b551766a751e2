//! Speech capture and synthesis collaborators.
//!
//! Platform speech support is optional. A [`SpeechRecognizer`] reports
//! whether it works at all; [`VoiceInput`] wraps one and degrades to a no-op
//! when it does not, so callers fall back to typed input.

use std::io;
use std::process::Stdio;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// One notification from a speech recognizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// A final transcript.
    Result(String),
    /// Recognition failed; the description is platform specific.
    Error(String),
    /// The recognizer stopped listening.
    End,
}

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("speech is not supported on this platform")]
    Unsupported,

    #[error("speech command is empty")]
    EmptyCommand,

    #[error("failed to start speech command `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Platform speech-to-text.
pub trait SpeechRecognizer: Send {
    fn is_supported(&self) -> bool;

    /// Starts listening for one utterance.
    fn start(&mut self) -> Result<(), VoiceError>;

    fn stop(&mut self);

    /// Waits for the next event; `None` once the recognizer is gone.
    fn next_event(&mut self) -> BoxFuture<'_, Option<RecognitionEvent>>;
}

/// Platform text-to-speech.
pub trait SpeechSynthesizer: Send {
    /// Speaks `text`, cancelling any utterance still in progress.
    fn speak(&mut self, text: &str) -> Result<(), VoiceError>;
}

impl<S: SpeechSynthesizer + ?Sized> SpeechSynthesizer for Box<S> {
    fn speak(&mut self, text: &str) -> Result<(), VoiceError> {
        (**self).speak(text)
    }
}

/// Recognizer front end tracking the listening state.
///
/// # Examples
///
/// ```
/// use buddy_relay::voice::{Unsupported, VoiceInput};
///
/// let mut input = VoiceInput::new(Unsupported);
/// assert!(!input.supported());
/// assert!(!input.start());
/// assert!(!input.listening());
/// ```
pub struct VoiceInput<R> {
    recognizer: R,
    listening: bool,
}

impl<R: SpeechRecognizer> VoiceInput<R> {
    pub fn new(recognizer: R) -> Self {
        Self {
            recognizer,
            listening: false,
        }
    }

    pub fn supported(&self) -> bool {
        self.recognizer.is_supported()
    }

    pub fn listening(&self) -> bool {
        self.listening
    }

    /// Starts listening. Returns `false` when speech is unavailable.
    pub fn start(&mut self) -> bool {
        if !self.supported() {
            debug!("speech recognition unavailable; text input only");
            return false;
        }
        match self.recognizer.start() {
            Ok(()) => {
                self.listening = true;
                true
            }
            Err(e) => {
                warn!(error = %e, "could not start speech recognition");
                false
            }
        }
    }

    pub fn stop(&mut self) {
        if self.supported() {
            self.recognizer.stop();
        }
        self.listening = false;
    }

    /// Next recognizer event. Always `None` when speech is unavailable.
    pub async fn next_event(&mut self) -> Option<RecognitionEvent> {
        if !self.supported() {
            return None;
        }
        let event = self.recognizer.next_event().await;
        if !matches!(event, Some(RecognitionEvent::Result(_))) {
            self.listening = false;
        }
        event
    }
}

/// Stand-in for platforms without speech: never recognizes, speaks nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unsupported;

impl SpeechRecognizer for Unsupported {
    fn is_supported(&self) -> bool {
        false
    }

    fn start(&mut self) -> Result<(), VoiceError> {
        Err(VoiceError::Unsupported)
    }

    fn stop(&mut self) {}

    fn next_event(&mut self) -> BoxFuture<'_, Option<RecognitionEvent>> {
        Box::pin(async { None })
    }
}

impl SpeechSynthesizer for Unsupported {
    fn speak(&mut self, _text: &str) -> Result<(), VoiceError> {
        Ok(())
    }
}

/// Speaks by running an external program with the text as its last argument,
/// e.g. `espeak` or `say -v Samantha`.
#[derive(Debug)]
pub struct CommandSynthesizer {
    program: String,
    args: Vec<String>,
    current: Option<Child>,
}

impl CommandSynthesizer {
    /// Parses a whitespace-separated command line.
    pub fn new(command: &str) -> Result<Self, VoiceError> {
        let mut parts = command.split_whitespace().map(str::to_owned);
        let program = parts.next().ok_or(VoiceError::EmptyCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
            current: None,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn cancel(&mut self) {
        if let Some(mut child) = self.current.take() {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "previous utterance already finished");
            }
        }
    }
}

impl SpeechSynthesizer for CommandSynthesizer {
    fn speak(&mut self, text: &str) -> Result<(), VoiceError> {
        self.cancel();
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| VoiceError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        self.current = Some(child);
        Ok(())
    }
}
