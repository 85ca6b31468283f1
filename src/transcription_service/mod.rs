use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptionError {
    PermissionDenied,
    RecognitionUnavailable(String),
}

impl fmt::Display for TranscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied => {
                write!(f, "Microphone and speech recognition access was denied")
            }
            Self::RecognitionUnavailable(message) => {
                write!(f, "Speech recognition unavailable: {message}")
            }
        }
    }
}

impl std::error::Error for TranscriptionError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Unknown,
    Granted,
    Denied,
}

/// Device speech-to-text. Each recognition session yields cumulative
/// transcripts: every item replaces the previous one rather than extending it.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn request_authorization(&self) -> bool;

    async fn start_recognition(&self) -> Result<mpsc::Receiver<String>, TranscriptionError>;
}

/// Stand-in for hosts without a speech platform.
#[derive(Debug, Default)]
pub struct UnsupportedRecognizer;

#[async_trait]
impl SpeechRecognizer for UnsupportedRecognizer {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    async fn request_authorization(&self) -> bool {
        true
    }

    async fn start_recognition(&self) -> Result<mpsc::Receiver<String>, TranscriptionError> {
        Err(TranscriptionError::RecognitionUnavailable(
            "this host has no speech recognition support".to_string(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptionEvent {
    AuthorizationResolved { granted: bool },
    Partial { session: u64, transcript: String },
    Failed { session: u64, error: TranscriptionError },
    Ended { session: u64 },
}

pub struct TranscriptionService {
    recognizer: Arc<dyn SpeechRecognizer>,
    events: mpsc::UnboundedSender<TranscriptionEvent>,
    authorization: AuthorizationStatus,
    authorization_pending: bool,
    live_transcript: String,
    session: u64,
    active_task: Option<JoinHandle<()>>,
}

impl fmt::Debug for TranscriptionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranscriptionService")
            .field("recognizer", &self.recognizer.name())
            .field("authorization", &self.authorization)
            .field("session", &self.session)
            .field("active", &self.active_task.is_some())
            .finish()
    }
}

impl TranscriptionService {
    pub fn new(
        recognizer: Arc<dyn SpeechRecognizer>,
        events: mpsc::UnboundedSender<TranscriptionEvent>,
    ) -> Self {
        Self {
            recognizer,
            events,
            authorization: AuthorizationStatus::Unknown,
            authorization_pending: false,
            live_transcript: String::new(),
            session: 0,
            active_task: None,
        }
    }

    pub fn authorization_status(&self) -> AuthorizationStatus {
        self.authorization
    }

    pub fn is_authorized(&self) -> bool {
        self.authorization == AuthorizationStatus::Granted
    }

    /// Asks the platform for microphone and speech access. The answer arrives
    /// as `TranscriptionEvent::AuthorizationResolved`; repeated calls while a
    /// request is outstanding do not prompt twice.
    pub fn request_authorization(&mut self) -> AuthorizationStatus {
        if self.authorization == AuthorizationStatus::Granted || self.authorization_pending {
            return self.authorization;
        }

        self.authorization_pending = true;
        let recognizer = Arc::clone(&self.recognizer);
        let events = self.events.clone();
        tokio::spawn(async move {
            let granted = recognizer.request_authorization().await;
            debug!(granted, "speech authorization resolved");
            let _ = events.send(TranscriptionEvent::AuthorizationResolved { granted });
        });

        self.authorization
    }

    pub fn resolve_authorization(&mut self, granted: bool) -> AuthorizationStatus {
        self.authorization_pending = false;
        self.authorization = if granted {
            AuthorizationStatus::Granted
        } else {
            AuthorizationStatus::Denied
        };
        self.authorization
    }

    pub fn reset_live_transcript(&mut self) {
        self.live_transcript.clear();
    }

    /// Opens a fresh recognition session and returns its number. Any session
    /// still running is cancelled first.
    pub fn start(&mut self) -> Result<u64, TranscriptionError> {
        if !self.is_authorized() {
            return Err(TranscriptionError::PermissionDenied);
        }

        self.cancel_active_task();
        self.live_transcript.clear();
        self.session += 1;

        let session = self.session;
        let recognizer = Arc::clone(&self.recognizer);
        let events = self.events.clone();
        info!(session, recognizer = recognizer.name(), "starting speech recognition");

        self.active_task = Some(tokio::spawn(async move {
            let mut updates = match recognizer.start_recognition().await {
                Ok(updates) => updates,
                Err(error) => {
                    warn!(session, error = %error, "speech recognition failed to start");
                    let _ = events.send(TranscriptionEvent::Failed { session, error });
                    return;
                }
            };

            while let Some(transcript) = updates.recv().await {
                if events
                    .send(TranscriptionEvent::Partial {
                        session,
                        transcript,
                    })
                    .is_err()
                {
                    return;
                }
            }

            let _ = events.send(TranscriptionEvent::Ended { session });
        }));

        Ok(session)
    }

    /// Stops the active session and returns the final transcript. Calling it
    /// with nothing running is a no-op.
    pub fn stop(&mut self) -> String {
        if self.active_task.is_some() {
            debug!(session = self.session, "stopping speech recognition");
            self.cancel_active_task();
            self.session += 1;
        }

        self.live_transcript.clone()
    }

    /// Applies a cumulative update. Updates from a stopped or superseded
    /// session are ignored.
    pub fn apply_update(&mut self, session: u64, transcript: String) -> bool {
        if !self.is_current(session) {
            return false;
        }

        self.live_transcript = transcript;
        true
    }

    pub fn finish_session(&mut self, session: u64) {
        if self.is_current(session) {
            self.active_task = None;
        }
    }

    pub fn is_current(&self, session: u64) -> bool {
        self.active_task.is_some() && self.session == session
    }

    pub fn is_active(&self) -> bool {
        self.active_task.is_some()
    }

    pub fn live_transcript(&self) -> &str {
        &self.live_transcript
    }

    fn cancel_active_task(&mut self) {
        if let Some(task) = self.active_task.take() {
            task.abort();
        }
    }
}

impl Drop for TranscriptionService {
    fn drop(&mut self) {
        self.cancel_active_task();
    }
}
