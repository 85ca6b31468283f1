use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::transcription_service::TranscriptionError;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordingMode {
    #[default]
    HoldToTalk,
    Toggle,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MicrophoneTrigger {
    Pressed,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MicrophoneAction {
    Start,
    Stop,
}

/// Where the composer returns to when a recording attempt is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingOrigin {
    Idle,
    Typing { keyboard_visible: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingAuthorization {
    /// Waiting on the platform prompt. A stop that arrives meanwhile is queued.
    Pending { stop_requested: bool },
    Granted,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    Idle,
    Typing,
    Recording,
}

/// The composer's single source of truth. In `Recording`, `draft` is the
/// pre-recording baseline and `live_transcript` the dictation so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputState {
    Idle {
        draft: String,
    },
    Typing {
        draft: String,
        keyboard_visible: bool,
    },
    Recording {
        draft: String,
        live_transcript: String,
        origin: RecordingOrigin,
        authorization: RecordingAuthorization,
    },
}

impl Default for InputState {
    fn default() -> Self {
        Self::Idle {
            draft: String::new(),
        }
    }
}

impl InputState {
    pub fn mode(&self) -> InputMode {
        match self {
            Self::Idle { .. } => InputMode::Idle,
            Self::Typing { .. } => InputMode::Typing,
            Self::Recording { .. } => InputMode::Recording,
        }
    }

    pub fn draft(&self) -> &str {
        match self {
            Self::Idle { draft } | Self::Typing { draft, .. } | Self::Recording { draft, .. } => {
                draft
            }
        }
    }

    /// The text the composer currently shows, including live dictation.
    pub fn composed_text(&self) -> String {
        match self {
            Self::Recording {
                draft,
                live_transcript,
                ..
            } => space_join(draft, live_transcript),
            _ => self.draft().to_string(),
        }
    }

    pub fn keyboard_visible(&self) -> bool {
        matches!(
            self,
            Self::Typing {
                keyboard_visible: true,
                ..
            }
        )
    }

    fn with_draft(&self, next_draft: String) -> Self {
        let mut next = self.clone();
        match &mut next {
            Self::Idle { draft } | Self::Typing { draft, .. } | Self::Recording { draft, .. } => {
                *draft = next_draft
            }
        }
        next
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    TextSurfaceActivated,
    TextChanged(String),
    Microphone(MicrophoneTrigger),
    KeyboardVisibilityChanged(bool),
    Dismissed,
    TranscriptUpdated(String),
    AuthorizationResolved { granted: bool },
    RecognitionFailed(TranscriptionError),
    SendStarted,
    SendSucceeded,
    SendFailed { text: String },
}

/// Work the surrounding screen performs on behalf of a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEffect {
    RequestAuthorization,
    ResetTranscript,
    StartRecognition,
    StopRecognition,
    PermissionRequired,
    RecognitionUnavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionContext {
    pub mode: RecordingMode,
    pub speech_authorized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: InputState,
    pub effects: Vec<InputEffect>,
}

impl Transition {
    fn to(state: InputState) -> Self {
        Self {
            state,
            effects: Vec::new(),
        }
    }

    fn with_effects(state: InputState, effects: Vec<InputEffect>) -> Self {
        Self { state, effects }
    }
}

/// Pure transition function. Events that do not apply to the current node
/// leave the state unchanged and produce no effects.
pub fn transition(state: &InputState, event: InputEvent, context: TransitionContext) -> Transition {
    match (state, event) {
        (InputState::Idle { draft }, InputEvent::TextSurfaceActivated) => {
            Transition::to(InputState::Typing {
                draft: draft.clone(),
                keyboard_visible: true,
            })
        }
        (InputState::Typing { draft, .. }, InputEvent::TextSurfaceActivated) => {
            Transition::to(InputState::Typing {
                draft: draft.clone(),
                keyboard_visible: true,
            })
        }

        (InputState::Idle { .. } | InputState::Typing { .. }, InputEvent::TextChanged(text)) => {
            Transition::to(state.with_draft(text))
        }

        (
            InputState::Typing { draft, .. },
            InputEvent::KeyboardVisibilityChanged(keyboard_visible),
        ) => Transition::to(InputState::Typing {
            draft: draft.clone(),
            keyboard_visible,
        }),

        (InputState::Typing { draft, .. }, InputEvent::Dismissed) => {
            Transition::to(InputState::Idle {
                draft: draft.clone(),
            })
        }

        (_, InputEvent::Microphone(trigger)) => {
            let is_recording = state.mode() == InputMode::Recording;
            match resolve_microphone_action(context.mode, is_recording, trigger) {
                Some(MicrophoneAction::Start) => begin_recording(state, context),
                Some(MicrophoneAction::Stop) => stop_recording(state),
                None => Transition::to(state.clone()),
            }
        }

        (
            InputState::Recording {
                draft,
                origin,
                authorization: RecordingAuthorization::Pending { stop_requested },
                ..
            },
            InputEvent::AuthorizationResolved { granted },
        ) => {
            if !granted {
                return Transition::with_effects(
                    restore_origin(*origin, draft.clone()),
                    vec![InputEffect::PermissionRequired],
                );
            }

            if *stop_requested {
                return Transition::to(InputState::Typing {
                    draft: draft.clone(),
                    keyboard_visible: false,
                });
            }

            Transition::with_effects(
                InputState::Recording {
                    draft: draft.clone(),
                    live_transcript: String::new(),
                    origin: *origin,
                    authorization: RecordingAuthorization::Granted,
                },
                vec![InputEffect::StartRecognition],
            )
        }

        (
            InputState::Recording {
                draft,
                origin,
                authorization: RecordingAuthorization::Granted,
                ..
            },
            InputEvent::TranscriptUpdated(live_transcript),
        ) => Transition::to(InputState::Recording {
            draft: draft.clone(),
            live_transcript,
            origin: *origin,
            authorization: RecordingAuthorization::Granted,
        }),

        (
            InputState::Recording {
                draft,
                live_transcript,
                origin,
                authorization: RecordingAuthorization::Granted,
            },
            InputEvent::RecognitionFailed(error),
        ) => {
            let effect = match error {
                TranscriptionError::PermissionDenied => InputEffect::PermissionRequired,
                TranscriptionError::RecognitionUnavailable(message) => {
                    InputEffect::RecognitionUnavailable(message)
                }
            };
            Transition::with_effects(
                restore_origin(*origin, space_join(draft, live_transcript)),
                vec![effect],
            )
        }

        (InputState::Idle { .. } | InputState::Typing { .. }, InputEvent::SendStarted) => {
            Transition::to(state.with_draft(String::new()))
        }
        (InputState::Recording { authorization, .. }, InputEvent::SendStarted) => {
            let effects = match authorization {
                RecordingAuthorization::Granted => vec![InputEffect::StopRecognition],
                RecordingAuthorization::Pending { .. } => Vec::new(),
            };
            Transition::with_effects(
                InputState::Typing {
                    draft: String::new(),
                    keyboard_visible: false,
                },
                effects,
            )
        }

        (InputState::Typing { draft, .. }, InputEvent::SendSucceeded) if is_blank(draft) => {
            Transition::to(InputState::Idle {
                draft: String::new(),
            })
        }

        (_, InputEvent::SendFailed { text }) => {
            let restored = if is_blank(state.draft()) {
                text
            } else {
                space_join(&text, state.draft())
            };
            Transition::to(state.with_draft(restored))
        }

        _ => Transition::to(state.clone()),
    }
}

fn begin_recording(state: &InputState, context: TransitionContext) -> Transition {
    let (draft, origin) = match state {
        InputState::Idle { draft } => (draft.clone(), RecordingOrigin::Idle),
        InputState::Typing {
            draft,
            keyboard_visible,
        } => (
            draft.clone(),
            RecordingOrigin::Typing {
                keyboard_visible: *keyboard_visible,
            },
        ),
        InputState::Recording { .. } => return Transition::to(state.clone()),
    };

    if context.speech_authorized {
        Transition::with_effects(
            InputState::Recording {
                draft,
                live_transcript: String::new(),
                origin,
                authorization: RecordingAuthorization::Granted,
            },
            vec![InputEffect::ResetTranscript, InputEffect::StartRecognition],
        )
    } else {
        Transition::with_effects(
            InputState::Recording {
                draft,
                live_transcript: String::new(),
                origin,
                authorization: RecordingAuthorization::Pending {
                    stop_requested: false,
                },
            },
            vec![InputEffect::ResetTranscript, InputEffect::RequestAuthorization],
        )
    }
}

fn stop_recording(state: &InputState) -> Transition {
    match state {
        InputState::Recording {
            draft,
            live_transcript,
            authorization: RecordingAuthorization::Granted,
            ..
        } => Transition::with_effects(
            InputState::Typing {
                draft: merge_transcript(draft, live_transcript),
                keyboard_visible: false,
            },
            vec![InputEffect::StopRecognition],
        ),
        InputState::Recording {
            draft,
            live_transcript,
            origin,
            authorization: RecordingAuthorization::Pending { .. },
        } => Transition::to(InputState::Recording {
            draft: draft.clone(),
            live_transcript: live_transcript.clone(),
            origin: *origin,
            authorization: RecordingAuthorization::Pending {
                stop_requested: true,
            },
        }),
        _ => Transition::to(state.clone()),
    }
}

fn restore_origin(origin: RecordingOrigin, draft: String) -> InputState {
    match origin {
        RecordingOrigin::Idle => InputState::Idle { draft },
        RecordingOrigin::Typing { keyboard_visible } => InputState::Typing {
            draft,
            keyboard_visible,
        },
    }
}

fn resolve_microphone_action(
    mode: RecordingMode,
    is_recording: bool,
    trigger: MicrophoneTrigger,
) -> Option<MicrophoneAction> {
    match mode {
        RecordingMode::HoldToTalk => match trigger {
            MicrophoneTrigger::Pressed if !is_recording => Some(MicrophoneAction::Start),
            MicrophoneTrigger::Released if is_recording => Some(MicrophoneAction::Stop),
            _ => None,
        },
        RecordingMode::Toggle => match trigger {
            MicrophoneTrigger::Pressed if is_recording => Some(MicrophoneAction::Stop),
            MicrophoneTrigger::Pressed => Some(MicrophoneAction::Start),
            MicrophoneTrigger::Released => None,
        },
    }
}

/// Merges a finished dictation into the pre-recording draft. An empty
/// transcript leaves the draft exactly as it was.
pub fn merge_transcript(draft: &str, transcript: &str) -> String {
    if is_blank(transcript) {
        return draft.to_string();
    }

    space_join(draft, transcript)
}

fn space_join(prefix: &str, suffix: &str) -> String {
    let prefix = prefix.trim_end();
    let suffix = suffix.trim();
    match (prefix.is_empty(), suffix.is_empty()) {
        (true, _) => suffix.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{prefix} {suffix}"),
    }
}

fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

pub fn can_send_text(text: &str, is_sending: bool) -> bool {
    !is_blank(text) && !is_sending
}

#[derive(Debug, Default)]
pub struct InputController {
    state: InputState,
    is_sending: bool,
    recording_mode: RecordingMode,
}

impl InputController {
    pub fn new(recording_mode: RecordingMode) -> Self {
        Self {
            state: InputState::default(),
            is_sending: false,
            recording_mode,
        }
    }

    pub fn state(&self) -> &InputState {
        &self.state
    }

    pub fn is_sending(&self) -> bool {
        self.is_sending
    }

    pub fn recording_mode(&self) -> RecordingMode {
        self.recording_mode
    }

    pub fn set_recording_mode(&mut self, recording_mode: RecordingMode) {
        self.recording_mode = recording_mode;
    }

    pub fn can_send(&self) -> bool {
        can_send_text(&self.state.composed_text(), self.is_sending)
    }

    pub fn handle(&mut self, event: InputEvent, speech_authorized: bool) -> Vec<InputEffect> {
        let context = TransitionContext {
            mode: self.recording_mode,
            speech_authorized,
        };
        let Transition { state, effects } = transition(&self.state, event, context);

        if state.mode() != self.state.mode() {
            debug!(from = ?self.state.mode(), to = ?state.mode(), "composer mode changed");
        }

        self.state = state;
        effects
    }

    /// Claims the composer for a send. Returns `None` while another send is in
    /// flight; otherwise clears the draft and returns the effects to run.
    pub fn begin_send(&mut self) -> Option<Vec<InputEffect>> {
        if self.is_sending {
            return None;
        }

        self.is_sending = true;
        Some(self.handle(InputEvent::SendStarted, false))
    }

    pub fn complete_send(&mut self) {
        self.is_sending = false;
        self.handle(InputEvent::SendSucceeded, false);
    }

    /// Releases the send lock and puts `text` back into the composer.
    pub fn fail_send(&mut self, text: String) {
        self.is_sending = false;
        self.handle(InputEvent::SendFailed { text }, false);
    }
}
