use std::{collections::VecDeque, sync::Arc, time::Instant};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    backend::{DeliveryError, MessageBackend},
    conversation_store::{ConversationEntry, ConversationRef, ConversationStore, MessageId},
    input_controller::{
        InputController, InputEffect, InputEvent, InputMode, InputState, RecordingAuthorization,
        RecordingMode,
    },
    scroll_coordinator::{ScrollCommand, ScrollConfig, ScrollFocusCoordinator},
    send_pipeline::{
        ActiveSend, ChannelDelegate, DeliveryEvent, MessageSendPipeline, RetryPolicy, SendId,
        SendProgress,
    },
    transcription_service::{SpeechRecognizer, TranscriptionEvent, TranscriptionService},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiSignal {
    ScrollToLatest { animated: bool },
    DismissKeyboard,
    PermissionRequired,
    RecognitionUnavailable { message: String },
    SendFailed { message: String },
    InputStateChanged(InputState),
    ConversationChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderItem {
    Message {
        id: MessageId,
        author_is_user: bool,
        content: String,
    },
    Streaming {
        id: MessageId,
        text: String,
    },
    /// Reply placeholder shown until the first streamed text arrives.
    Thinking { hint: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScreenEvent {
    Delivery(DeliveryEvent),
    Transcription(TranscriptionEvent),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScreenConfig {
    pub recording_mode: RecordingMode,
    pub scroll: ScrollConfig,
    pub retry_policy: RetryPolicy,
}

/// Owns every piece of mutable conversation state. Background work reports
/// back through channels and is applied one event at a time.
#[derive(Debug)]
pub struct ConversationScreen {
    input: InputController,
    store: ConversationStore,
    scroll: ScrollFocusCoordinator,
    transcription: TranscriptionService,
    pipeline: MessageSendPipeline,
    active_send: Option<ActiveSend>,
    last_send_id: SendId,
    delivery_tx: mpsc::UnboundedSender<DeliveryEvent>,
    delivery_rx: mpsc::UnboundedReceiver<DeliveryEvent>,
    transcription_rx: mpsc::UnboundedReceiver<TranscriptionEvent>,
    signals: mpsc::UnboundedSender<UiSignal>,
    closed: bool,
}

impl ConversationScreen {
    pub fn new(
        conversation: ConversationRef,
        backend: Arc<dyn MessageBackend>,
        recognizer: Arc<dyn SpeechRecognizer>,
        config: ScreenConfig,
    ) -> (Self, mpsc::UnboundedReceiver<UiSignal>) {
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let (transcription_tx, transcription_rx) = mpsc::unbounded_channel();
        let (signals, signal_rx) = mpsc::unbounded_channel();

        info!(
            conversation = %conversation,
            backend = backend.name(),
            recognizer = recognizer.name(),
            "conversation screen opened"
        );

        let screen = Self {
            input: InputController::new(config.recording_mode),
            store: ConversationStore::new(conversation),
            scroll: ScrollFocusCoordinator::new(config.scroll),
            transcription: TranscriptionService::new(recognizer, transcription_tx),
            pipeline: MessageSendPipeline::new(backend, config.retry_policy),
            active_send: None,
            last_send_id: 0,
            delivery_tx,
            delivery_rx,
            transcription_rx,
            signals,
            closed: false,
        };

        (screen, signal_rx)
    }

    pub fn input_state(&self) -> &InputState {
        self.input.state()
    }

    pub fn can_send(&self) -> bool {
        !self.closed && self.input.can_send()
    }

    pub fn is_sending(&self) -> bool {
        self.input.is_sending()
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn recording_mode(&self) -> RecordingMode {
        self.input.recording_mode()
    }

    /// Swaps in new preferences. A send already on the wire keeps the retry
    /// policy it started with.
    pub fn apply_config(&mut self, config: ScreenConfig) {
        self.input.set_recording_mode(config.recording_mode);
        self.scroll.set_config(config.scroll);
        self.pipeline =
            MessageSendPipeline::new(self.pipeline.backend().clone(), config.retry_policy);
        debug!(?config, "screen config applied");
    }

    /// Fetches the initial page of history. Skipped while a reply streams.
    pub async fn load_history(&mut self) -> Result<usize, DeliveryError> {
        if self.closed {
            return Ok(0);
        }

        let messages = self
            .pipeline
            .backend()
            .fetch_messages(self.store.conversation())
            .await?;
        let count = messages.len();

        if let Err(error) = self.store.load(messages) {
            debug!(error = %error, "history load skipped");
            return Ok(0);
        }

        self.emit(UiSignal::ConversationChanged);
        self.emit(UiSignal::ScrollToLatest { animated: false });
        Ok(count)
    }

    /// Starts sending `text`. Returns `false` without side effects when the
    /// text is blank, a send is in flight, or the screen is closed.
    pub fn send_tapped(&mut self, text: &str) -> bool {
        if self.closed {
            return false;
        }

        let send_id = self.last_send_id + 1;
        let Some((active, effects)) =
            self.pipeline
                .begin(text, send_id, &mut self.store, &mut self.input)
        else {
            debug!(send_id, "send ignored");
            return false;
        };
        self.last_send_id = send_id;

        self.run_effects(effects);
        self.spawn_delivery(&active);
        self.active_send = Some(active);

        let command = self.scroll.user_sent(Instant::now());
        self.emit_scroll(Some(command));
        self.emit(UiSignal::ConversationChanged);
        self.emit(UiSignal::InputStateChanged(self.input.state().clone()));
        true
    }

    pub fn handle_input(&mut self, event: InputEvent) {
        if self.closed {
            return;
        }

        let before = self.input.state().clone();
        let effects = self
            .input
            .handle(event, self.transcription.is_authorized());
        self.run_effects(effects);

        let after = self.input.state();
        if *after == before {
            return;
        }

        if after.mode() == InputMode::Recording && before.mode() != InputMode::Recording {
            let command = self.scroll.recording_started(before.keyboard_visible());
            self.emit_scroll(command);
        }
        self.emit(UiSignal::InputStateChanged(after.clone()));
    }

    pub fn user_scrolled(&mut self, at_bottom: bool) {
        if !self.closed {
            self.scroll.user_scrolled(at_bottom);
        }
    }

    pub fn keyboard_visibility_changed(&mut self, visible: bool) {
        if self.closed {
            return;
        }

        self.handle_input(InputEvent::KeyboardVisibilityChanged(visible));
        let command = self.scroll.keyboard_visibility_changed(visible);
        self.emit_scroll(command);
    }

    pub fn render_items(&self) -> Vec<RenderItem> {
        let hint = self
            .active_send
            .as_ref()
            .and_then(|active| active.thinking_hint.as_ref())
            .map(|analysis| analysis.contextual_hint.clone())
            .filter(|hint| !hint.trim().is_empty());

        self.store
            .all()
            .into_iter()
            .map(|entry| match entry {
                ConversationEntry::Committed(message) => RenderItem::Message {
                    id: message.id.clone(),
                    author_is_user: message.author_is_user,
                    content: message.content.clone(),
                },
                ConversationEntry::Streaming(draft) if draft.accumulated_text.is_empty() => {
                    RenderItem::Thinking { hint: hint.clone() }
                }
                ConversationEntry::Streaming(draft) => RenderItem::Streaming {
                    id: draft.id.clone(),
                    text: draft.accumulated_text.clone(),
                },
            })
            .collect()
    }

    /// Waits for the next background event. Returns `None` once closed.
    pub async fn next_event(&mut self) -> Option<ScreenEvent> {
        if self.closed {
            return None;
        }

        tokio::select! {
            Some(event) = self.delivery_rx.recv() => Some(ScreenEvent::Delivery(event)),
            Some(event) = self.transcription_rx.recv() => Some(ScreenEvent::Transcription(event)),
            else => None,
        }
    }

    pub fn handle_event(&mut self, event: ScreenEvent) {
        if self.closed {
            return;
        }

        match event {
            ScreenEvent::Delivery(event) => self.handle_delivery_event(event),
            ScreenEvent::Transcription(event) => self.handle_transcription_event(event),
        }
    }

    /// Applies events until no send is in flight and no authorization prompt
    /// is outstanding.
    pub async fn run_until_settled(&mut self) {
        while !self.is_settled() {
            match self.next_event().await {
                Some(event) => self.handle_event(event),
                None => break,
            }
        }
    }

    /// Leaves the screen: dictation stops and late callbacks become no-ops.
    /// A send already on the wire is not cancelled, its result is dropped.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }

        self.closed = true;
        self.transcription.stop();
        self.active_send = None;
        self.delivery_rx.close();
        self.transcription_rx.close();
        info!(conversation = %self.store.conversation(), "conversation screen closed");
    }

    fn is_settled(&self) -> bool {
        let awaiting_authorization = matches!(
            self.input.state(),
            InputState::Recording {
                authorization: RecordingAuthorization::Pending { .. },
                ..
            }
        );
        self.closed || (self.active_send.is_none() && !awaiting_authorization)
    }

    fn spawn_delivery(&self, active: &ActiveSend) {
        let delegate = ChannelDelegate::new(self.delivery_tx.clone());

        let pipeline = self.pipeline.clone();
        let request = active.request.clone();
        let analysis_delegate = delegate.clone();
        tokio::spawn(async move {
            pipeline.analyze(&request, &analysis_delegate).await;
        });

        let pipeline = self.pipeline.clone();
        let request = active.request.clone();
        tokio::spawn(async move {
            pipeline.deliver(&request, &delegate).await;
        });
    }

    fn handle_delivery_event(&mut self, event: DeliveryEvent) {
        let Some(active) = self.active_send.as_mut() else {
            debug!(send_id = event.send_id(), "delivery event without active send");
            return;
        };
        if event.send_id() != active.send_id() {
            debug!(send_id = event.send_id(), "delivery event for stale send");
            return;
        }

        let progress = self
            .pipeline
            .apply(active, event, &mut self.store, &mut self.input);

        match progress {
            SendProgress::Continue => self.emit(UiSignal::ConversationChanged),
            SendProgress::Streaming => {
                self.emit(UiSignal::ConversationChanged);
                let command = self.scroll.content_changed(Instant::now());
                self.emit_scroll(command);
            }
            SendProgress::Committed(_) => {
                self.active_send = None;
                self.emit(UiSignal::ConversationChanged);
                let command = self.scroll.stream_resolved();
                self.emit_scroll(command);
                self.emit(UiSignal::InputStateChanged(self.input.state().clone()));
            }
            SendProgress::RolledBack(error) => {
                self.active_send = None;
                self.scroll.clear_pending();
                self.emit(UiSignal::ConversationChanged);
                self.emit(UiSignal::SendFailed {
                    message: error.to_string(),
                });
                self.emit(UiSignal::InputStateChanged(self.input.state().clone()));
            }
        }
    }

    fn handle_transcription_event(&mut self, event: TranscriptionEvent) {
        match event {
            TranscriptionEvent::AuthorizationResolved { granted } => {
                self.transcription.resolve_authorization(granted);
                self.handle_input(InputEvent::AuthorizationResolved { granted });
            }
            TranscriptionEvent::Partial {
                session,
                transcript,
            } => {
                if self.transcription.apply_update(session, transcript.clone()) {
                    self.handle_input(InputEvent::TranscriptUpdated(transcript));
                }
            }
            TranscriptionEvent::Failed { session, error } => {
                if self.transcription.is_current(session) {
                    self.transcription.finish_session(session);
                    self.handle_input(InputEvent::RecognitionFailed(error));
                }
            }
            TranscriptionEvent::Ended { session } => {
                self.transcription.finish_session(session);
            }
        }
    }

    fn run_effects(&mut self, effects: Vec<InputEffect>) {
        let mut queue = VecDeque::from(effects);
        while let Some(effect) = queue.pop_front() {
            if let Some(follow_up) = self.run_effect(effect) {
                let effects = self
                    .input
                    .handle(follow_up, self.transcription.is_authorized());
                queue.extend(effects);
            }
        }
    }

    fn run_effect(&mut self, effect: InputEffect) -> Option<InputEvent> {
        match effect {
            InputEffect::RequestAuthorization => {
                self.transcription.request_authorization();
                None
            }
            InputEffect::ResetTranscript => {
                self.transcription.reset_live_transcript();
                None
            }
            InputEffect::StartRecognition => self
                .transcription
                .start()
                .err()
                .map(InputEvent::RecognitionFailed),
            InputEffect::StopRecognition => {
                self.transcription.stop();
                None
            }
            InputEffect::PermissionRequired => {
                self.emit(UiSignal::PermissionRequired);
                None
            }
            InputEffect::RecognitionUnavailable(message) => {
                self.emit(UiSignal::RecognitionUnavailable { message });
                None
            }
        }
    }

    fn emit_scroll(&self, command: Option<ScrollCommand>) {
        match command {
            Some(ScrollCommand::ScrollToLatest { animated }) => {
                self.emit(UiSignal::ScrollToLatest { animated })
            }
            Some(ScrollCommand::DismissKeyboard) => self.emit(UiSignal::DismissKeyboard),
            None => {}
        }
    }

    fn emit(&self, signal: UiSignal) {
        let _ = self.signals.send(signal);
    }
}
