use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    backend::{AnalysisResult, DeliveryError, MessageBackend},
    conversation_store::{ConversationRef, ConversationStore, Message, MessageId, StreamingDraft},
    input_controller::{can_send_text, InputController, InputEffect},
};

const DEFAULT_MAX_ATTEMPTS: u32 = 2;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;

pub type SendId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

/// What a background delivery or analysis task reports back to the owner.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryEvent {
    AttemptStarted {
        send_id: SendId,
        attempt: u32,
    },
    Chunk {
        send_id: SendId,
        attempt: u32,
        text: String,
    },
    AnalysisReady {
        send_id: SendId,
        result: AnalysisResult,
    },
    Finished {
        send_id: SendId,
        result: Result<(), DeliveryError>,
    },
}

impl DeliveryEvent {
    pub fn send_id(&self) -> SendId {
        match self {
            Self::AttemptStarted { send_id, .. }
            | Self::Chunk { send_id, .. }
            | Self::AnalysisReady { send_id, .. }
            | Self::Finished { send_id, .. } => *send_id,
        }
    }
}

pub trait DeliveryDelegate: Send + Sync {
    fn attempt_started(&self, send_id: SendId, attempt: u32);
    fn chunk_received(&self, send_id: SendId, attempt: u32, text: &str);
    fn analysis_ready(&self, send_id: SendId, result: AnalysisResult);
    fn delivery_finished(&self, send_id: SendId, result: Result<(), DeliveryError>);
}

/// Forwards delivery callbacks to the owner's event loop. Once the receiver is
/// gone every callback is silently dropped.
#[derive(Debug, Clone)]
pub struct ChannelDelegate {
    events: mpsc::UnboundedSender<DeliveryEvent>,
}

impl ChannelDelegate {
    pub fn new(events: mpsc::UnboundedSender<DeliveryEvent>) -> Self {
        Self { events }
    }

    fn forward(&self, event: DeliveryEvent) {
        let _ = self.events.send(event);
    }
}

impl DeliveryDelegate for ChannelDelegate {
    fn attempt_started(&self, send_id: SendId, attempt: u32) {
        self.forward(DeliveryEvent::AttemptStarted { send_id, attempt });
    }

    fn chunk_received(&self, send_id: SendId, attempt: u32, text: &str) {
        self.forward(DeliveryEvent::Chunk {
            send_id,
            attempt,
            text: text.to_string(),
        });
    }

    fn analysis_ready(&self, send_id: SendId, result: AnalysisResult) {
        self.forward(DeliveryEvent::AnalysisReady { send_id, result });
    }

    fn delivery_finished(&self, send_id: SendId, result: Result<(), DeliveryError>) {
        self.forward(DeliveryEvent::Finished { send_id, result });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub send_id: SendId,
    pub text: String,
    pub conversation: ConversationRef,
}

/// Owner-side bookkeeping for the one send in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSend {
    pub request: SendRequest,
    pub user_message_id: MessageId,
    pub attempt: u32,
    pub thinking_hint: Option<AnalysisResult>,
    pub received_text: bool,
}

impl ActiveSend {
    pub fn send_id(&self) -> SendId {
        self.request.send_id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendProgress {
    Continue,
    Streaming,
    /// `None` when the reply was blank and no bubble was kept.
    Committed(Option<Message>),
    RolledBack(DeliveryError),
}

#[derive(Clone)]
pub struct MessageSendPipeline {
    backend: Arc<dyn MessageBackend>,
    retry_policy: RetryPolicy,
}

impl std::fmt::Debug for MessageSendPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSendPipeline")
            .field("backend", &self.backend.name())
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

impl MessageSendPipeline {
    pub fn new(backend: Arc<dyn MessageBackend>, retry_policy: RetryPolicy) -> Self {
        Self {
            backend,
            retry_policy: RetryPolicy {
                max_attempts: retry_policy.max_attempts.max(1),
                ..retry_policy
            },
        }
    }

    pub fn backend(&self) -> &Arc<dyn MessageBackend> {
        &self.backend
    }

    /// Optimistically commits the user's message and opens the reply draft.
    /// Returns `None`, touching nothing, when the text is blank or a send is
    /// already in flight.
    pub fn begin(
        &self,
        text: &str,
        send_id: SendId,
        store: &mut ConversationStore,
        input: &mut InputController,
    ) -> Option<(ActiveSend, Vec<InputEffect>)> {
        if !can_send_text(text, input.is_sending()) {
            return None;
        }
        if store.is_streaming() {
            warn!(send_id, "refusing send while a reply is still streaming");
            return None;
        }

        let text = text.trim();
        let effects = input.begin_send()?;
        let message = Message::from_user(store.conversation().clone(), text);
        let user_message_id = message.id.clone();
        store.append(message);

        if let Err(error) = store.begin_streaming(StreamingDraft::new()) {
            warn!(send_id, error = %error, "could not open reply draft");
            store.remove(&user_message_id);
            input.fail_send(text.to_string());
            return None;
        }

        debug!(send_id, chars = text.chars().count(), "send started");
        Some((
            ActiveSend {
                request: SendRequest {
                    send_id,
                    text: text.to_string(),
                    conversation: store.conversation().clone(),
                },
                user_message_id,
                attempt: 0,
                thinking_hint: None,
                received_text: false,
            },
            effects,
        ))
    }

    /// Applies one background event to the owner's state. Events for another
    /// send, or chunks from a superseded attempt, change nothing.
    pub fn apply(
        &self,
        active: &mut ActiveSend,
        event: DeliveryEvent,
        store: &mut ConversationStore,
        input: &mut InputController,
    ) -> SendProgress {
        let send_id = active.send_id();
        if event.send_id() != send_id {
            debug!(send_id, stale = event.send_id(), "ignoring event for inactive send");
            return SendProgress::Continue;
        }

        match event {
            DeliveryEvent::AttemptStarted { attempt, .. } => {
                if attempt > 1 {
                    if let Err(error) = store.replace_streaming_text("") {
                        warn!(send_id, error = %error, "could not reset reply draft");
                    }
                    active.received_text = false;
                }
                active.attempt = attempt;
                SendProgress::Continue
            }
            DeliveryEvent::Chunk { attempt, text, .. } => {
                if attempt != active.attempt {
                    debug!(send_id, attempt, "ignoring chunk from superseded attempt");
                    return SendProgress::Continue;
                }
                if let Err(error) = store.append_chunk(&text) {
                    warn!(send_id, error = %error, "dropping chunk without a draft");
                    return SendProgress::Continue;
                }
                if !text.is_empty() {
                    active.received_text = true;
                    active.thinking_hint = None;
                }
                SendProgress::Streaming
            }
            DeliveryEvent::AnalysisReady { result, .. } => {
                if !active.received_text {
                    active.thinking_hint = Some(result);
                }
                SendProgress::Continue
            }
            DeliveryEvent::Finished { result: Ok(()), .. } => {
                active.thinking_hint = None;
                input.complete_send();

                let blank = store
                    .streaming()
                    .map_or(true, |draft| draft.accumulated_text.trim().is_empty());
                if blank {
                    store.discard_streaming();
                    info!(send_id, "reply was empty; nothing committed");
                    return SendProgress::Committed(None);
                }

                match store.commit_streaming() {
                    Ok(message) => {
                        info!(send_id, chars = message.content.chars().count(), "reply committed");
                        SendProgress::Committed(Some(message))
                    }
                    Err(error) => {
                        warn!(send_id, error = %error, "reply draft vanished before commit");
                        SendProgress::Committed(None)
                    }
                }
            }
            DeliveryEvent::Finished {
                result: Err(error), ..
            } => {
                warn!(send_id, error = %error, "send failed; rolling back");
                store.discard_streaming();
                store.remove(&active.user_message_id);
                active.thinking_hint = None;
                input.fail_send(active.request.text.clone());
                SendProgress::RolledBack(error)
            }
        }
    }

    /// Streams the reply, retrying interrupted connections per the policy.
    /// Always ends with exactly one `delivery_finished` call.
    pub async fn deliver<D: DeliveryDelegate>(&self, request: &SendRequest, delegate: &D) {
        let send_id = request.send_id;
        let mut attempt = 1;

        loop {
            delegate.attempt_started(send_id, attempt);
            let on_chunk = move |chunk: &str| delegate.chunk_received(send_id, attempt, chunk);

            let result = self
                .backend
                .send_message_stream(&request.text, &request.conversation, &on_chunk)
                .await;

            match result {
                Ok(()) => {
                    debug!(send_id, attempt, "delivery stream finished");
                    delegate.delivery_finished(send_id, Ok(()));
                    return;
                }
                Err(error) if error.is_transient() && attempt < self.retry_policy.max_attempts => {
                    warn!(send_id, attempt, error = %error, "delivery interrupted; retrying");
                    tokio::time::sleep(self.retry_policy.retry_delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    delegate.delivery_finished(send_id, Err(error));
                    return;
                }
            }
        }
    }

    /// Best-effort intent analysis. Failures only cost the thinking hint.
    pub async fn analyze<D: DeliveryDelegate>(&self, request: &SendRequest, delegate: &D) {
        match self.backend.analyze_message(&request.text).await {
            Ok(result) => delegate.analysis_ready(request.send_id, result),
            Err(error) => {
                debug!(send_id = request.send_id, error = %error, "intent analysis skipped");
            }
        }
    }
}
