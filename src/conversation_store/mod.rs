use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationRef(String);

impl ConversationRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A committed conversation message. The store never edits one in place; a
/// correction is appended as a new message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub author_is_user: bool,
    pub content: String,
    #[serde(rename = "conversationId")]
    pub conversation: ConversationRef,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn from_user(conversation: ConversationRef, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            author_is_user: true,
            content: content.into(),
            conversation,
            created_at: Utc::now(),
        }
    }
}

/// The reply currently being streamed. Its id is allocated up front and becomes
/// the id of the committed reply.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingDraft {
    pub id: MessageId,
    pub accumulated_text: String,
    pub started_at: DateTime<Utc>,
}

impl StreamingDraft {
    pub fn new() -> Self {
        Self {
            id: MessageId::generate(),
            accumulated_text: String::new(),
            started_at: Utc::now(),
        }
    }

    fn into_message(self, conversation: ConversationRef) -> Message {
        Message {
            id: self.id,
            author_is_user: false,
            content: self.accumulated_text,
            conversation,
            created_at: Utc::now(),
        }
    }
}

impl Default for StreamingDraft {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    StreamingAlreadyInProgress,
    NoActiveStream,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamingAlreadyInProgress => {
                write!(f, "A reply is already streaming in this conversation")
            }
            Self::NoActiveStream => write!(f, "No reply is currently streaming"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConversationEntry<'a> {
    Committed(&'a Message),
    Streaming(&'a StreamingDraft),
}

#[derive(Debug)]
pub struct ConversationStore {
    conversation: ConversationRef,
    messages: Vec<Message>,
    streaming: Option<StreamingDraft>,
}

impl ConversationStore {
    pub fn new(conversation: ConversationRef) -> Self {
        Self {
            conversation,
            messages: Vec::new(),
            streaming: None,
        }
    }

    pub fn conversation(&self) -> &ConversationRef {
        &self.conversation
    }

    /// Replaces committed history with a freshly fetched page. Refused while a
    /// reply is streaming so a late load cannot clobber an in-flight send.
    pub fn load(&mut self, messages: Vec<Message>) -> Result<(), StoreError> {
        if self.streaming.is_some() {
            return Err(StoreError::StreamingAlreadyInProgress);
        }

        debug!(
            conversation = %self.conversation,
            count = messages.len(),
            "loaded conversation history"
        );
        self.messages = messages;
        Ok(())
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let index = self.messages.iter().position(|message| &message.id == id)?;
        Some(self.messages.remove(index))
    }

    pub fn begin_streaming(&mut self, draft: StreamingDraft) -> Result<(), StoreError> {
        if self.streaming.is_some() {
            return Err(StoreError::StreamingAlreadyInProgress);
        }

        self.streaming = Some(draft);
        Ok(())
    }

    pub fn append_chunk(&mut self, text: &str) -> Result<(), StoreError> {
        let draft = self.streaming.as_mut().ok_or(StoreError::NoActiveStream)?;
        draft.accumulated_text.push_str(text);
        Ok(())
    }

    /// Drops provisional text when a delivery attempt restarts from scratch.
    pub fn replace_streaming_text(&mut self, text: &str) -> Result<(), StoreError> {
        let draft = self.streaming.as_mut().ok_or(StoreError::NoActiveStream)?;
        draft.accumulated_text.clear();
        draft.accumulated_text.push_str(text);
        Ok(())
    }

    pub fn commit_streaming(&mut self) -> Result<Message, StoreError> {
        let draft = self.streaming.take().ok_or(StoreError::NoActiveStream)?;
        let message = draft.into_message(self.conversation.clone());
        self.messages.push(message.clone());
        Ok(message)
    }

    pub fn discard_streaming(&mut self) -> Option<StreamingDraft> {
        self.streaming.take()
    }

    pub fn streaming(&self) -> Option<&StreamingDraft> {
        self.streaming.as_ref()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.is_some()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Committed messages followed by the streaming placeholder, if any.
    pub fn all(&self) -> Vec<ConversationEntry<'_>> {
        let mut entries = self
            .messages
            .iter()
            .map(ConversationEntry::Committed)
            .collect::<Vec<_>>();

        if let Some(draft) = &self.streaming {
            entries.push(ConversationEntry::Streaming(draft));
        }

        entries
    }

    pub fn len(&self) -> usize {
        self.messages.len() + usize::from(self.streaming.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
