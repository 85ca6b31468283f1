pub mod http;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::conversation_store::{ConversationRef, Message};

/// Receives each streamed fragment of a reply, in arrival order.
pub type ChunkSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IntentCategory {
    Exploring,
    SeekingAdvice,
    Urgent,
    Other(String),
}

impl From<String> for IntentCategory {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "exploring" => Self::Exploring,
            "seeking_advice" => Self::SeekingAdvice,
            "urgent" => Self::Urgent,
            _ => Self::Other(value),
        }
    }
}

impl From<IntentCategory> for String {
    fn from(value: IntentCategory) -> Self {
        match value {
            IntentCategory::Exploring => "exploring".to_string(),
            IntentCategory::SeekingAdvice => "seeking_advice".to_string(),
            IntentCategory::Urgent => "urgent".to_string(),
            IntentCategory::Other(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    #[serde(rename = "intent")]
    pub intent_category: IntentCategory,
    #[serde(rename = "hint", default)]
    pub contextual_hint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    NetworkInterrupted(String),
    Rejected(String),
    Unknown(String),
}

impl DeliveryError {
    /// Only a dropped connection is worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkInterrupted(_))
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NetworkInterrupted(message) => write!(f, "Connection interrupted: {message}"),
            Self::Rejected(message) => write!(f, "Message rejected: {message}"),
            Self::Unknown(message) => write!(f, "Message delivery failed: {message}"),
        }
    }
}

impl std::error::Error for DeliveryError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    Unavailable(String),
    InvalidResponse(String),
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(message) => write!(f, "Intent analysis unavailable: {message}"),
            Self::InvalidResponse(message) => {
                write!(f, "Invalid intent analysis response: {message}")
            }
        }
    }
}

impl std::error::Error for AnalysisError {}

#[async_trait]
pub trait MessageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Streams the reply to `text`, calling `on_chunk` for every fragment.
    /// Resolves once the backend signals the reply is complete.
    async fn send_message_stream(
        &self,
        text: &str,
        target: &ConversationRef,
        on_chunk: ChunkSink<'_>,
    ) -> Result<(), DeliveryError>;

    async fn analyze_message(&self, text: &str) -> Result<AnalysisResult, AnalysisError>;

    async fn fetch_messages(&self, target: &ConversationRef) -> Result<Vec<Message>, DeliveryError>;
}
