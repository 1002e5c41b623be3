pub mod gemini;

use async_trait::async_trait;
use serde::{ Serialize, Deserialize };
use std::sync::Arc;
use thiserror::Error;

use self::gemini::GeminiClient;
use crate::models::chat::{ ChatReply, Role };

pub const DEFAULT_THINKING_BUDGET: i32 = 32768;

/// One prior turn of a conversation, in the order it happened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
}

/// Raw image bytes plus the MIME type they should be declared as.
#[derive(Clone, Debug)]
pub struct InlineImage {
    pub data: Vec<u8>,
    pub mime_type: String,
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("request to {model} failed: {source}")]
    Request {
        model: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{model} returned status {status}: {message}")]
    Status {
        model: String,
        status: u16,
        message: String,
    },
    #[error("failed to decode {model} response: {detail}")]
    Decode {
        model: String,
        detail: String,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_key: String,
    pub chat_model: Option<String>,
    pub vision_model: Option<String>,
    pub base_url: Option<String>,
    pub thinking_budget: i32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            chat_model: None,
            vision_model: None,
            base_url: None,
            thinking_budget: DEFAULT_THINKING_BUDGET,
        }
    }
}

/// The three completion shapes the assistant needs from a hosted model.
/// Every call is stateless: history travels with the request, and the
/// result is already normalized to text plus citations.
#[async_trait]
pub trait GenerativeClient: Send + Sync {
    /// Multi-turn completion with web-search grounding and a reasoning
    /// budget. `history` is replayed verbatim ahead of `prompt`.
    async fn generate_chat(
        &self,
        prompt: &str,
        history: &[HistoryEntry],
        system_instruction: &str
    ) -> Result<ChatReply, ClientError>;

    /// Single-image analysis. No grounding, so no sources come back.
    async fn generate_vision(
        &self,
        image: &InlineImage,
        prompt: &str
    ) -> Result<String, ClientError>;

    /// One-shot grounded completion with no history, for lookups like the
    /// news feed.
    async fn generate_grounded(
        &self,
        prompt: &str,
        system_instruction: &str
    ) -> Result<ChatReply, ClientError>;
}

pub fn new_client(config: &ClientConfig) -> Result<Arc<dyn GenerativeClient>, ClientError> {
    if config.api_key.is_empty() {
        return Err(ClientError::Configuration("Gemini API key is required".to_string()));
    }
    let client = GeminiClient::new(config.clone());
    Ok(Arc::new(client))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_rejects_a_missing_api_key() {
        let config = ClientConfig::default();
        match new_client(&config) {
            Err(ClientError::Configuration(message)) => {
                assert!(message.contains("API key"));
            }
            _ => panic!("expected a configuration error"),
        }
    }

    #[test]
    fn factory_builds_a_client_from_a_key() {
        let config = ClientConfig {
            api_key: "test-key".to_string(),
            ..ClientConfig::default()
        };
        assert!(new_client(&config).is_ok());
    }
}
