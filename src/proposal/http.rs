//! HTTP rewrite collaborators.
//!
//! - [`OpenAiProposer`]: OpenAI-compatible chat completions (also vLLM and
//!   llama.cpp servers, which speak the same protocol)
//! - [`AnthropicProposer`]: Anthropic messages API
//!
//! ## Environment Variables
//!
//! - `OPENAI_API_KEY`: default key variable for [`OpenAiProposer`]
//! - `ANTHROPIC_API_KEY`: default key variable for [`AnthropicProposer`]
//!
//! Both are overridable through `proposer.api_key_env`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ProposalError, RewriteProposer, SYSTEM_PROMPT};
use crate::config::ProposerConfig;

/// Longest error body kept in a [`ProposalError::Api`].
const MAX_ERROR_BODY: usize = 2048;

fn read_key(var: &str) -> Result<String, ProposalError> {
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(ProposalError::NotConfigured(format!("{var} is not set"))),
    }
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> ProposalError {
    if e.is_timeout() {
        ProposalError::Timeout(timeout)
    } else {
        ProposalError::Transport(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProposalError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(ProposalError::Api {
        status: status.as_u16(),
        body,
    })
}

fn user_message(target_description: &str, instruction: &str) -> String {
    format!("{target_description}\n\nInstruction: {instruction}")
}

// ============================================================================
// OpenAI-compatible chat completions
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat completions collaborator.
///
/// ## Example
///
/// ```no_run
/// use self_rewrite_orchestrator::proposal::OpenAiProposer;
///
/// let proposer = OpenAiProposer::new("https://api.openai.com/v1/chat/completions", "sk-...", "gpt-4o")
///     .with_max_tokens(1024)
///     .with_temperature(0.2);
/// ```
pub struct OpenAiProposer {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
}

impl OpenAiProposer {
    /// Create a collaborator for `endpoint` with an explicit key.
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: 2048,
            temperature: 0.2,
            timeout: Duration::from_secs(60),
        }
    }

    /// Build from `[proposer]` settings, reading the key from the environment.
    ///
    /// # Errors
    ///
    /// [`ProposalError::NotConfigured`] when the key variable is unset.
    pub fn from_config(cfg: &ProposerConfig) -> Result<Self, ProposalError> {
        let api_key = read_key(&cfg.resolved_api_key_env())?;
        Ok(Self::new(cfg.resolved_endpoint(), api_key, cfg.model.clone())
            .with_max_tokens(cfg.max_tokens)
            .with_temperature(cfg.temperature)
            .with_timeout(cfg.timeout()))
    }

    /// Set maximum tokens to generate
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set temperature (0.0 - 2.0)
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl RewriteProposer for OpenAiProposer {
    fn name(&self) -> &str {
        "openai"
    }

    async fn propose(&self, target_description: &str, instruction: &str) -> Result<String, ProposalError> {
        let user = user_message(target_description, instruction);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &user,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        tracing::debug!(model = %self.model, endpoint = %self.endpoint, "propose: sending chat request");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        let response = check_status(response).await?;

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProposalError::Malformed(format!("failed to parse response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProposalError::Malformed("no choices in response".to_string()))
    }
}

// ============================================================================
// Anthropic messages
// ============================================================================

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Anthropic messages API collaborator.
pub struct AnthropicProposer {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
}

impl AnthropicProposer {
    /// Create a collaborator for `endpoint` with an explicit key.
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: 2048,
            temperature: 0.2,
            timeout: Duration::from_secs(60),
        }
    }

    /// Build from `[proposer]` settings, reading the key from the environment.
    ///
    /// # Errors
    ///
    /// [`ProposalError::NotConfigured`] when the key variable is unset.
    pub fn from_config(cfg: &ProposerConfig) -> Result<Self, ProposalError> {
        let api_key = read_key(&cfg.resolved_api_key_env())?;
        let mut proposer = Self::new(cfg.resolved_endpoint(), api_key, cfg.model.clone());
        proposer.max_tokens = cfg.max_tokens;
        // The messages API caps temperature at 1.0.
        proposer.temperature = cfg.temperature.min(1.0);
        proposer.timeout = cfg.timeout();
        Ok(proposer)
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl RewriteProposer for AnthropicProposer {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn propose(&self, target_description: &str, instruction: &str) -> Result<String, ProposalError> {
        let user = user_message(target_description, instruction);
        let request = MessagesRequest {
            model: &self.model,
            system: SYSTEM_PROMPT,
            messages: vec![ChatMessage {
                role: "user",
                content: &user,
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        tracing::debug!(model = %self.model, endpoint = %self.endpoint, "propose: sending messages request");

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        let response = check_status(response).await?;

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProposalError::Malformed(format!("failed to parse response: {e}")))?;

        let text: String = parsed
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return Err(ProposalError::Malformed("no text content in response".to_string()));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_contains_both_parts() {
        let msg = user_message("File: a.rs", "add docs");
        assert!(msg.starts_with("File: a.rs"));
        assert!(msg.ends_with("Instruction: add docs"));
    }

    #[test]
    fn test_chat_request_serializes_system_then_user() {
        let req = ChatRequest {
            model: "m",
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: "u",
                },
            ],
            max_tokens: 10,
            temperature: 0.0,
        };
        let value = serde_json::to_value(&req).expect("test: serialize");
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "u");
    }

    #[test]
    fn test_anthropic_from_config_clamps_temperature() {
        std::env::set_var("SELF_REWRITE_TEST_ANTHROPIC_KEY", "k");
        let cfg = ProposerConfig {
            kind: crate::config::ProposerKind::Anthropic,
            api_key_env: Some("SELF_REWRITE_TEST_ANTHROPIC_KEY".into()),
            temperature: 1.8,
            ..ProposerConfig::default()
        };
        let proposer = AnthropicProposer::from_config(&cfg).expect("test: key set");
        assert!((proposer.temperature - 1.0).abs() < f32::EPSILON);
        assert!(proposer.endpoint.contains("anthropic.com"));
    }

    #[test]
    fn test_blank_key_is_not_configured() {
        std::env::set_var("SELF_REWRITE_TEST_BLANK_KEY", "  ");
        assert!(matches!(
            read_key("SELF_REWRITE_TEST_BLANK_KEY"),
            Err(ProposalError::NotConfigured(_))
        ));
    }
}
