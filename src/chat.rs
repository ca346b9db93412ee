//! Blocking client for an OpenAI-compatible `/chat/completions` endpoint.

use crate::extract::{ExtractionError, ExtractionRequest, ExtractionService};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: &str) -> Self {
        Self { role: role.to_string(), content: content.to_string() }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    user: &'a str,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReplyMessage,
}

#[derive(Deserialize)]
struct ChatReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct ChatCompletionsService {
    client: reqwest::blocking::Client,
    settings: ChatSettings,
    // Conversation memory per session id.
    history: AHashMap<String, Vec<ChatMessage>>,
}

impl ChatCompletionsService {
    pub fn new(settings: ChatSettings) -> Result<Self, ExtractionError> {
        if settings.endpoint.trim().is_empty() {
            return Err(ExtractionError::NotConfigured("chat endpoint is empty".into()));
        }
        let client = reqwest::blocking::Client::builder().timeout(settings.timeout).build()?;
        Ok(Self { client, settings, history: AHashMap::new() })
    }

    pub fn history(&self, session_id: &str) -> &[ChatMessage] {
        self.history.get(session_id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn url(&self) -> String {
        let base = self.settings.endpoint.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{base}/chat/completions")
        }
    }
}

impl ExtractionService for ChatCompletionsService {
    fn name(&self) -> &str {
        "chat"
    }

    fn complete(&mut self, request: &ExtractionRequest<'_>) -> Result<String, ExtractionError> {
        let prior = self.history.get(request.session_id).cloned().unwrap_or_default();
        let mut messages = Vec::with_capacity(prior.len() + 2);
        messages.push(ChatMessage::new("system", request.instructions));
        messages.extend(prior);
        messages.push(ChatMessage::new("user", request.input));

        let body = ChatRequest {
            model: &self.settings.model,
            messages,
            temperature: self.settings.temperature,
            top_p: 1.0,
            max_tokens: self.settings.max_tokens,
            user: request.session_id,
        };
        let mut req = self.client.post(self.url()).json(&body);
        if let Some(key) = self.settings.api_key.as_deref() {
            req = req.bearer_auth(key);
        }
        let resp = req.send()?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().unwrap_or_default();
            return Err(ExtractionError::Status { status: status.as_u16(), body: truncate(&text, 512) });
        }
        let reply: ChatReply = resp.json().map_err(|e| ExtractionError::MalformedReply(e.to_string()))?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ExtractionError::MalformedReply("no choices[0].message.content".into()))?;
        debug!(session = request.session_id, bytes = content.len(), "chat reply");

        let turns = self.history.entry(request.session_id.to_string()).or_default();
        turns.push(ChatMessage::new("user", request.input));
        turns.push(ChatMessage::new("assistant", &content));
        Ok(content)
    }

    fn end_session(&mut self, session_id: &str) {
        if self.history.remove(session_id).is_some() {
            debug!(session = session_id, "dropped session history");
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
