//! Server-sent-event parsing for OpenAI-compatible completion streams.
//!
//! The wire format is a sequence of lines prefixed `data: `, each carrying
//! a JSON object whose `choices[0].delta.content` holds a text delta,
//! terminated by `data: [DONE]`. Lines without the prefix and blank lines
//! are tolerated and skipped.

use serde::Deserialize;

use super::{ChunkEvent, ProviderError, TokenUsage};

/// Outcome of classifying one SSE line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine<'a> {
    /// A JSON payload to decode.
    Payload(&'a str),
    /// The `[DONE]` terminator.
    Done,
    /// Blank line, comment, or other field — skip.
    Skip,
}

/// Classify a single line of the event stream.
pub fn classify_line(line: &str) -> SseLine<'_> {
    let trimmed = line.trim_end_matches('\r');
    match trimmed.strip_prefix("data: ") {
        Some("[DONE]") => SseLine::Done,
        Some(payload) => SseLine::Payload(payload),
        None => SseLine::Skip,
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<UsageFrame>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageFrame {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

/// Decode one `data: ` payload into chunk events. A single frame can carry
/// a delta, a finish reason, and usage at once.
pub fn decode_payload(payload: &str) -> Result<Vec<ChunkEvent>, ProviderError> {
    let chunk: StreamChunk = serde_json::from_str(payload)
        .map_err(|e| ProviderError::Malformed(format!("{}: {}", e, payload)))?;

    let mut events = Vec::new();
    if let Some(choice) = chunk.choices.first() {
        if let Some(content) = &choice.delta.content {
            if !content.is_empty() {
                events.push(ChunkEvent::TokenDelta(content.clone()));
            }
        }
        if let Some(reason) = &choice.finish_reason {
            events.push(ChunkEvent::FinishReason(reason.clone()));
        }
    }
    if let Some(usage) = chunk.usage {
        events.push(ChunkEvent::Usage(TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }));
    }
    Ok(events)
}

/// Reassembles complete lines from a byte stream whose chunk boundaries do
/// not respect line boundaries.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes; returns every newly completed line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(bytes));

        let mut lines = Vec::new();
        while let Some(idx) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=idx).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    /// Any trailing partial line once the stream has ended.
    pub fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending)
        }
    }
}
