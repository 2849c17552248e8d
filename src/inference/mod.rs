//! Vision-inference collaborators.
//!
//! `InferenceClient` is the seam the supervisor calls once per analysis
//! interval. `ChatCompletionsClient` speaks the OpenAI-style
//! `/v1/chat/completions` protocol used by local VLM servers.

mod chat;

use std::time::Duration;

use serde_json::Value;

use crate::error::InferError;

pub use chat::{ChatCompletionsClient, ChatSettings};

pub const DEFAULT_PROMPT: &str = "Analyze this CCTV camera feed as a security officer. \
Provide a brief 1-2 sentence description of what you see, number of people (if any), \
and any notable activity. Be concise and factual.";

/// Submits an image and a prompt, returns a scene description.
pub trait InferenceClient: Send + Sync {
    fn infer(&self, jpeg: &[u8], prompt: &str, timeout: Duration) -> Result<String, InferError>;
}

/// Pull the description out of a response document.
///
/// Precedence: `choices[0].message.content`, then `response`, then the whole
/// document as text.
pub fn extract_text(document: &Value) -> String {
    if let Some(content) = document
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
    {
        return value_as_text(content);
    }
    if let Some(response) = document.get("response") {
        return value_as_text(response);
    }
    document.to_string()
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
