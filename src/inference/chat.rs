use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde::Serialize;
use serde_json::Value;

use super::{extract_text, InferenceClient};
use crate::error::InferError;

const COMPLETIONS_PATH: &str = "/v1/chat/completions";

#[derive(Clone, Debug)]
pub struct ChatSettings {
    /// Base URL of the inference server, e.g. `http://127.0.0.1:8080`.
    pub endpoint: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080".to_string(),
            max_tokens: 150,
            temperature: 0.1,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: [ContentPart<'a>; 2],
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    ImageUrl { image_url: ImageUrl },
    Text { text: &'a str },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

/// Blocking client for OpenAI-compatible vision chat endpoints.
pub struct ChatCompletionsClient {
    settings: ChatSettings,
    agent: ureq::Agent,
}

impl ChatCompletionsClient {
    pub fn new(settings: ChatSettings) -> Self {
        Self {
            settings,
            agent: ureq::AgentBuilder::new().build(),
        }
    }

    pub fn completions_url(&self) -> String {
        format!(
            "{}{}",
            self.settings.endpoint.trim_end_matches('/'),
            COMPLETIONS_PATH
        )
    }

    fn request_body(&self, jpeg: &[u8], prompt: &str) -> Result<String, InferError> {
        let request = ChatRequest {
            messages: [ChatMessage {
                role: "user",
                content: [
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: format!("data:image/jpeg;base64,{}", BASE64_STANDARD.encode(jpeg)),
                        },
                    },
                    ContentPart::Text { text: prompt },
                ],
            }],
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        };
        serde_json::to_string(&request).map_err(|e| InferError::Encode(e.to_string()))
    }
}

impl InferenceClient for ChatCompletionsClient {
    fn infer(&self, jpeg: &[u8], prompt: &str, timeout: Duration) -> Result<String, InferError> {
        let body = self.request_body(jpeg, prompt)?;
        let started = Instant::now();
        let response = match self
            .agent
            .post(&self.completions_url())
            .timeout(timeout)
            .set("Content-Type", "application/json")
            .send_string(&body)
        {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => return Err(InferError::Status(code)),
            Err(ureq::Error::Transport(transport)) => {
                if started.elapsed() >= timeout {
                    return Err(InferError::Timeout(timeout));
                }
                return Err(InferError::Transport(transport.to_string()));
            }
        };
        if response.status() != 200 {
            return Err(InferError::Status(response.status()));
        }

        let raw = response.into_string().map_err(|e| {
            if started.elapsed() >= timeout {
                InferError::Timeout(timeout)
            } else {
                InferError::Transport(e.to_string())
            }
        })?;
        let document: Value =
            serde_json::from_str(&raw).map_err(|e| InferError::Malformed(e.to_string()))?;
        Ok(extract_text(&document))
    }
}
