//! OpenAI-compatible chat-completion backend over blocking HTTP.

use std::time::Duration;

use crate::error::{GatewayError, GatewayResult};

use super::{Completion, InferenceBackend, InferenceRequest};

/// Longest slice of an error body kept in diagnostics.
const MAX_ERROR_BODY: usize = 512;

/// One credentialed endpoint speaking `POST /chat/completions`.
pub struct OpenAiBackend {
    base_url: String,
    api_key: String,
    agent: ureq::Agent,
}

impl OpenAiBackend {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            agent,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

impl InferenceBackend for OpenAiBackend {
    fn complete(&self, request: &InferenceRequest) -> GatewayResult<Completion> {
        let url = self.endpoint();

        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": m.role.as_str(),
                    "content": m.content,
                })
            })
            .collect();

        let body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
            "stream": false,
        });

        let resp = self
            .agent
            .post(&url)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .set("Content-Type", "application/json")
            .send_json(body)
            .map_err(|e| match e {
                ureq::Error::Status(status, resp) => {
                    let mut body = resp.into_string().unwrap_or_default();
                    body.truncate(floor_char_boundary(&body, MAX_ERROR_BODY));
                    GatewayError::Status {
                        endpoint: url.clone(),
                        status,
                        body,
                    }
                }
                ureq::Error::Transport(t) => GatewayError::Transport {
                    endpoint: url.clone(),
                    message: t.to_string(),
                },
            })?;

        let resp_str = resp.into_string().map_err(|e| GatewayError::Transport {
            endpoint: url.clone(),
            message: e.to_string(),
        })?;

        parse_envelope(&resp_str)
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}

/// Pull the first choice's message out of a chat-completion response body.
pub(crate) fn parse_envelope(body: &str) -> GatewayResult<Completion> {
    let json: serde_json::Value =
        serde_json::from_str(body).map_err(|e| GatewayError::Envelope {
            message: e.to_string(),
        })?;

    let message = json["choices"]
        .get(0)
        .map(|c| &c["message"])
        .ok_or_else(|| GatewayError::Envelope {
            message: "missing 'choices[0].message'".into(),
        })?;

    let content = message["content"].as_str().unwrap_or("").trim().to_string();
    if content.is_empty() {
        return Err(GatewayError::EmptyCompletion);
    }

    let reasoning = message["reasoning_content"]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(Completion { content, reasoning })
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}
