//! Inference gateway: the boundary to the hosted text-generation service.
//!
//! The gateway owns one or more interchangeable [`InferenceBackend`]s and picks
//! one per call through a [`Rotation`]. Everything above this module sees a
//! single operation: request in, [`Completion`] (or a structured object) out.

pub mod lenient;
pub mod openai;
pub mod rotation;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::{GatewayError, GatewayResult};

pub use lenient::parse_object;
pub use openai::OpenAiBackend;
pub use rotation::Rotation;

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A role-tagged chat message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One call to the service: messages plus model selector and temperature.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub model: String,
    pub temperature: f32,
    pub messages: Vec<ChatMessage>,
}

impl InferenceRequest {
    pub fn new(model: impl Into<String>, temperature: f32, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            temperature,
            messages,
        }
    }
}

/// What came back: the visible text and, for reasoning models, the trace.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Completion {
    pub content: String,
    pub reasoning: Option<String>,
}

/// A credentialed endpoint that can answer an [`InferenceRequest`].
pub trait InferenceBackend: Send + Sync {
    fn complete(&self, request: &InferenceRequest) -> GatewayResult<Completion>;

    /// Short label for logs. Must not reveal credentials.
    fn describe(&self) -> String {
        "backend".into()
    }
}

/// Round-robin front over a set of backends.
pub struct Gateway {
    backends: Vec<Arc<dyn InferenceBackend>>,
    rotation: Rotation,
}

impl Gateway {
    pub fn new(backends: Vec<Arc<dyn InferenceBackend>>) -> Self {
        let rotation = Rotation::new(backends.len());
        Self { backends, rotation }
    }

    /// One [`OpenAiBackend`] per API key, all against `base_url`.
    pub fn openai(base_url: &str, api_keys: &[String], timeout: Duration) -> Self {
        let backends = api_keys
            .iter()
            .map(|key| Arc::new(OpenAiBackend::new(base_url, key, timeout)) as Arc<dyn InferenceBackend>)
            .collect();
        Self::new(backends)
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    /// Send `request` to the next backend in rotation.
    pub fn infer(&self, request: &InferenceRequest) -> GatewayResult<Completion> {
        let idx = self.rotation.next().ok_or(GatewayError::NoBackends)?;
        let backend = &self.backends[idx];
        tracing::debug!(backend = %backend.describe(), model = %request.model, "inference call");
        backend.complete(request)
    }

    /// Call and leniently parse the reply into an object holding `required`.
    pub fn infer_object(
        &self,
        request: &InferenceRequest,
        required: &[&str],
    ) -> GatewayResult<Map<String, Value>> {
        let completion = self.infer(request)?;
        parse_object(&completion.content, required)
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("backends", &self.backends.len())
            .finish()
    }
}
