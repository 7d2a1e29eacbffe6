//! Shared harness for the integration tests: a closure-driven backend and
//! small file helpers. No network is touched.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use synth_dialogue::engine::{Engine, EngineConfig};
use synth_dialogue::error::{GatewayError, GatewayResult};
use synth_dialogue::llm::{Completion, Gateway, InferenceBackend, InferenceRequest};
use synth_dialogue::retry::RetryPolicy;
use synth_dialogue::store;

/// Backend whose replies come from a closure. Every request is recorded.
pub struct FnBackend<F> {
    respond: F,
    pub requests: Mutex<Vec<InferenceRequest>>,
}

impl<F> FnBackend<F>
where
    F: Fn(&InferenceRequest) -> GatewayResult<Completion> + Send + Sync,
{
    pub fn new(respond: F) -> Arc<Self> {
        Arc::new(Self {
            respond,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// The last user message of every request seen so far.
    pub fn prompts(&self) -> Vec<String> {
        self.requests.lock().unwrap().iter().map(last_user).collect()
    }
}

impl<F> InferenceBackend for FnBackend<F>
where
    F: Fn(&InferenceRequest) -> GatewayResult<Completion> + Send + Sync,
{
    fn complete(&self, request: &InferenceRequest) -> GatewayResult<Completion> {
        self.requests.lock().unwrap().push(request.clone());
        (self.respond)(request)
    }
}

pub fn last_user(request: &InferenceRequest) -> String {
    request
        .messages
        .last()
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

pub fn text(content: impl Into<String>) -> GatewayResult<Completion> {
    Ok(Completion {
        content: content.into(),
        reasoning: None,
    })
}

pub fn reasoned(content: impl Into<String>, think: impl Into<String>) -> GatewayResult<Completion> {
    Ok(Completion {
        content: content.into(),
        reasoning: Some(think.into()),
    })
}

pub fn transport_error() -> GatewayResult<Completion> {
    Err(GatewayError::Transport {
        endpoint: "http://test".into(),
        message: "connection reset".into(),
    })
}

/// Engine with immediate retries and no progress bar.
pub fn engine<B>(backend: Arc<B>, workers: usize, batch_size: usize, attempts: u32) -> Engine
where
    B: InferenceBackend + 'static,
{
    let gateway = Gateway::new(vec![backend as Arc<dyn InferenceBackend>]);
    Engine::new(
        EngineConfig {
            workers,
            batch_size,
            retry: RetryPolicy::immediate(attempts),
            show_progress: false,
        },
        Arc::new(gateway),
    )
}

pub fn write_json(path: &Path, value: &Value) {
    std::fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
}

/// Every record in a collection file, in file order.
pub fn read_output(path: &Path) -> Vec<Value> {
    let text = std::fs::read_to_string(path).unwrap();
    let decoded = store::decode(&text, "post_id", "test");
    assert!(decoded.is_clean(), "{} is not a complete collection", path.display());
    decoded.records.iter().map(|r| r.to_value()).collect()
}

pub fn ids(values: &[Value]) -> Vec<String> {
    values
        .iter()
        .map(|v| match &v["post_id"] {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect()
}
