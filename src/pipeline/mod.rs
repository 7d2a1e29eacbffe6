//! Processing pipeline: four stages sharing one batch engine.
//!
//! Each stage turns a record into a request, sends it through the gateway
//! (with retries), validates the reply, and returns the enriched record.
//! Stages chain through files: the output of one is the input of the next.

pub mod converse;
pub mod extract;
pub mod filter;
pub mod reply;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{GatewayError, GatewayResult, StageError, StageResult};
use crate::llm::{ChatMessage, Completion, Gateway, InferenceRequest};
use crate::record::{Record, RecordId};
use crate::retry::RetryPolicy;
use crate::store::CollectionFormat;

/// Built-in pipeline stages, in run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    /// Plan conversation rounds from a post.
    Extract,
    /// Scaffold a conversation from the planned rounds.
    Converse,
    /// Write the counselor reply for every unanswered turn.
    Reply,
    /// Decide whether each finished dialogue is kept.
    Filter,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Extract,
        StageKind::Converse,
        StageKind::Reply,
        StageKind::Filter,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageKind::Extract => "extract",
            StageKind::Converse => "converse",
            StageKind::Reply => "reply",
            StageKind::Filter => "filter",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            StageKind::Reply => "deepseek-reasoner",
            _ => "deepseek-chat",
        }
    }

    pub fn default_temperature(self) -> f32 {
        match self {
            StageKind::Filter => 0.0,
            _ => 1.0,
        }
    }

    pub fn default_format(self) -> CollectionFormat {
        match self {
            StageKind::Extract => CollectionFormat::Lines,
            _ => CollectionFormat::Array,
        }
    }

    /// The stage implementation for this kind.
    pub fn build(self) -> Box<dyn Stage> {
        match self {
            StageKind::Extract => Box::new(extract::ExtractStage),
            StageKind::Converse => Box::new(converse::ConverseStage),
            StageKind::Reply => Box::new(reply::ReplyStage),
            StageKind::Filter => Box::new(filter::FilterStage),
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What to do with a record lacking a stage's input fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingFieldPolicy {
    /// Leave it out of this run without counting a failure.
    #[default]
    Skip,
    /// Count it as failed.
    Fail,
}

/// Everything a stage needs to talk to the service.
pub struct StageContext<'a> {
    pub gateway: &'a Gateway,
    pub retry: &'a RetryPolicy,
    pub model: &'a str,
    pub temperature: f32,
}

impl StageContext<'_> {
    pub fn request(&self, messages: Vec<ChatMessage>) -> InferenceRequest {
        InferenceRequest::new(self.model, self.temperature, messages)
    }

    /// Call the service until `accept` takes the reply or retries run out.
    ///
    /// A rejected reply counts as a failed attempt, the same as a transport error.
    pub fn complete_with<T, F>(&self, id: &RecordId, messages: Vec<ChatMessage>, accept: F) -> StageResult<T>
    where
        F: Fn(Completion) -> GatewayResult<T>,
    {
        self.retrying(id, messages, |request| self.gateway.infer(request).and_then(&accept))
    }

    /// Call and parse a JSON object holding `required`, then run `validate` on it.
    pub fn complete_object<T, F>(
        &self,
        id: &RecordId,
        messages: Vec<ChatMessage>,
        required: &[&str],
        validate: F,
    ) -> StageResult<T>
    where
        F: Fn(Map<String, Value>) -> GatewayResult<T>,
    {
        self.retrying(id, messages, |request| {
            self.gateway.infer_object(request, required).and_then(&validate)
        })
    }

    fn retrying<T, F>(&self, id: &RecordId, messages: Vec<ChatMessage>, call: F) -> StageResult<T>
    where
        F: Fn(&InferenceRequest) -> GatewayResult<T>,
    {
        let request = self.request(messages);
        self.retry
            .run(|attempt| {
                call(&request).inspect_err(|e| {
                    tracing::warn!(id = %id, attempt, error = %e, "inference attempt failed");
                })
            })
            .map_err(|ex| StageError::ExhaustedRetries {
                id: id.to_string(),
                attempts: ex.attempts,
                last: ex.last,
            })
    }
}

/// One pass of the pipeline.
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Fields a record must carry before it can be processed.
    fn required_fields(&self) -> &'static [&'static str];

    /// Inputs `record` still lacks. Empty means it can be processed.
    fn missing_inputs(&self, record: &Record) -> Vec<String> {
        self.required_fields()
            .iter()
            .filter(|f| !record.has(**f))
            .map(|f| f.to_string())
            .collect()
    }

    /// Whether an output record is finished. Presence in the output is the
    /// default completion marker.
    fn is_complete(&self, record: &Record) -> bool {
        let _ = record;
        true
    }

    /// Produce the output record for `record`.
    fn process(&self, record: &Record, ctx: &StageContext<'_>) -> StageResult<Record>;
}

/// Shorthand for rejecting a parsed reply.
pub(crate) fn invalid_reply(reason: impl Into<String>, raw: &Map<String, Value>) -> GatewayError {
    GatewayError::Parse {
        reason: reason.into(),
        raw: Value::Object(raw.clone()).to_string(),
    }
}
