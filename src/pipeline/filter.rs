//! Stage 4: quality review.
//!
//! Every reviewed dialogue gets a separate decision record
//! `{id, keep, issues, reason}`. A reply that cannot be parsed becomes a
//! rejection instead of an error, so the stage yields a decision for every
//! record the service answered. Only transport failures leave a record pending.

use serde_json::{Map, Value, json};

use crate::error::{GatewayError, StageError, StageResult};
use crate::llm::{ChatMessage, parse_object};
use crate::record::{Record, Turn};

use super::{Stage, StageContext, StageKind};

const SYSTEM_PROMPT: &str = "You review synthetic counseling dialogues for quality. \
Each turn has `patient`, `counselor_think` and `counselor_content`. Flag a sample when: \
1. counselor_think is incomplete or unclear; \
2. the dialogue is incoherent or inconsistent; \
3. counselor_think and counselor_content do not match; \
4. counselor_think is not grounded in a recognized therapeutic approach. \
Reply with JSON only: {\"keep\": true|false, \"issues\": [issue numbers], \"reason\": \"short explanation\"}";

const REQUIRED: &[&str] = &["keep", "issues", "reason"];

/// Emits a keep/drop decision for each finished dialogue.
pub struct FilterStage;

/// A keep/drop verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub keep: bool,
    pub issues: Vec<u64>,
    pub reason: String,
}

impl Decision {
    /// Turn the raw reply into a decision. Never fails: anything unusable is
    /// a rejection that says why.
    pub fn from_reply(raw: &str) -> Self {
        match parse_object(raw, REQUIRED).and_then(|obj| Self::from_object(&obj)) {
            Ok(decision) => decision,
            Err(e) => Self::reject(&e, raw),
        }
    }

    fn from_object(obj: &Map<String, Value>) -> Result<Self, GatewayError> {
        let keep = obj
            .get("keep")
            .and_then(Value::as_bool)
            .ok_or_else(|| GatewayError::Parse {
                reason: "`keep` is not a boolean".into(),
                raw: Value::Object(obj.clone()).to_string(),
            })?;
        let issues = obj
            .get("issues")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default();
        let reason = match obj.get("reason") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        Ok(Self {
            keep,
            issues,
            reason,
        })
    }

    fn reject(error: &GatewayError, raw: &str) -> Self {
        let why = match error {
            GatewayError::Parse { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        Self {
            keep: false,
            issues: Vec::new(),
            reason: format!("Invalid model response: {why} | Raw output: {}", raw.trim()),
        }
    }

    /// Decision record for `source`, carrying the same identifier value.
    pub fn into_record(self, source: &Record) -> StageResult<Record> {
        let id_field = source.id_field();
        let id_value = source.get(id_field).cloned().unwrap_or(Value::Null);
        let mut obj = Map::new();
        obj.insert(id_field.to_string(), id_value);
        obj.insert("keep".into(), json!(self.keep));
        obj.insert("issues".into(), json!(self.issues));
        obj.insert("reason".into(), json!(self.reason));
        Record::from_value(Value::Object(obj), id_field, "filter decision").map_err(|e| {
            StageError::Invalid {
                id: source.id().to_string(),
                message: e.to_string(),
            }
        })
    }
}

impl Stage for FilterStage {
    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["conversation"]
    }

    /// A dialogue with open turns is not ready for review yet.
    fn missing_inputs(&self, record: &Record) -> Vec<String> {
        match record.conversation() {
            None => vec!["conversation".into()],
            Some(Ok(turns)) if turns.iter().any(Turn::needs_reply) => vec!["counselor_content".into()],
            Some(_) => Vec::new(),
        }
    }

    fn process(&self, record: &Record, ctx: &StageContext<'_>) -> StageResult<Record> {
        let sample = serde_json::to_string(record).map_err(|e| StageError::Invalid {
            id: record.id().to_string(),
            message: format!("cannot encode sample: {e}"),
        })?;
        let messages = vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(sample)];

        let decision = ctx.complete_with(record.id(), messages, |c| Ok(Decision::from_reply(&c.content)))?;
        if !decision.keep {
            tracing::debug!(id = %record.id(), reason = %decision.reason, "sample dropped");
        }
        decision.into_record(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Gateway, InferenceBackend};
    use crate::pipeline::testing::Scripted;
    use crate::retry::RetryPolicy;
    use std::sync::Arc;

    #[test]
    fn well_formed_reply_is_kept_as_is() {
        let d = Decision::from_reply("```json\n{\"keep\": true, \"issues\": [], \"reason\": \"coherent\"}\n```");
        assert!(d.keep);
        assert!(d.issues.is_empty());
        assert_eq!(d.reason, "coherent");
    }

    #[test]
    fn issues_are_collected() {
        let d = Decision::from_reply(r#"{"keep": false, "issues": [1, 3], "reason": "mismatch"}"#);
        assert!(!d.keep);
        assert_eq!(d.issues, vec![1, 3]);
    }

    #[test]
    fn unparsable_reply_becomes_rejection() {
        let d = Decision::from_reply("I think this one is fine.");
        assert!(!d.keep);
        assert!(d.reason.starts_with("Invalid model response"));
        assert!(d.reason.contains("I think this one is fine."));

        let missing = Decision::from_reply(r#"{"keep": true}"#);
        assert!(!missing.keep);
        assert!(missing.reason.contains("issues"));

        let wrong_type = Decision::from_reply(r#"{"keep": "yes", "issues": [], "reason": ""}"#);
        assert!(!wrong_type.keep);
    }

    #[test]
    fn dialogues_with_open_turns_wait() {
        let record = |conversation: Value| {
            Record::from_value(json!({"post_id": "p1", "conversation": conversation}), "post_id", "t").unwrap()
        };
        let open = record(json!([{"patient": "a", "counselor_content": "b"}, {"patient": "c"}]));
        assert_eq!(FilterStage.missing_inputs(&open), vec!["counselor_content".to_string()]);

        let closing = record(json!([{"patient": "a", "counselor_content": "b"}, {"counselor": "bye"}]));
        assert!(FilterStage.missing_inputs(&closing).is_empty());

        let bare = Record::with_id("post_id", "p2");
        assert_eq!(FilterStage.missing_inputs(&bare), vec!["conversation".to_string()]);
    }

    #[test]
    fn process_emits_separate_decision_record() {
        let backend = Arc::new(Scripted::text(&["no json here"]));
        let gateway = Gateway::new(vec![backend.clone() as Arc<dyn InferenceBackend>]);
        let retry = RetryPolicy::immediate(3);
        let ctx = StageContext {
            gateway: &gateway,
            retry: &retry,
            model: "deepseek-chat",
            temperature: 0.0,
        };
        let input = Record::from_value(
            json!({"post_id": 42, "conversation": [{"patient": "x", "counselor_content": "y"}]}),
            "post_id",
            "t",
        )
        .unwrap();

        let out = FilterStage.process(&input, &ctx).unwrap();
        assert_eq!(out.get("post_id"), Some(&json!(42)));
        assert_eq!(out.get("keep"), Some(&json!(false)));
        assert!(out.get("conversation").is_none());
        // Parse failures are not retried.
        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].messages[1].content.contains("\"post_id\":42"));
    }
}
