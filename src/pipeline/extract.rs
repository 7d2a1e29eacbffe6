//! Stage 1: plan how many rounds a conversation needs and what each covers.

use serde_json::{Map, Value};

use crate::error::{GatewayResult, StageResult};
use crate::llm::ChatMessage;
use crate::record::Record;

use super::{Stage, StageContext, StageKind, invalid_reply};

const SYSTEM_PROMPT: &str = "You are an experienced psychological counselor. \
Read the user's post and plan a short supportive conversation of one to three rounds. \
Reply with JSON only: {\"rounds\": <1-3>, \"info_by_round\": [<one focus per round>]}";

/// Most rounds a plan may ask for.
pub const MAX_ROUNDS: u64 = 3;

/// Adds `rounds` and `info_by_round` to a post carrying `content`.
pub struct ExtractStage;

/// A validated round plan.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundPlan {
    pub rounds: u64,
    pub info_by_round: Vec<String>,
}

impl RoundPlan {
    pub fn from_reply(obj: Map<String, Value>) -> GatewayResult<Self> {
        let rounds = match obj.get("rounds") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .filter(|r| (1..=MAX_ROUNDS).contains(r))
        .ok_or_else(|| invalid_reply("`rounds` must be an integer from 1 to 3", &obj))?;

        let info_by_round: Vec<String> = obj
            .get("info_by_round")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::trim).filter(|s| !s.is_empty()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if info_by_round.is_empty() {
            return Err(invalid_reply("`info_by_round` must be a non-empty list of strings", &obj));
        }

        Ok(Self {
            rounds,
            info_by_round,
        })
    }
}

impl Stage for ExtractStage {
    fn kind(&self) -> StageKind {
        StageKind::Extract
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["content"]
    }

    fn process(&self, record: &Record, ctx: &StageContext<'_>) -> StageResult<Record> {
        let content = record
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(format!("Post content:\n\"{content}\"")),
        ];

        let plan = ctx.complete_object(
            record.id(),
            messages,
            &["rounds", "info_by_round"],
            RoundPlan::from_reply,
        )?;

        let mut out = record.clone();
        out.set("rounds", Value::from(plan.rounds));
        out.set("info_by_round", Value::from(plan.info_by_round));
        Ok(out)
    }
}
