//! Stage 2: scaffold a patient/counselor conversation from the round plan.

use serde_json::{Map, Value};

use crate::error::{GatewayResult, StageError, StageResult};
use crate::llm::ChatMessage;
use crate::record::{Record, Turn};

use super::{Stage, StageContext, StageKind, invalid_reply};

const SYSTEM_PROMPT: &str = "You are an experienced psychological counselor. \
Given the focus of each round, write a realistic conversation between a patient and a counselor. \
Every round has a first-person patient message and a warm, reflective counselor response. \
Reply with JSON only: {\"conversation\": [{\"round\": 1, \"patient\": \"...\", \"counselor\": \"...\"}]}";

/// Adds `conversation` to a record carrying `info_by_round`.
pub struct ConverseStage;

/// Decode and check the model's conversation. Missing round numbers are
/// filled from position.
pub fn conversation_from_reply(obj: Map<String, Value>) -> GatewayResult<Vec<Turn>> {
    let raw = obj.get("conversation").cloned().unwrap_or(Value::Null);
    let mut turns: Vec<Turn> = serde_json::from_value(raw)
        .map_err(|e| invalid_reply(format!("`conversation` is not a list of turns: {e}"), &obj))?;

    if turns.is_empty() {
        return Err(invalid_reply("`conversation` is empty", &obj));
    }
    if turns.iter().any(|t| t.patient_text().is_none()) {
        return Err(invalid_reply("every turn needs patient text", &obj));
    }
    for (i, turn) in turns.iter_mut().enumerate() {
        if turn.round.is_none() {
            turn.round = Some(i as u32 + 1);
        }
    }
    Ok(turns)
}

impl Stage for ConverseStage {
    fn kind(&self) -> StageKind {
        StageKind::Converse
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["info_by_round"]
    }

    fn process(&self, record: &Record, ctx: &StageContext<'_>) -> StageResult<Record> {
        let info = record.get("info_by_round").cloned().unwrap_or(Value::Null);
        let rounds = info.as_array().map(Vec::len).unwrap_or(0);
        let payload = serde_json::json!({
            "rounds": rounds,
            "info_by_round": info,
        });
        let messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(format!("Input JSON:\n{payload}")),
        ];

        let turns = ctx.complete_object(
            record.id(),
            messages,
            &["conversation"],
            conversation_from_reply,
        )?;

        let mut out = record.clone();
        out.set_conversation(&turns).map_err(|e| StageError::Invalid {
            id: record.id().to_string(),
            message: format!("cannot store conversation: {e}"),
        })?;
        Ok(out)
    }
}
