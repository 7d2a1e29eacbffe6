//! Stage 3: write the counselor's reply for each unanswered turn.
//!
//! Turns are answered in order so every reply sees the replies before it.
//! Turns that already carry `counselor_content` are left untouched, and turns
//! without patient text need no reply. The record only completes once every
//! turn is answered; a failure part way through keeps the turns answered so
//! far and leaves the record pending for the rest.

use crate::error::{GatewayError, StageError, StageResult};
use crate::llm::ChatMessage;
use crate::record::{Record, Turn};

use super::{Stage, StageContext, StageKind};

const SYSTEM_PROMPT: &str = "You are a warm, emotionally attuned psychological counselor. \
Respond to the client's latest message with empathy. You may draw on clinical knowledge silently, \
but never use diagnostic labels. Suggest one helpful therapeutic approach in plain language. \
Keep it conversational: under 50 words for light messages, under 150 for heavy ones.";

/// Fills `counselor_content` and `counselor_think` on every turn.
pub struct ReplyStage;

/// Chat history preceding turn `upto`: each earlier patient message followed
/// by its answer, when there is one.
pub fn history(turns: &[Turn], upto: usize) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    for turn in &turns[..upto] {
        if let Some(patient) = turn.patient_text() {
            messages.push(ChatMessage::user(patient));
        }
        if let Some(answer) = turn.counselor_content.as_deref().filter(|_| turn.is_answered()) {
            messages.push(ChatMessage::assistant(answer));
        }
    }
    messages
}

impl Stage for ReplyStage {
    fn kind(&self) -> StageKind {
        StageKind::Reply
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["conversation"]
    }

    fn is_complete(&self, record: &Record) -> bool {
        match record.conversation() {
            Some(Ok(turns)) => !turns.iter().any(Turn::needs_reply),
            _ => true,
        }
    }

    fn process(&self, record: &Record, ctx: &StageContext<'_>) -> StageResult<Record> {
        let mut turns = match record.conversation() {
            Some(Ok(turns)) => turns,
            Some(Err(e)) => {
                return Err(StageError::Invalid {
                    id: record.id().to_string(),
                    message: format!("conversation is malformed: {e}"),
                });
            }
            None => {
                return Err(StageError::MissingFields {
                    id: record.id().to_string(),
                    fields: "conversation".into(),
                });
            }
        };

        let mut answered = 0;
        for j in 0..turns.len() {
            if !turns[j].needs_reply() {
                continue;
            }
            let patient = turns[j].patient_text().unwrap_or_default().to_string();
            let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
            messages.extend(history(&turns, j));
            messages.push(ChatMessage::user(patient));

            let reply = ctx.complete_with(record.id(), messages, |c| {
                if c.content.trim().is_empty() {
                    Err(GatewayError::EmptyCompletion)
                } else {
                    Ok(c)
                }
            });
            let completion = match reply {
                Ok(completion) => completion,
                Err(e) if answered == 0 => return Err(e),
                Err(e) => return Err(e.with_partial(with_turns(record, &turns)?, answered)),
            };
            tracing::debug!(id = %record.id(), turn = j, "turn answered");
            turns[j].counselor_content = Some(completion.content);
            turns[j].counselor_think = completion.reasoning;
            answered += 1;
        }

        with_turns(record, &turns)
    }
}

fn with_turns(record: &Record, turns: &[Turn]) -> StageResult<Record> {
    let mut out = record.clone();
    out.set_conversation(turns).map_err(|e| StageError::Invalid {
        id: record.id().to_string(),
        message: format!("cannot store conversation: {e}"),
    })?;
    Ok(out)
}
