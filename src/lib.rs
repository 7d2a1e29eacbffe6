// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # synth-dialogue
//!
//! A resumable batch pipeline that turns forum posts into synthetic
//! counseling dialogues by calling a hosted chat-completion service.
//!
//! ## Architecture
//!
//! - **Records** (`record`): identified JSON objects and conversation turns
//! - **Store** (`store`): array / line-delimited collections, pending-work
//!   computation and atomic checkpoints
//! - **Gateway** (`llm`): OpenAI-compatible backends behind round-robin key
//!   rotation, plus a lenient JSON reply parser
//! - **Stages** (`pipeline`): extract → converse → reply → filter
//! - **Engine** (`engine`): worker pool, progress reporting and checkpointing
//!   for one stage run
//!
//! Every stage is idempotent: rerunning it skips records already present in
//! its output, so an interrupted run resumes where it stopped.
//!
//! ## Library usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use synth_dialogue::engine::{Engine, EngineConfig, StageJob};
//! use synth_dialogue::llm::Gateway;
//! use synth_dialogue::pipeline::StageKind;
//!
//! let gateway = Gateway::openai(
//!     "https://api.deepseek.com",
//!     &["sk-...".to_string()],
//!     std::time::Duration::from_secs(120),
//! );
//! let engine = Engine::new(EngineConfig::default(), Arc::new(gateway));
//! let job = StageJob::new(StageKind::Extract, "posts.json", "themes.jsonl");
//! let summary = engine.run(&job).unwrap();
//! println!("{summary}");
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod record;
pub mod retry;
pub mod store;
