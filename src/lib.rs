//! Parley: conversation quality evaluation for multi-party support chats.
//!
//! Raw chat transcripts are encoded into judge-ready documents, sent to an LLM
//! judge, and rolled up into per-department metrics and flags.
//!
//! # Dataflow
//!
//! ```text
//! source table -> Message -> classify + dedup -> ConversationEncoder -> Document
//!     -> Dispatcher (Judge) -> evaluator output rows
//!     -> MetricEngine / FlagAggregator -> UpsertStore
//! ```
//!
//! # Storage
//!
//! All state lives in one SQLite file (`warehouse.db`) under a root directory.
//! Every operation routes through `DbBroker`, which serializes access and appends
//! an audit line to `broker.events.jsonl`. Writes are keyed by (date, department)
//! or (date, department, conversation) so re-running a date is idempotent.
//!
//! # Example
//!
//! ```no_run
//! use parley::core::{config::Registry, store::UpsertStore};
//! use parley::plugins::dispatch::{Judge, JudgeRequest};
//! use parley::{ParleyError, Pipeline};
//! use std::path::Path;
//!
//! struct Echo;
//! impl Judge for Echo {
//!     fn invoke(&self, request: &JudgeRequest) -> Result<String, ParleyError> {
//!         Ok(format!("{{\"score\": {}}}", request.document_text.len() % 5))
//!     }
//! }
//!
//! # fn main() -> Result<(), ParleyError> {
//! let registry = Registry::load(Path::new("parley.toml"))?;
//! let store = UpsertStore::open(Path::new("data"))?;
//! let date = chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
//!     .ok_or_else(|| ParleyError::ValidationError("bad date".into()))?;
//! let summary = Pipeline::new(&registry, &store, &Echo).run_date(date);
//! println!("{}", summary.to_envelope());
//! # Ok(())
//! # }
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: configuration, storage broker, upsert store, messages, logging
//! - [`plugins`]: classifier, deduplicator, tool-call resolver, encoders, dispatcher, metrics, flags
//! - [`pipeline`]: department and date runs

pub mod core;
pub mod pipeline;
pub mod plugins;

pub use crate::core::error::ParleyError;
pub use crate::pipeline::Pipeline;
