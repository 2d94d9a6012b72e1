//! Tally core library: progressive PR sync, enrichment, rollups, and insights.
//!
//! The main entry point is [`pipeline::TallyPipeline`], which routes queued
//! Sync → Enrich → Aggregate jobs over a [`store::SyncStore`].

pub mod aggregate;
pub mod config;
pub mod enrich;
pub mod error;
pub mod fetch;
pub mod insight;
pub mod llm;
pub mod pipeline;
pub mod progress;
pub mod store;
pub mod sync;
pub mod types;
