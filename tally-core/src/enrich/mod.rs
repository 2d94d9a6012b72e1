//! Two-tier classification of change records.
//!
//! Tier 1 ([`PatternDetector`]) runs inline during sync upserts and is a
//! fallback. Tier 2 ([`EnrichmentQueue`]) sweeps records not yet classified
//! by inference and submits them in batches to an [`InferenceProvider`];
//! its output always wins over pattern data.

pub mod inference;
pub mod pattern;
pub mod queue;

pub use inference::{InferenceOutput, InferenceProvider, InferenceRequest, LlmInferenceProvider};
pub use pattern::PatternDetector;
pub use queue::{EnrichmentQueue, SweepHalt, SweepStats};
