//! Core engine — the per-ticker analyse loop and the run around it.

pub mod orchestrator;
pub mod report;
pub mod synthesis;

pub use orchestrator::{PipelineOrchestrator, RunSettings};
pub use report::{RunOutcome, RunReport};
pub use synthesis::SynthesisEngine;
