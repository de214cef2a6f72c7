//! Core engine: the round lifecycle loop and the batch betting pass that
//! rides on it.

pub mod batch;
pub mod cache;
pub mod orchestrator;
pub mod registry;

pub use batch::{BatchEngine, BatchOutcome, BatchReport, BatchTrigger, SkipReason};
pub use cache::RoundStateCache;
pub use orchestrator::{derive_phase, RetryBudget, RoundOrchestrator, RoundPhase};
pub use registry::{ParticipantRegistry, RegistrySummary};
