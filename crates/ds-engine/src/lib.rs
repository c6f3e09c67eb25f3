//! The analysis pipeline engine: scheduler, per-card executor, card
//! handlers, and the delta router that turns LLM output into incremental
//! card updates.
//!
//! The engine is wired from an explicit [`EngineContext`] (stores, bus,
//! rules, fetchers, chat provider, configuration) handed to the
//! [`Scheduler`] at startup. There is no global state.

pub mod best_pr;
pub mod context;
pub mod delta;
pub mod executor;
pub mod handlers;
pub mod scheduler;

pub use context::EngineContext;
pub use delta::{DeltaFlush, DeltaRouter};
pub use executor::{CardCtx, ExecOutcome, PipelineExecutor};
pub use scheduler::Scheduler;
