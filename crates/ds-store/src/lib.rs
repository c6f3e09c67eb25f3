//! SQLite-backed persistence for the pipeline engine.
//!
//! Three stores share one serialized connection:
//! - [`JobStore`] owns job and card rows (claiming, status transitions,
//!   prefill merging, deferred card creation)
//! - [`ArtifactStore`] owns per-job artifacts and the cross-job resource
//!   cache keyed by subject key
//! - [`EventStore`] owns the append-only per-job event log and notifies the
//!   in-process bus (and the backplane, when configured) after each append
//!
//! Because every operation routes through a single serialized connection,
//! a card-status update followed by an event append cannot interleave with
//! another writer's pair, the job-row-lock requirement of the design.

pub mod artifact_store;
pub mod db;
pub mod error;
pub mod event_store;
pub mod job_store;

pub use artifact_store::{Artifact, ArtifactStore};
pub use db::Db;
pub use error::{Result, StoreError};
pub use event_store::{CardTransitionEvent, EventStore};
pub use job_store::{ClaimOutcome, JobStore};
