//! Core library for dossier: domain types, error taxonomy, and shared
//! primitives for the analysis pipeline engine.
//!
//! This crate provides:
//! - Job / card / artifact / event domain types and status machines
//! - The tagged error-kind taxonomy shared by every component
//! - Cooperative cancellation tokens
//! - Monotonic timing helpers
//! - Subject-key derivation for cache-friendly job identity
//! - Engine configuration loaded from the environment

pub mod cancel;
pub mod config;
pub mod error;
pub mod events;
pub mod json_clean;
pub mod subject;
pub mod timing;
pub mod types;

pub use cancel::CancellationToken;
pub use config::{BackplaneMode, EngineConfig};
pub use error::{EngineError, ErrorKind, Result};
pub use events::{EventType, JobEvent};
pub use types::{
    Card, CardDescriptor, CardOutput, CardStatus, Job, JobOptions, JobStatus, Source,
};
