//! Job API facade called by the transport layer: create jobs, read
//! snapshots, cancel, and open resumable event subscriptions.

pub mod api;
pub mod resolver;

pub use api::{CreateJobOutcome, JobApi, JobSnapshot};
pub use resolver::{resolve_input, Resolution};
