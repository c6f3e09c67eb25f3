//! Resumable event streaming: replay from the event log, then follow live
//! bus signals with gap backfill, heartbeats, and bounded lifetime.

pub mod subscriber;

pub use subscriber::{EventSubscriber, StreamItem};
