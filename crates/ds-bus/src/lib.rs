//! In-process event fan-out and the optional cross-process backplane.
//!
//! Both layers are best-effort: the event store remains the source of truth
//! and subscribers fall back to paging whenever a signal is missed.

pub mod backplane;
pub mod bus;

pub use backplane::{Backplane, LoopbackBackplane};
pub use bus::{BusSignal, EventBus};
