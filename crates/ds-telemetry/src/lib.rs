//! Tracing subscriber setup shared by embedders and tests. The format is
//! selected through `LOG_FORMAT`, the filter through `RUST_LOG`.

pub mod logging;

pub use logging::{init, init_with_format, LogFormat};
