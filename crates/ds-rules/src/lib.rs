//! Card planning rules: the per-source DAG of resource and user-facing
//! cards, plus the streaming specs that drive delta routing.

pub mod plan;
pub mod stream_specs;

pub use plan::{build_plan, RulesEngine};
pub use stream_specs::{stream_spec, StreamRoute, StreamSpec, MARKER_PREFIX, MARKER_SUFFIX};
