//! Logging setup and timing helpers.

mod logging;
mod spans;

pub use logging::{build_filter, init_logging};
pub use spans::{run_span, stage_span, SpanTimer};
