//! Logging facade used across the crate; hosts pick the sink.

pub use log::{debug, error, info, trace, warn};
