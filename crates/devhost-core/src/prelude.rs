//! Prelude for common imports used throughout all devhost crates

pub use crate::error::{Error, ErrorKind, Result, ResultExt};
pub use tracing::{debug, error, info, instrument, trace, warn};
