//! Configuration file parsing for devhost
//!
//! Supports:
//! - `devhost.toml` - Log directory, device selection and timing

pub mod settings;
pub mod types;

pub use settings::{load_settings, parse_settings, CONFIG_FILENAME};
pub use types::*;
