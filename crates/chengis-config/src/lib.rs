//! Configuration for the Chengis CI engine.
//!
//! This crate handles:
//! - System configuration (TOML file + `CHENGIS_`-prefixed env overrides)
//! - Pipeline-as-code discovery and parsing (`chengis.json` > `chengis.yaml`)

pub mod error;
pub mod pipeline;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::SystemConfig;
