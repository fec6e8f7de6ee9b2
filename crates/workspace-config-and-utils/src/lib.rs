//! Core configuration, paths, and utilities for Keel.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{Config, MirrorConfig, DEFAULT_LOG_LEVEL};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, init_logging_for_service, parse_level};
pub use paths::Paths;
