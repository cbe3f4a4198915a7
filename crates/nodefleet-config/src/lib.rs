//! # Nodefleet Config
//!
//! Configuration for the nodefleet server processes: the main TOML file
//! read once at startup and the small feature-spec file re-read on SIGHUP.

mod error;
mod features;
mod loader;
mod schema;
mod validator;

pub use error::ConfigError;
pub use features::FeatureSpec;
pub use loader::ConfigLoader;
pub use schema::*;
pub use validator::{ConfigValidator, ValidationError, ValidationResult, ValidationWarning};
