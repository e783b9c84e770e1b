//! KDL configuration parsing for pkgmatrix.
//!
//! This crate handles:
//! - Matrix definitions (pkgmatrix.kdl)
//! - The process environment snapshot taken at startup
//! - Filter and update rules, evaluated against that snapshot

pub mod definition;
pub mod environment;
pub mod error;
pub mod rules;

pub use definition::{DEFAULT_CONFIG_FILE, MatrixDefinition, parse_definition};
pub use environment::BuildEnvironment;
pub use error::{ConfigError, ConfigResult};
pub use rules::{Condition, RemoveRule, UpdateRule};
