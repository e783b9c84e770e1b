//! Core types and traits for the pkgmatrix build matrix runner.
//!
//! This crate contains:
//! - Build entries, option values and the build matrix itself
//! - Compiler profiles used to populate the matrix
//! - Predicates for filtering and updating entries
//! - Package references and `conan create` rendering
//! - Executor trait and job types

pub mod compiler;
pub mod conan;
pub mod entry;
pub mod error;
pub mod executor;
pub mod id;
pub mod matrix;
pub mod predicate;
pub mod reference;

pub use compiler::{CompilerFamily, CompilerProfile};
pub use conan::ConanInvocation;
pub use entry::{BuildEntry, OptionValue};
pub use error::{Error, Result};
pub use id::JobId;
pub use matrix::{BuildMatrix, BuildUpdate};
pub use predicate::{BuildPredicate, Constant, OptionEquals, SettingEquals};
pub use reference::PackageReference;
