//! Runs a finalized build matrix through an executor.
//!
//! Entries are built one after another in matrix order. Progress is reported
//! as a stream of [`RunEvent`]s and the outcome as a [`RunReport`].

pub mod runner;

pub use runner::{BuildState, MatrixRunner, RunEvent, RunReport};
