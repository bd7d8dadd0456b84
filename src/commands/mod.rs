//! CLI command implementations.
//!
//! Each submodule keeps its output formatting pure so it can be tested
//! without a container runtime.

pub mod check;
pub mod cleanup;
pub mod run;
pub mod status;
