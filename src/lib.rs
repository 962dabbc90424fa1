//! s2i-verify library
//!
//! Builds a test application on a source-to-image builder image, starts
//! containers from the results and verifies them.

pub mod builder;
pub mod checks;
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod poll;
pub mod probe;
pub mod process;
pub mod report;
pub mod runtime;
pub mod tracker;
