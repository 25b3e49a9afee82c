//! Shared utilities for docpipe integration tests.

pub mod harness;

pub use harness::{PipelineHarness, ScriptedProcessor};
