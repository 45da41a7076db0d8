//! Shared test utilities for proko integration tests.
//!
//! This module provides:
//! - `TestHarness` for orchestrators backed by a temporary database file
//! - Phase executors with controllable behavior

pub mod executors;
pub mod harness;

pub use executors::*;
pub use harness::TestHarness;
