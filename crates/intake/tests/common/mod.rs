//! Shared test utilities for intake integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated jobs with temp directories and a real database
//! - In-memory zip archive builders
//! - Builder patterns for creating test configurations programmatically

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::*;
