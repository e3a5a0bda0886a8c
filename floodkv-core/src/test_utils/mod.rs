//! Test utilities and fixtures
//!
//! Shared helpers for unit, scenario, and integration tests: an
//! in-process node harness wired over the memory transport, value
//! builders, and async assertion helpers.

pub mod async_helpers;
pub mod fixtures;

pub use async_helpers::*;
pub use fixtures::*;
