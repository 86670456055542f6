//! Common utilities for the USB session coordinator
//!
//! This crate provides functionality shared by the coordinator library, its
//! binary and the test suites: infrastructure error handling, logging setup,
//! and test helpers for building mock host reports.

pub mod error;
pub mod logging;
pub mod test_utils;

pub use error::{Error, Result};
pub use logging::setup_logging;
