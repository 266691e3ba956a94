//! Shared test utilities for autobuilder
//!
//! This crate provides common test helpers used by the AWS integration
//! tests without pulling them into the library crates.
//!
//! ## Modules
//!
//! - [`aws`]: AWS region detection and unique test identifiers

pub mod aws;

pub use aws::{get_test_region, test_run_id, test_worker_name};
