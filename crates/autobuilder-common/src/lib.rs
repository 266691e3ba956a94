//! autobuilder-common - Shared types and defaults
//!
//! This crate holds the pieces of the EC2 worker engine that carry no AWS SDK
//! dependency, so the dispatcher side of the build farm can depend on them
//! without pulling in the SDK.
//!
//! ## Modules
//!
//! - [`defaults`]: Default timeouts, polling intervals and pricing values
//! - [`instance_state`]: Canonical EC2 instance lifecycle states
//! - [`tags`]: Tag keys applied to every instance the engine launches

pub mod defaults;
pub mod instance_state;
pub mod tags;

pub use instance_state::InstanceState;
