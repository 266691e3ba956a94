//! autobuilder-ec2 - latent EC2 workers for the autobuilder build farm
//!
//! This crate starts build workers on EC2 on demand, bids for spot capacity
//! across instance types and zones, quarantines workers whose instances keep
//! failing, and picks which worker a build should go to.

pub mod aws;
pub mod config;
pub mod error;
pub mod selection;
pub mod spot;
pub mod wait;
pub mod worker;

#[cfg(test)]
mod testing;
