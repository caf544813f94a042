//! Shared test utilities for the xgrpc crates.
//!
//! - [`assert_eventually`] - Poll a condition until it's true or timeout
//! - [`strategies`] - Proptest generators for hosts, ports and labels

#![deny(unsafe_code)]

mod assertions;
pub use assertions::assert_eventually;

pub mod strategies;
