//! End-to-end tests for the resilience engine
//!
//! These drive [`crate::ResilientClient`] against scripted transports and
//! check the combined behavior of the gate, the retry loop, the fallback
//! path and the service level.

mod support;

pub mod concurrency_tests;
