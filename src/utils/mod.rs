//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `meshsub` broker.
//!
//! It centralizes the error taxonomy shared by every layer and the tracing
//! setup used by the binary and the tests.

pub mod error;
pub mod logging;
