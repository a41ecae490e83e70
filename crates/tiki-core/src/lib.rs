//! # tiki-core
//!
//! Foundation shared by the tiki load-test crates: the `tracing` subscriber
//! bootstrap used by the runner binary and an in-memory log capture used by
//! the protocol crates' tests to assert on diagnostics.

#![deny(unsafe_code)]

pub mod logging;
