//! Shared platform types for the Skiff protocol crates.
//!
//! This crate holds the pieces every protocol implementation needs but none
//! owns: the unified error type and result alias.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod error;

pub use error::{SkiffError, SkiffResult};
