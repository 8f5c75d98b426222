#![forbid(unsafe_code)]
#![doc = "Common error types for platls."]

pub mod error;

pub use error::*;
