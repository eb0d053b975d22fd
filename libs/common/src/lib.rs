//! `plcwire` basic library
//!
//! Provides the ambient functions shared by the protocol crates:
//! - logging bootstrap (console formatter, `RUST_LOG` aware filtering)
//! - layered configuration loading (defaults, file, environment)

pub mod config;
pub mod error;
pub mod logging;

pub use error::{Error, Result};

// Re-export common dependencies
pub use serde;
