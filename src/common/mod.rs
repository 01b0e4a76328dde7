//! Common utilities shared by the bridge and its binaries

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;

pub use error::{Error, Result};
