//! DAP bridge for mixed-mode debugging
//!
//! Exposes a single Debug Adapter Protocol endpoint backed by two debug
//! adapters: one for the managed language (e.g. debugpy) and one for native
//! code (e.g. lldb-dap), attached to the same process.

pub mod bridge;
pub mod common;
pub mod dap;

pub use common::{Error, Result};
