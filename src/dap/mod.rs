//! Debug Adapter Protocol (DAP) plumbing
//!
//! The bridge speaks DAP on three links: as an adapter towards the client,
//! and as a client towards each backend. All three share this codec and
//! these message types.

pub mod codec;
pub mod command;
pub mod types;

pub use command::Command;
pub use types::*;
