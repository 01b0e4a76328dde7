//! Mixed-mode debug bridge
//!
//! Presents one DAP endpoint to the client while driving a managed-language
//! backend and a native-code backend behind it.

mod attach;
pub mod backend;
mod breakpoints;
mod handler;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod source;
pub mod timers;

pub use backend::BackendKind;
pub use server::{run_session, serve_stdio, serve_tcp};
pub use session::{Session, SessionInput};
