//! Agent subprocess client
//!
//! One [`AgentSession`] owns one spawned agent subprocess and speaks the
//! newline-delimited JSON-RPC line protocol with it: a handshake at spawn,
//! one `prompt` request per turn, and the server-initiated notification
//! stream in between.

mod options;
mod reader;
pub mod rpc;
mod session;

pub use options::SessionOptions;
pub use session::{AgentSession, ExitInfo, SessionEvent, SessionEvents};
