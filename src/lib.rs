//! # kiro-gateway
//!
//! A long-lived subprocess-pool gateway that fronts stateful, locally
//! spawned kiro agent processes behind a stateless, OpenAI-compatible
//! HTTP/streaming surface.
//!
//! Callers send the entire running conversation with every request. The
//! gateway fingerprints the conversation to route it to one persistent
//! agent subprocess, forwards only the delta of new user turns, and
//! translates the agent's line-oriented JSON-RPC stream back into
//! server-sent events. The pool stays healthy under idle eviction, crash
//! recovery, history corruption, context exhaustion, and concurrent
//! requests against the same conversation.
//!
//! ## Architecture
//!
//! - [`agent`]: one subprocess per session, line protocol, handshake,
//!   `prompt()` with streaming chunks and the activity-idle watchdog
//! - [`pool`]: fingerprint-keyed session map, delta computation, per-key
//!   prompt serialization, idle GC, heartbeat
//! - [`http`]: OpenAI-compatible routes, SSE emission, the completions
//!   bridge and its recovery state machine
//! - [`fingerprint`]: conversation-anchor hashing with noise stripping
//! - [`routing`]: channel-id to working-directory overrides
//! - [`server`]: listener lifecycle and signal handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agent;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod http;
pub mod openai;
pub mod pool;
pub mod routing;
pub mod server;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use fingerprint::resolve_key;
pub use http::{build_router, AppState};
pub use pool::SessionPool;
pub use routing::RouteTable;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
