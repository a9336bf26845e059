//! Error types for the kiro gateway

use thiserror::Error;

/// Substring the agent embeds in RPC errors when its transcript no longer
/// matches the session state. The bridge matches on it to trigger the
/// one-shot recovery path.
const INVALID_HISTORY_SENTINEL: &str = "invalid conversation history";

/// Main error type for the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Agent subprocess could not be started
    #[error("Failed to spawn agent: {0}")]
    SpawnFailure(String),

    /// The initialize/newSession exchange did not complete
    #[error("Agent handshake failed: {0}")]
    HandshakeFailure(String),

    /// Agent subprocess exited while a request was outstanding
    #[error("Agent process exited (code {code:?}, signal {signal:?})")]
    ProcessExited {
        /// Process exit code, if it exited normally
        code: Option<i32>,
        /// Terminating signal, if it was killed
        signal: Option<i32>,
    },

    /// No server-initiated traffic for the whole activity window
    #[error("Prompt timed out after {0} seconds of silence")]
    PromptTimeout(u64),

    /// Error response from the agent's JSON-RPC endpoint
    #[error("Agent RPC error: {0}")]
    Rpc(String),

    /// Caller request failed validation
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Channel route table could not be loaded
    #[error("Invalid route table: {0}")]
    InvalidRoutes(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON decode error
    #[error("JSON decode error: {0}")]
    JsonDecode(#[from] serde_json::Error),
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Create a spawn failure error
    pub fn spawn_failure(msg: impl Into<String>) -> Self {
        Self::SpawnFailure(msg.into())
    }

    /// Create a handshake failure error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::HandshakeFailure(msg.into())
    }

    /// Create a process exit error
    #[must_use]
    pub fn process_exited(code: Option<i32>, signal: Option<i32>) -> Self {
        Self::ProcessExited { code, signal }
    }

    /// Create an RPC error
    pub fn rpc(msg: impl Into<String>) -> Self {
        Self::Rpc(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Whether this error carries the agent's invalid-history sentinel
    #[must_use]
    pub fn is_invalid_history(&self) -> bool {
        match self {
            Self::Rpc(msg) => msg.contains(INVALID_HISTORY_SENTINEL),
            _ => false,
        }
    }
}
