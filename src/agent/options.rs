//! Per-session spawn options

use std::path::PathBuf;
use std::time::Duration;

/// Options for spawning one agent subprocess
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Path to the agent binary
    pub kiro_bin: PathBuf,
    /// Subcommand that enters line-protocol mode
    pub subcommand: String,
    /// Extra arguments appended after the subcommand
    pub extra_args: Vec<String>,
    /// Working directory the agent runs in
    pub cwd: PathBuf,
    /// Fail an in-flight prompt after this long of total silence
    pub prompt_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            kiro_bin: PathBuf::from("kiro"),
            subcommand: "acp".to_string(),
            extra_args: Vec::new(),
            cwd: PathBuf::from("."),
            prompt_timeout: Duration::from_secs(5 * 60),
        }
    }
}
