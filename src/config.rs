//! Gateway configuration
//!
//! Plain options struct populated by the CLI layer. Timer intervals derived
//! from these knobs live next to the components that use them.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the gateway process
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Interface to bind the HTTP listener to
    pub host: String,
    /// Port to bind the HTTP listener to
    pub port: u16,
    /// Path to the kiro agent binary
    pub kiro_bin: PathBuf,
    /// Subcommand that puts the agent into line-protocol mode
    pub kiro_subcommand: String,
    /// Extra arguments appended after the subcommand
    pub kiro_args: Vec<String>,
    /// Default working directory for spawned agents
    pub cwd: PathBuf,
    /// Evict a session after this long without activity
    pub idle_timeout: Duration,
    /// Fail a prompt after this long of total agent silence
    pub prompt_timeout: Duration,
    /// Override for the idle GC sweep interval; `None` derives it from
    /// `idle_timeout`
    pub gc_interval: Option<Duration>,
    /// Context usage percentage that logs a warning and annotates replies
    pub context_warn_pct: f64,
    /// Context usage percentage that logs and annotates at critical level
    pub context_critical_pct: f64,
    /// Context usage percentage that forces a session reset
    pub context_reset_pct: f64,
    /// Consecutive prompt failures before the session is reset
    pub consecutive_error_limit: u32,
    /// Synthetic model id reported on the OpenAI surface
    pub model_id: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            kiro_bin: PathBuf::from("kiro"),
            kiro_subcommand: "acp".to_string(),
            kiro_args: Vec::new(),
            cwd: PathBuf::from("."),
            idle_timeout: Duration::from_secs(30 * 60),
            prompt_timeout: Duration::from_secs(5 * 60),
            gc_interval: None,
            context_warn_pct: 80.0,
            context_critical_pct: 90.0,
            context_reset_pct: 95.0,
            consecutive_error_limit: 3,
            model_id: "kiro-agent".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Sweep interval for the idle GC: a sixth of the idle timeout, but
    /// never more often than once a minute
    #[must_use]
    pub fn effective_gc_interval(&self) -> Duration {
        self.gc_interval
            .unwrap_or_else(|| std::cmp::max(Duration::from_secs(60), self.idle_timeout / 6))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gc_interval_is_floored_at_one_minute() {
        let mut config = GatewayConfig {
            idle_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        assert_eq!(config.effective_gc_interval(), Duration::from_secs(60));

        config.idle_timeout = Duration::from_secs(60 * 60);
        assert_eq!(config.effective_gc_interval(), Duration::from_secs(10 * 60));

        config.gc_interval = Some(Duration::from_millis(200));
        assert_eq!(config.effective_gc_interval(), Duration::from_millis(200));
    }
}
