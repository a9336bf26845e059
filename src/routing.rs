//! Channel routing
//!
//! Maps a Discord channel id embedded in the opaque platform session key to
//! a working-directory (and optional extra-args) override for the agent it
//! spawns. Routes are data, not code: a flat JSON map read once at startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::error::{GatewayError, Result};

static CHANNEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"discord:channel:(\d+)").expect("channel regex"));

/// Extract a Discord channel id from an opaque platform session key
#[must_use]
pub fn detect_channel_id(session_key: &str) -> Option<&str> {
    CHANNEL_RE
        .captures(session_key)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Per-channel agent overrides
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelRoute {
    /// Working directory the agent for this channel runs in
    pub cwd: PathBuf,
    /// Replacement extra arguments, when present
    #[serde(rename = "kiroArgs", default)]
    pub kiro_args: Option<Vec<String>>,
}

/// Channel id to route mapping, loaded once at startup
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, ChannelRoute>,
}

impl RouteTable {
    /// An empty table: every session gets the default cwd and args
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load routes from a JSON file of shape
    /// `{"<channelId>": {"cwd": "...", "kiroArgs"?: [...]}}`
    ///
    /// # Errors
    /// Returns `InvalidRoutes` if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::InvalidRoutes(format!("cannot read {}: {e}", path.display()))
        })?;
        let routes: HashMap<String, ChannelRoute> = serde_json::from_str(&raw).map_err(|e| {
            GatewayError::InvalidRoutes(format!("cannot parse {}: {e}", path.display()))
        })?;
        log::info!("loaded {} channel route(s) from {}", routes.len(), path.display());
        Ok(Self { routes })
    }

    /// Route for a channel id, if one is configured
    #[must_use]
    pub fn lookup(&self, channel_id: &str) -> Option<&ChannelRoute> {
        self.routes.get(channel_id)
    }

    /// Number of configured routes
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table has no routes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
