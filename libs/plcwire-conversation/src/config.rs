//! Conversation configuration
//!
//! Loaded through `common::config`, so every field can be overridden with a
//! `PLCWIRE_` prefixed environment variable (e.g. `PLCWIRE_REQUEST_TIMEOUT_MS`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConversationError, Result};

/// Environment variable prefix for [`ConversationConfig::load`]
pub const ENV_PREFIX: &str = "PLCWIRE";

/// Per-connection conversation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Default response timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Requests allowed in flight at once (1 = strictly sequential)
    pub max_concurrent_requests: usize,
    /// First correlation key handed out by `next_key`
    pub initial_key: u64,
    /// Server-side context: only answers, never initiates
    pub passive: bool,
    /// Buffered lifecycle events per subscriber
    pub event_capacity: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
            max_concurrent_requests: 1,
            initial_key: 1,
            passive: false,
            event_capacity: 32,
        }
    }
}

impl ConversationConfig {
    /// Load from defaults, an optional file and `PLCWIRE_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = common::config::load_config(ENV_PREFIX, path)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for the answering side of a conversation
    pub fn passive() -> Self {
        Self {
            passive: true,
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(ConversationError::config("request_timeout_ms must be > 0"));
        }
        if self.max_concurrent_requests == 0 {
            return Err(ConversationError::config(
                "max_concurrent_requests must be > 0",
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConversationError::config("event_capacity must be > 0"));
        }
        Ok(())
    }
}
