//! Session configuration, read from an optional TOML file.
//!
//! ```toml
//! page_origin = "https://page.example"
//! frame_origin = "https://frame.example"
//!
//! [parent]
//! origin = "https://frame.example"
//! default_timeout_ms = 500
//!
//! [child]
//! origin = "https://page.example"
//! debug_output = true
//! ```

use anyhow::{Context, Result};
use chanrpc_core::{ChannelOptions, Role};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Origin the simulated page lives at.
    #[serde(default = "default_page_origin")]
    pub page_origin: String,

    /// Origin the simulated frame lives at.
    #[serde(default = "default_frame_origin")]
    pub frame_origin: String,

    /// Options of the page's channel towards the frame.
    #[serde(default = "default_parent")]
    pub parent: ChannelOptions,

    /// Options of the frame's channel towards the page. Always a child.
    #[serde(default = "default_child")]
    pub child: ChannelOptions,
}

fn default_page_origin() -> String {
    "https://page.example".to_string()
}

fn default_frame_origin() -> String {
    "https://frame.example".to_string()
}

fn default_parent() -> ChannelOptions {
    ChannelOptions::new(default_frame_origin())
}

fn default_child() -> ChannelOptions {
    let mut options = ChannelOptions::new(default_page_origin());
    options.role = Role::Child;
    options
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            page_origin: default_page_origin(),
            frame_origin: default_frame_origin(),
            parent: default_parent(),
            child: default_child(),
        }
    }
}

impl CliConfig {
    /// Load from `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let mut config: CliConfig = toml::from_str(text)?;
        config.child.role = Role::Child;
        Ok(config)
    }

    /// Put both channels in `scope`.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        let scope = scope.into();
        self.parent.scope = Some(scope.clone());
        self.child.scope = Some(scope);
        self
    }

    pub fn with_debug_output(mut self, enabled: bool) -> Self {
        self.parent.debug_output = enabled;
        self.child.debug_output = enabled;
        self
    }
}
