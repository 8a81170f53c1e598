//! formation.toml settings and ambient option lookup.
//!
//! Options are resolved in a fixed fallback order: node-local override,
//! else owning-system override, else process-wide settings default.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::node::Node;
use crate::system::System;

/// Process-wide settings, parsed from `formation.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Name of the provider plugin to use.
    pub provider: String,

    /// Name of the load-balancer plugin, when balancers are declared.
    pub load_balancer_provider: Option<String>,

    /// Name of the DNS plugin, when DNS registration is wanted.
    pub dns_provider: Option<String>,

    pub domain: Option<String>,
    pub tag: Option<String>,

    /// Number of recoverable system-level failures tolerated before a
    /// provisioning run halts in the terminal failed state.
    pub max_failures: u32,

    /// Overall deadline for each provisioning wait, in seconds.
    pub deadline_secs: u64,

    /// Sampling interval for provisioning waits, in seconds.
    pub poll_interval_secs: u64,

    /// Remote command to run on each node after the system completes,
    /// when the node opts in via `post_provision`.
    pub post_provision_command: Option<String>,

    /// Free-form defaults available through the ambient option lookup.
    pub defaults: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: "stub".to_string(),
            load_balancer_provider: None,
            dns_provider: None,
            domain: None,
            tag: None,
            max_failures: 0,
            deadline_secs: 5400,
            poll_interval_secs: 2,
            post_provision_command: None,
            defaults: Map::new(),
        }
    }
}

impl Settings {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Option lookup against the settings: known keys first, then the
    /// `[defaults]` table.
    pub fn opt(&self, key: &str) -> Option<Value> {
        let known = match key {
            "provider" => Some(json!(self.provider)),
            "load_balancer_provider" => self.load_balancer_provider.as_deref().map(|v| json!(v)),
            "dns_provider" => self.dns_provider.as_deref().map(|v| json!(v)),
            "domain" => self.domain.as_deref().map(|v| json!(v)),
            "tag" => self.tag.as_deref().map(|v| json!(v)),
            "post_provision_command" => {
                self.post_provision_command.as_deref().map(|v| json!(v))
            }
            _ => None,
        };
        known.or_else(|| self.defaults.get(key).cloned())
    }
}

/// Ambient option lookup: node-local override, else owning-system
/// override, else settings default.
pub fn ambient_opt(
    key: &str,
    node: Option<&Node>,
    system: &System,
    settings: &Settings,
) -> Option<Value> {
    if let Some(node) = node
        && let Some(value) = node.opt(key)
    {
        return Some(value.clone());
    }
    if let Some(value) = system.opt(key) {
        return Some(value.clone());
    }
    settings.opt(key)
}

/// Ambient lookup coerced to a string, for the common string-valued
/// options (tag, domain, plugin names).
pub fn ambient_str(
    key: &str,
    node: Option<&Node>,
    system: &System,
    settings: &Settings,
) -> Option<String> {
    ambient_opt(key, node, system, settings)
        .and_then(|v| v.as_str().map(str::to_string))
}
