//! Scheduler and node configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Scheduler-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Default quiet period in seconds, applied when a task has no
    /// override.
    pub default_quiet_period_secs: u64,
    /// How often the periodic maintenance pass runs, in seconds.
    pub maintenance_interval_secs: u64,
    /// Worker node definitions.
    pub nodes: Vec<NodeConfig>,
}

impl SchedulerConfig {
    pub fn default_quiet_period(&self) -> Duration {
        Duration::from_secs(self.default_quiet_period_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_quiet_period_secs: 5,
            maintenance_interval_secs: 5,
            nodes: vec![NodeConfig::built_in()],
        }
    }
}

/// One worker node: a set of executor slots sharing labels and a
/// workspace root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub executors: usize,
    pub labels: Vec<String>,
    pub workspace_root: Option<PathBuf>,
}

impl NodeConfig {
    /// The implicit node used when the configuration declares none.
    pub fn built_in() -> Self {
        Self {
            name: "built-in".to_string(),
            executors: 2,
            labels: Vec::new(),
            workspace_root: None,
        }
    }
}

/// Parse scheduler configuration from KDL text.
pub fn parse_scheduler_config(kdl: &str) -> ConfigResult<SchedulerConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut config = SchedulerConfig::default();
    config.nodes.clear();
    let mut seen_nodes = HashSet::new();

    for node in doc.nodes() {
        match node.name().value() {
            "scheduler" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "quiet-period" => {
                                config.default_quiet_period_secs =
                                    get_seconds_arg(child, "quiet-period")?;
                            }
                            "maintenance-interval" => {
                                config.maintenance_interval_secs =
                                    get_seconds_arg(child, "maintenance-interval")?;
                            }
                            _ => {}
                        }
                    }
                }
            }
            "node" => {
                let parsed = parse_node(node)?;
                if !seen_nodes.insert(parsed.name.clone()) {
                    return Err(ConfigError::Duplicate(format!("node '{}'", parsed.name)));
                }
                config.nodes.push(parsed);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if config.nodes.is_empty() {
        config.nodes.push(NodeConfig::built_in());
    }

    Ok(config)
}

fn parse_node(node: &KdlNode) -> ConfigResult<NodeConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("node name".to_string()))?;

    let executors = match node.get("executors").and_then(|v| v.as_integer()) {
        Some(n) if n >= 0 => n as usize,
        Some(n) => {
            return Err(ConfigError::InvalidValue {
                field: format!("executors for node '{}'", name),
                message: format!("must be non-negative, got {}", n),
            });
        }
        None => 1,
    };

    let mut labels = Vec::new();
    let mut workspace_root = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "label" => {
                    if let Some(label) = get_first_string_arg(child) {
                        labels.push(label);
                    }
                }
                "workspace-root" => {
                    workspace_root = get_first_string_arg(child).map(PathBuf::from);
                }
                _ => {}
            }
        }
    }

    Ok(NodeConfig {
        name,
        executors,
        labels,
        workspace_root,
    })
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_seconds_arg(node: &KdlNode, field: &str) -> ConfigResult<u64> {
    let value = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .ok_or_else(|| ConfigError::MissingField(format!("{} seconds", field)))?;

    u64::try_from(value).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("must be non-negative, got {}", value),
    })
}
