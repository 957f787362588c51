//! Node configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{NodeError, Result};
use weft_types::NodeId;

/// Complete configuration for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable routing identifier. Must be non-zero (zero is broadcast).
    pub node_id: NodeId,
    /// Human-readable name.
    #[serde(default)]
    pub node_name: String,
    /// Data directory; empty means an in-memory database.
    #[serde(default)]
    pub data_dir: String,
    /// Advertised address.
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub port: u32,
    /// Whether this node serves as the mesh's bootstrap seed.
    #[serde(default)]
    pub seed_node: bool,
    /// Overrides the mesh row's split strategy when set.
    #[serde(default)]
    pub split_strategy: Option<String>,
    /// Per-step bootstrap wait in seconds.
    #[serde(default = "default_bootstrap_timeout")]
    pub bootstrap_timeout_secs: u64,
}

fn default_bootstrap_timeout() -> u64 {
    10
}

impl NodeConfig {
    /// A minimal configuration with an in-memory database.
    pub fn in_memory(node_id: NodeId) -> Self {
        Self {
            node_id,
            node_name: format!("node-{node_id}"),
            data_dir: String::new(),
            ip_address: String::new(),
            port: 0,
            seed_node: false,
            split_strategy: None,
            bootstrap_timeout_secs: default_bootstrap_timeout(),
        }
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self =
            toml::from_str(&raw).map_err(|e| NodeError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = toml::to_string_pretty(self)
            .map_err(|e| NodeError::Config(format!("cannot serialize config: {e}")))?;
        std::fs::write(path, raw)
            .map_err(|e| NodeError::Config(format!("cannot write {}: {e}", path.display())))
    }

    /// Validate field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(NodeError::Config(
                "node_id 0 is reserved for broadcast".to_string(),
            ));
        }
        Ok(())
    }

    /// Database path, when a data directory is configured.
    pub fn db_path(&self) -> Option<PathBuf> {
        if self.data_dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.data_dir).join("weft.db"))
        }
    }

    /// Effective node name, defaulting from the ID.
    pub fn effective_name(&self) -> String {
        if self.node_name.is_empty() {
            format!("node-{}", self.node_id)
        } else {
            self.node_name.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_defaults() {
        let config = NodeConfig::in_memory(7);
        assert_eq!(config.node_id, 7);
        assert_eq!(config.effective_name(), "node-7");
        assert!(config.db_path().is_none());
        assert_eq!(config.bootstrap_timeout_secs, 10);
        config.validate().expect("valid");
    }

    #[test]
    fn test_zero_node_id_rejected() {
        let config = NodeConfig::in_memory(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("weft-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join("node.toml");

        let mut config = NodeConfig::in_memory(9);
        config.seed_node = true;
        config.ip_address = "10.1.1.9".to_string();
        config.save(&path).expect("save");

        let loaded = NodeConfig::load(&path).expect("load");
        assert_eq!(loaded.node_id, 9);
        assert!(loaded.seed_node);
        assert_eq!(loaded.ip_address, "10.1.1.9");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_parse_toml() {
        let raw = r#"
            node_id = 42
            node_name = "edge-42"
            seed_node = true
            split_strategy = "SEED_NODE_PREVAILS_IN_EVEN_SPLIT"
        "#;
        let config: NodeConfig = toml::from_str(raw).expect("parse");
        assert_eq!(config.node_id, 42);
        assert!(config.seed_node);
        assert_eq!(
            config.split_strategy.as_deref(),
            Some("SEED_NODE_PREVAILS_IN_EVEN_SPLIT")
        );
        // Unset fields default.
        assert_eq!(config.port, 0);
        assert_eq!(config.bootstrap_timeout_secs, 10);
    }
}
