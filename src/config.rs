//! Engine configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PercolatorError, Result};

/// Configuration for the percolation engine
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Priority given to operations whose type does not set one
    pub default_priority: i64,

    /// Most operations a single `percolate` call performs, `None` for no cap
    pub percolation_limit: Option<usize>,

    /// Collection holding node documents
    pub nodes_collection: String,

    /// Collection holding operation records
    pub operations_collection: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_priority: 0,
            percolation_limit: Some(100),
            nodes_collection: "nodes".to_string(),
            operations_collection: "operations".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            PercolatorError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&data)
    }

    fn validate(&self) -> Result<()> {
        if self.nodes_collection.is_empty() || self.operations_collection.is_empty() {
            return Err(PercolatorError::Config(
                "collection names must not be empty".to_string(),
            ));
        }
        if self.nodes_collection == self.operations_collection {
            return Err(PercolatorError::Config(
                "nodes and operations need separate collections".to_string(),
            ));
        }
        Ok(())
    }
}
