// Sample configuration
// Loaded from an optional TOML file, then overridden from the command line

use crate::device::DeviceConfig;
use crate::error::{Result, RuntimeError};
use crate::kernels::{FINAL_MAX_GROUP_SIZE, SUB_GROUP_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleConfig {
    #[serde(default = "default_elements")]
    pub elements: usize,
    #[serde(default = "default_max_groups")]
    pub max_groups: usize,
    #[serde(default = "default_group_size")]
    pub group_size: usize,
    #[serde(default = "default_graph_launch_iterations")]
    pub graph_launch_iterations: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub host_callback: bool,
    #[serde(default)]
    pub device: DeviceConfig,
}

// Default functions for serde
fn default_elements() -> usize {
    1 << 24
}

fn default_max_groups() -> usize {
    512
}

fn default_group_size() -> usize {
    256
}

fn default_graph_launch_iterations() -> usize {
    3
}

fn default_seed() -> u64 {
    2022
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            elements: default_elements(),
            max_groups: default_max_groups(),
            group_size: default_group_size(),
            graph_launch_iterations: default_graph_launch_iterations(),
            seed: default_seed(),
            host_callback: false,
            device: DeviceConfig::default(),
        }
    }
}

impl SampleConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SampleConfig = toml::from_str(&content)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.elements == 0 {
            return Err(RuntimeError::Config("elements must be at least 1".to_string()));
        }

        if self.max_groups == 0 {
            return Err(RuntimeError::Config("max_groups must be at least 1".to_string()));
        }

        if !self.group_size.is_power_of_two()
            || self.group_size < SUB_GROUP_SIZE
            || self.group_size > FINAL_MAX_GROUP_SIZE
        {
            return Err(RuntimeError::Config(format!(
                "group_size {} must be a power of two between {} and {}",
                self.group_size, SUB_GROUP_SIZE, FINAL_MAX_GROUP_SIZE
            )));
        }

        if self.graph_launch_iterations == 0 {
            return Err(RuntimeError::Config(
                "graph_launch_iterations must be at least 1".to_string(),
            ));
        }

        if self.device.memory_limit_mb == 0 {
            return Err(RuntimeError::Config("device.memory_limit_mb must be at least 1".to_string()));
        }

        Ok(())
    }

    /// Groups launched by the partial reduction: enough to cover the input
    /// once, capped at `max_groups`
    pub fn num_groups(&self) -> usize {
        self.max_groups
            .min(self.elements.div_ceil(self.group_size))
            .max(1)
    }
}
