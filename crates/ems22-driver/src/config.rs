use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::registry::{MAX_DAISY_CHAIN, MAX_INSTANCES};

/// Instances to bring up and how often to poll them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default)]
    pub label: Option<String>,
    pub chain_length: usize,
    #[serde(default)]
    pub disable_parity: bool,
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl DriverConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.instances.len() > MAX_INSTANCES {
            anyhow::bail!(
                "{} instances configured, at most {MAX_INSTANCES} supported",
                self.instances.len()
            );
        }
        for (i, inst) in self.instances.iter().enumerate() {
            if !(1..MAX_DAISY_CHAIN).contains(&inst.chain_length) {
                anyhow::bail!(
                    "instance {i} ({}): chain_length {} outside [1, {MAX_DAISY_CHAIN})",
                    inst.label.as_deref().unwrap_or("unlabelled"),
                    inst.chain_length
                );
            }
        }
        Ok(())
    }
}

pub fn parse_config(raw: &str) -> anyhow::Result<DriverConfig> {
    let cfg: DriverConfig = serde_yaml::from_str(raw).context("parsing yaml")?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn load_config_file(path: impl AsRef<Path>) -> anyhow::Result<DriverConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading config: {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("loading config: {}", path.display()))
}
