//! Configuration file support for bridgesyncd.
//!
//! Loads the daemon configuration from a YAML file; every field has a
//! default so a missing or partial file still yields a runnable config.
//! Default location: /etc/swbridge/bridgesyncd.yaml

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgesyncError, Result};

/// Packet pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of buffers allocated at startup.
    #[serde(default = "default_pool_size")]
    pub size: usize,

    /// Capacity of each buffer in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// Event pump tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpConfig {
    /// Full kernel resync interval in seconds.
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,

    /// Upper bound on kernel notifications drained per wakeup.
    #[serde(default = "default_max_events_per_wakeup")]
    pub max_events_per_wakeup: usize,

    /// Attempts before a port admin-state change request is dropped.
    #[serde(default = "default_admin_retry_limit")]
    pub admin_retry_limit: u32,
}

/// Bridge translation behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Install per-VLAN ingress rules; when false, member ports accept
    /// any tagged frame.
    #[serde(default = "default_vlan_filtered")]
    pub ingress_vlan_filtered: bool,

    /// Build per-VLAN egress interface and flood groups; when false,
    /// member ports get an unfiltered output group.
    #[serde(default = "default_vlan_filtered")]
    pub egress_vlan_filtered: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgesyncConfig {
    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub pump: PumpConfig,

    #[serde(default)]
    pub bridge: BridgeConfig,
}

fn default_pool_size() -> usize {
    256
}

fn default_max_frame_size() -> usize {
    2048
}

fn default_resync_interval() -> u64 {
    30
}

fn default_max_events_per_wakeup() -> usize {
    10
}

fn default_admin_retry_limit() -> u32 {
    10
}

fn default_vlan_filtered() -> bool {
    true
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            resync_interval_secs: default_resync_interval(),
            max_events_per_wakeup: default_max_events_per_wakeup(),
            admin_retry_limit: default_admin_retry_limit(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ingress_vlan_filtered: default_vlan_filtered(),
            egress_vlan_filtered: default_vlan_filtered(),
        }
    }
}

impl BridgesyncConfig {
    /// Load configuration from file, falling back to defaults if the
    /// file does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => {
                let config: Self = serde_yaml::from_str(&content).map_err(|e| {
                    BridgesyncError::Config(format!(
                        "failed to parse config file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(BridgesyncError::Io(e)),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_or_default("/etc/swbridge/bridgesyncd.yaml")
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.pump.resync_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.size == 0 {
            return Err(BridgesyncError::Config("pool.size must be > 0".to_string()));
        }
        if self.pool.max_frame_size < 64 {
            return Err(BridgesyncError::Config(
                "pool.max_frame_size must be >= 64".to_string(),
            ));
        }
        if self.pump.max_events_per_wakeup == 0 {
            return Err(BridgesyncError::Config(
                "pump.max_events_per_wakeup must be > 0".to_string(),
            ));
        }
        if self.pump.resync_interval_secs == 0 {
            return Err(BridgesyncError::Config(
                "pump.resync_interval_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
