use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Top-level configuration, loaded from gpurpc.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Serve device requests at all. When false, every bridge operation is a no-op.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Port count devices ask for; clamped to the system maximum.
    #[serde(default = "default_port_count")]
    pub requested_port_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Number of host-memory devices to attach
    #[serde(default = "default_devices")]
    pub devices: u32,
    /// Lanes per execution group
    #[serde(default = "default_lane_size")]
    pub lane_size: u32,
    /// Device memory available to device-side allocations, in bytes
    #[serde(default = "default_memory_limit")]
    pub memory_limit: u64,
    /// Delay between polling rounds, in microseconds
    #[serde(default = "default_poll_interval_us")]
    pub poll_interval_us: u64,
    /// Malloc/free pairs each simulated device issues
    #[serde(default = "default_requests")]
    pub requests: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requested_port_count: default_port_count(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            devices: default_devices(),
            lane_size: default_lane_size(),
            memory_limit: default_memory_limit(),
            poll_interval_us: default_poll_interval_us(),
            requests: default_requests(),
        }
    }
}

impl RpcConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, CoreError> {
        let config: RpcConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(CoreError::Io(_)) => Self::default(),
            Err(e) => {
                tracing::warn!("ignoring configuration at {}: {}", path, e);
                Self::default()
            }
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        let lanes = self.simulation.lane_size;
        if lanes == 0 || lanes > gpurpc_protocol::MAX_LANE_SIZE {
            return Err(CoreError::ConfigError(format!(
                "simulation.lane_size must be between 1 and {}, got {}",
                gpurpc_protocol::MAX_LANE_SIZE,
                lanes
            )));
        }
        if self.bridge.requested_port_count == 0 {
            return Err(CoreError::ConfigError(
                "bridge.requested_port_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Returns the default config file path based on platform conventions.
/// Search order:
/// 1. System-wide config: `/etc/gpurpc/gpurpc.toml`
/// 2. Local fallback: `./gpurpc.toml`
pub fn default_config_path() -> String {
    let system_path = "/etc/gpurpc/gpurpc.toml";
    if std::path::Path::new(system_path).exists() {
        return system_path.to_string();
    }
    "gpurpc.toml".to_string()
}

fn default_true() -> bool {
    true
}

fn default_port_count() -> u32 {
    64
}

fn default_devices() -> u32 {
    1
}

fn default_lane_size() -> u32 {
    32
}

fn default_memory_limit() -> u64 {
    256 * 1024 * 1024
}

fn default_poll_interval_us() -> u64 {
    50
}

fn default_requests() -> u32 {
    64
}
