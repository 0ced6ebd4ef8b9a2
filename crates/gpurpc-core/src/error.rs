use gpurpc_protocol::DeviceId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("channel already registered for device {0}")]
    ChannelExists(DeviceId),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
