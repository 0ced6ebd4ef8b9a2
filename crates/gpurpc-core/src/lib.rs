pub mod config;
pub mod error;
pub mod registry;

pub use config::RpcConfig;
pub use error::CoreError;
pub use registry::{ChannelBuffer, ChannelLease, ChannelRegistry, PinnedChannel};
