use gpurpc_core::CoreError;
use gpurpc_protocol::{DeviceId, Status};
use gpurpc_transport::TransportError;

use crate::device::DeviceError;

/// Errors returned by the bridge's lifecycle and dispatch operations.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("failed to initialize RPC server for device {0}")]
    Allocation(DeviceId),

    #[error("failed to read metadata for `{symbol}` on device {device}: {source}")]
    SymbolMetadata {
        device: DeviceId,
        symbol: &'static str,
        #[source]
        source: DeviceError,
    },

    #[error("failed to inspect image on device {device}: {source}")]
    ImageLookup {
        device: DeviceId,
        #[source]
        source: DeviceError,
    },

    #[error("data transfer for device {device} failed: {source}")]
    Transfer {
        device: DeviceId,
        #[source]
        source: DeviceError,
    },

    #[error("RPC server given invalid opcode {opcode:#x} ({status:?})")]
    InvalidOpcode { opcode: u32, status: Status },

    #[error("RPC channel for device {0} is not initialized")]
    NotInitialized(DeviceId),

    #[error("RPC channel for device {0} is already initialized")]
    AlreadyInitialized(DeviceId),

    #[error("device {device} reports unsupported lane size {lane_size}")]
    UnsupportedLaneSize { device: DeviceId, lane_size: u32 },

    #[error(
        "channel layout for device {device} changed since initialization: \
         {port_count} ports x {lane_size} lanes, buffer holds {expected_ports} x {expected_lanes}"
    )]
    LayoutMismatch {
        device: DeviceId,
        port_count: u32,
        lane_size: u32,
        expected_ports: u32,
        expected_lanes: u32,
    },

    #[error("channel buffer for device {device} is unusable: {source}")]
    Buffer {
        device: DeviceId,
        #[source]
        source: TransportError,
    },

    #[error("failed to release RPC buffer for device {device}: {source}")]
    Release {
        device: DeviceId,
        #[source]
        source: DeviceError,
    },

    #[error(transparent)]
    Registry(#[from] CoreError),
}
