//! Shared-buffer layout of an RPC channel.
//!
//! A channel buffer holds `port_count` mailbox headers followed by
//! `port_count * lane_size` packets:
//!
//! ```text
//! [header 0][header 1]...[header N-1][port 0: lane 0..L][port 1: lane 0..L]...
//! ```
//!
//! Every header and packet occupies [`HEADER_SIZE`] / [`PACKET_SIZE`] bytes so
//! neighbouring ports never share a cache line.

use bytemuck::{Pod, Zeroable};

use crate::error::ProtocolError;
use crate::handle::DevicePtr;

/// Upper bound on ports per channel, regardless of what a device requests.
pub const MAX_PORT_COUNT: u32 = 4096;

/// Widest supported execution group. Lane masks are 64 bits.
pub const MAX_LANE_SIZE: u32 = 64;

/// Words of payload carried per lane.
pub const PACKET_WORDS: usize = 8;

/// Bytes per lane packet.
pub const PACKET_SIZE: usize = PACKET_WORDS * std::mem::size_of::<u64>();

/// Bytes per port mailbox header.
pub const HEADER_SIZE: usize = 64;

/// Required alignment of a channel buffer's base address.
pub const BUFFER_ALIGN: usize = 64;

/// Name of the device global that points at the client descriptor storage.
pub const CLIENT_SYMBOL: &str = "__llvm_libc_rpc_client";

/// One lane's payload within a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct Packet {
    pub data: [u64; PACKET_WORDS],
}

/// Host-constructed value written into device memory at init so the device
/// program can find the channel. Device-read-only afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ClientDescriptor {
    pub port_count: u64,
    pub buffer: u64,
}

impl ClientDescriptor {
    pub const SIZE: usize = std::mem::size_of::<ClientDescriptor>();

    pub fn new(port_count: u32, buffer: DevicePtr) -> Self {
        Self {
            port_count: port_count as u64,
            buffer: buffer.addr(),
        }
    }

    pub fn buffer(&self) -> DevicePtr {
        DevicePtr(self.buffer)
    }

    /// Serialize for transfer into device memory.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(bytemuck::bytes_of(self));
        out
    }

    /// Decode a descriptor read back from device memory.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != Self::SIZE {
            return Err(ProtocolError::DescriptorSize {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        let desc: ClientDescriptor = bytemuck::pod_read_unaligned(bytes);
        if desc.port_count > MAX_PORT_COUNT as u64 {
            return Err(ProtocolError::TooManyPorts(desc.port_count));
        }
        Ok(desc)
    }
}

/// Clamp a device's requested port count to the system maximum.
/// Init and every dispatch must derive the port count through this function.
pub fn clamp_port_count(requested: u32) -> u32 {
    requested.min(MAX_PORT_COUNT)
}

/// Check that a device's lane size fits the lane mask.
pub fn validate_lane_size(lane_size: u32) -> Result<(), ProtocolError> {
    if lane_size == 0 || lane_size > MAX_LANE_SIZE {
        return Err(ProtocolError::UnsupportedLaneSize(lane_size));
    }
    Ok(())
}

/// Bytes needed for a channel with the given lane size and port count.
pub fn allocation_size(lane_size: u32, port_count: u32) -> usize {
    let per_port = (lane_size as usize)
        .saturating_mul(PACKET_SIZE)
        .saturating_add(HEADER_SIZE);
    per_port.saturating_mul(port_count as usize)
}

/// Byte offset of a port's header from the buffer base.
pub fn header_offset(port: u32) -> usize {
    port as usize * HEADER_SIZE
}

/// Byte offset of one lane's packet from the buffer base.
pub fn packet_offset(port_count: u32, lane_size: u32, port: u32, lane: u32) -> usize {
    let headers = port_count as usize * HEADER_SIZE;
    let slot = port as usize * lane_size as usize + lane as usize;
    headers + slot * PACKET_SIZE
}

/// Mask with every lane of a group of `lane_size` set.
pub fn full_lane_mask(lane_size: u32) -> u64 {
    if lane_size >= 64 {
        u64::MAX
    } else {
        (1u64 << lane_size) - 1
    }
}
