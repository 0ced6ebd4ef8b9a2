pub mod handle;
pub mod opcode;
pub mod wire;
pub mod error;

pub use handle::{DeviceId, DevicePtr};
pub use opcode::{Opcode, Status};
pub use wire::{ClientDescriptor, Packet, MAX_LANE_SIZE, MAX_PORT_COUNT};
pub use error::ProtocolError;
