pub mod device;
pub mod host_device;
pub mod handlers;
pub mod delegate;
pub mod metrics;
pub mod error;
pub mod server;

pub use delegate::{OpcodeDelegate, UnhandledOpcodes};
pub use device::{AllocKind, Device, DeviceError, DeviceImage, GlobalHandler, GlobalSymbol, SymbolTable};
pub use error::RpcError;
pub use host_device::HostDevice;
pub use metrics::{BridgeMetrics, MetricsSnapshot};
pub use server::RpcServer;
