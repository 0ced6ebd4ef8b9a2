//! Collaborator interfaces the bridge needs from the device layer.

use std::collections::HashMap;

use gpurpc_protocol::{DeviceId, DevicePtr};

/// Allocation policy requested from a device allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocKind {
    /// Device-resident memory; the allocator may block.
    Device,
    /// Pinned host memory the device can access.
    Host,
    /// Memory migrated between host and device on demand.
    Shared,
    /// Device-resident memory; the allocator must not block.
    DeviceNonBlocking,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("symbol `{0}` not found in image")]
    SymbolNotFound(String),

    #[error("symbol `{name}` has size {actual}, expected {expected}")]
    SymbolSize { name: String, expected: u64, actual: u64 },

    #[error("malformed device image: {0}")]
    MalformedImage(String),

    #[error("range {addr}+{len} is not mapped on device {device}")]
    InvalidAddress { device: DeviceId, addr: DevicePtr, len: usize },

    #[error("device {device} has no allocation at {addr}")]
    UnknownAllocation { device: DeviceId, addr: DevicePtr },

    #[error("driver error: {0}")]
    Driver(String),
}

/// An attached accelerator, as seen by the bridge.
///
/// `allocate` with [`AllocKind::Host`] must return a host-accessible address
/// aligned to [`gpurpc_protocol::wire::BUFFER_ALIGN`]; the bridge places the
/// shared channel there and the host reads it directly.
pub trait Device: Send + Sync {
    fn id(&self) -> DeviceId;

    /// Lanes the hardware schedules together.
    fn lane_size(&self) -> u32;

    /// Channel depth this device asks for, before clamping.
    fn requested_port_count(&self) -> u32;

    /// Allocate `size` bytes. `None` when the allocator cannot satisfy the request.
    fn allocate(&self, size: u64, hint: Option<DevicePtr>, kind: AllocKind) -> Option<DevicePtr>;

    fn free(&self, ptr: DevicePtr, kind: AllocKind) -> Result<(), DeviceError>;

    /// Copy host bytes into device memory.
    fn data_submit(&self, dst: DevicePtr, src: &[u8]) -> Result<(), DeviceError>;

    /// Copy device memory into a host buffer.
    fn data_retrieve(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), DeviceError>;
}

/// Location and size of a global variable in a loaded device image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalSymbol {
    pub addr: DevicePtr,
    pub size: u64,
}

/// A program image loaded onto a device, with its exported globals.
#[derive(Debug, Clone, Default)]
pub struct DeviceImage {
    image_id: u32,
    symbols: HashMap<String, GlobalSymbol>,
}

impl DeviceImage {
    pub fn new(image_id: u32) -> Self {
        Self {
            image_id,
            symbols: HashMap::new(),
        }
    }

    pub fn with_symbol(mut self, name: &str, addr: DevicePtr, size: u64) -> Self {
        self.symbols.insert(name.to_string(), GlobalSymbol { addr, size });
        self
    }

    pub fn image_id(&self) -> u32 {
        self.image_id
    }

    pub fn symbol(&self, name: &str) -> Option<GlobalSymbol> {
        self.symbols.get(name).copied()
    }
}

/// Resolves globals inside device images.
pub trait GlobalHandler {
    /// Whether `name` is defined by the image. Absence is not an error.
    fn is_symbol_in_image(
        &self,
        device: &dyn Device,
        image: &DeviceImage,
        name: &str,
    ) -> Result<bool, DeviceError>;

    /// Address of the global `name`, which must be `size` bytes.
    fn global_metadata(
        &self,
        device: &dyn Device,
        image: &DeviceImage,
        name: &str,
        size: u64,
    ) -> Result<GlobalSymbol, DeviceError>;
}

/// Looks globals up in the symbol table carried by [`DeviceImage`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SymbolTable;

impl GlobalHandler for SymbolTable {
    fn is_symbol_in_image(
        &self,
        _device: &dyn Device,
        image: &DeviceImage,
        name: &str,
    ) -> Result<bool, DeviceError> {
        Ok(image.symbol(name).is_some())
    }

    fn global_metadata(
        &self,
        _device: &dyn Device,
        image: &DeviceImage,
        name: &str,
        size: u64,
    ) -> Result<GlobalSymbol, DeviceError> {
        let symbol = image
            .symbol(name)
            .ok_or_else(|| DeviceError::SymbolNotFound(name.to_string()))?;
        if symbol.size != size {
            return Err(DeviceError::SymbolSize {
                name: name.to_string(),
                expected: size,
                actual: symbol.size,
            });
        }
        Ok(symbol)
    }
}
