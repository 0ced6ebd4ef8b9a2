//! A device whose memory is plain host memory.
//!
//! Used by the simulator and the tests in place of a real accelerator. Device
//! addresses are host virtual addresses, so channel buffers it hands out can be
//! served directly by [`gpurpc_transport::ShmTransport`].

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use gpurpc_protocol::wire::{BUFFER_ALIGN, CLIENT_SYMBOL};
use gpurpc_protocol::{ClientDescriptor, DeviceId, DevicePtr};

use crate::device::{AllocKind, Device, DeviceError, DeviceImage};

const POINTER_SIZE: u64 = std::mem::size_of::<u64>() as u64;

struct Block {
    layout: Layout,
    kind: AllocKind,
}

#[derive(Default)]
struct HostMemory {
    /// Base address -> block
    blocks: BTreeMap<u64, Block>,
    in_use: u64,
}

impl HostMemory {
    /// Find the block fully containing `[addr, addr + len)`.
    fn containing(&self, addr: u64, len: usize) -> Option<*mut u8> {
        let (&base, block) = self.blocks.range(..=addr).next_back()?;
        let end = addr.checked_add(len as u64)?;
        if end > base + block.layout.size() as u64 {
            return None;
        }
        Some(addr as *mut u8)
    }
}

/// Counters describing allocator traffic on a [`HostDevice`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HostDeviceStats {
    pub allocations: u64,
    pub failed_allocations: u64,
    pub frees: u64,
    pub live_blocks: u64,
    pub bytes_in_use: u64,
}

/// Host-memory device with a fixed memory budget.
pub struct HostDevice {
    id: DeviceId,
    lane_size: u32,
    requested_port_count: u32,
    memory_limit: u64,
    memory: Mutex<HostMemory>,
    allocations: AtomicU64,
    failed_allocations: AtomicU64,
    frees: AtomicU64,
}

impl HostDevice {
    pub fn new(id: DeviceId, lane_size: u32, requested_port_count: u32, memory_limit: u64) -> Self {
        Self {
            id,
            lane_size,
            requested_port_count,
            memory_limit,
            memory: Mutex::new(HostMemory::default()),
            allocations: AtomicU64::new(0),
            failed_allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> HostDeviceStats {
        let memory = self.memory.lock();
        HostDeviceStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            failed_allocations: self.failed_allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            live_blocks: memory.blocks.len() as u64,
            bytes_in_use: memory.in_use,
        }
    }

    /// Whether `ptr` is the base of a live allocation.
    pub fn is_allocated(&self, ptr: DevicePtr) -> bool {
        self.memory.lock().blocks.contains_key(&ptr.addr())
    }

    /// Lay out an image the way a program linked against the device libc
    /// would: a pointer-sized `__llvm_libc_rpc_client` global that points at
    /// storage for the client descriptor.
    pub fn load_rpc_image(&self, image_id: u32) -> Result<DeviceImage, DeviceError> {
        let storage = self
            .allocate(ClientDescriptor::SIZE as u64, None, AllocKind::Device)
            .ok_or_else(|| DeviceError::Driver("out of memory loading image".to_string()))?;
        let global = self
            .allocate(POINTER_SIZE, None, AllocKind::Device)
            .ok_or_else(|| DeviceError::Driver("out of memory loading image".to_string()))?;
        self.data_submit(global, &storage.addr().to_ne_bytes())?;

        debug!(device = %self.id, image_id, global = %global, "loaded image with RPC client");
        Ok(DeviceImage::new(image_id).with_symbol(CLIENT_SYMBOL, global, POINTER_SIZE))
    }

    /// Read back the client descriptor installed for `image`.
    pub fn read_client_descriptor(&self, image: &DeviceImage) -> Result<ClientDescriptor, DeviceError> {
        let global = image
            .symbol(CLIENT_SYMBOL)
            .ok_or_else(|| DeviceError::SymbolNotFound(CLIENT_SYMBOL.to_string()))?;

        let mut pointer = [0u8; POINTER_SIZE as usize];
        self.data_retrieve(&mut pointer, global.addr)?;
        let storage = DevicePtr(u64::from_ne_bytes(pointer));

        let mut bytes = [0u8; ClientDescriptor::SIZE];
        self.data_retrieve(&mut bytes, storage)?;
        ClientDescriptor::from_bytes(&bytes).map_err(|e| DeviceError::MalformedImage(e.to_string()))
    }
}

impl Device for HostDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn lane_size(&self) -> u32 {
        self.lane_size
    }

    fn requested_port_count(&self) -> u32 {
        self.requested_port_count
    }

    fn allocate(&self, size: u64, _hint: Option<DevicePtr>, kind: AllocKind) -> Option<DevicePtr> {
        let mut memory = self.memory.lock();
        let layout = Layout::from_size_align(usize::try_from(size).ok()?, BUFFER_ALIGN).ok();
        let fits = memory
            .in_use
            .checked_add(size)
            .is_some_and(|total| total <= self.memory_limit);

        let layout = match layout {
            Some(layout) if size > 0 && fits => layout,
            _ => {
                self.failed_allocations.fetch_add(1, Ordering::Relaxed);
                trace!(device = %self.id, size, ?kind, "allocation refused");
                return None;
            }
        };

        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            self.failed_allocations.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        memory.blocks.insert(ptr as u64, Block { layout, kind });
        memory.in_use += size;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        trace!(device = %self.id, size, ?kind, addr = ptr as u64, "allocated");
        Some(DevicePtr(ptr as u64))
    }

    fn free(&self, ptr: DevicePtr, kind: AllocKind) -> Result<(), DeviceError> {
        if ptr.is_null() {
            return Ok(());
        }
        let mut memory = self.memory.lock();
        let block = memory
            .blocks
            .remove(&ptr.addr())
            .ok_or(DeviceError::UnknownAllocation { device: self.id, addr: ptr })?;
        memory.in_use -= block.layout.size() as u64;
        if block.kind != kind {
            trace!(device = %self.id, addr = %ptr, allocated = ?block.kind, freed = ?kind, "free with different kind");
        }

        // SAFETY: the block was produced by alloc_zeroed with this layout and
        // has just been unlinked, so nothing else can reach it.
        unsafe { dealloc(ptr.addr() as *mut u8, block.layout) };
        self.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn data_submit(&self, dst: DevicePtr, src: &[u8]) -> Result<(), DeviceError> {
        let memory = self.memory.lock();
        let target = memory.containing(dst.addr(), src.len()).ok_or(DeviceError::InvalidAddress {
            device: self.id,
            addr: dst,
            len: src.len(),
        })?;
        // SAFETY: the range lies inside a live block, which cannot be freed
        // while the lock is held.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), target, src.len()) };
        Ok(())
    }

    fn data_retrieve(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), DeviceError> {
        let memory = self.memory.lock();
        let source = memory.containing(src.addr(), dst.len()).ok_or(DeviceError::InvalidAddress {
            device: self.id,
            addr: src,
            len: dst.len(),
        })?;
        // SAFETY: as in data_submit.
        unsafe { std::ptr::copy_nonoverlapping(source as *const u8, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        let memory = self.memory.get_mut();
        for (addr, block) in std::mem::take(&mut memory.blocks) {
            // SAFETY: every remaining block is still owned by this device.
            unsafe { dealloc(addr as *mut u8, block.layout) };
        }
        memory.in_use = 0;
    }
}
