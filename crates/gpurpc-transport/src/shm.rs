//! Shared-memory mailbox transport.
//!
//! Each port header carries two sequence numbers. The device bumps `request`
//! after writing its packets; the host copies `request` into `response` when
//! it closes the port. A port is pending while the two differ. `lock` keeps
//! concurrent host dispatchers off the same port and `claim` does the same
//! for device-side callers.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use gpurpc_protocol::wire::{self, CLIENT_SYMBOL, HEADER_SIZE};
use gpurpc_protocol::Packet;
use tracing::trace;

use crate::channel::{Port, ServerView, Transport};

#[repr(C, align(64))]
pub(crate) struct PortHeader {
    pub(crate) request: AtomicU32,
    pub(crate) response: AtomicU32,
    pub(crate) lock: AtomicU32,
    pub(crate) claim: AtomicU32,
    pub(crate) opcode: AtomicU32,
    _reserved: u32,
    pub(crate) mask: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<PortHeader>() == HEADER_SIZE);

/// Raw accessors over a channel buffer, shared by the host and simulated
/// device ends.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawChannel {
    base: *mut u8,
    port_count: u32,
}

impl RawChannel {
    /// # Safety
    ///
    /// `base` must point to a zero-initialized or previously used channel
    /// buffer of at least `allocation_size(lane_size, port_count)` bytes for
    /// every lane size later passed to [`RawChannel::packet`].
    pub(crate) unsafe fn new(base: *mut u8, port_count: u32) -> Self {
        Self { base, port_count }
    }

    pub(crate) fn port_count(&self) -> u32 {
        self.port_count
    }

    pub(crate) fn base_addr(&self) -> usize {
        self.base as usize
    }

    /// # Safety
    ///
    /// `port < port_count` and the buffer must still be live.
    pub(crate) unsafe fn header<'a>(&self, port: u32) -> &'a PortHeader {
        // SAFETY: headers are 64-byte aligned because the base is, and the
        // buffer is large enough per the constructor contract.
        unsafe { &*(self.base.add(wire::header_offset(port)) as *const PortHeader) }
    }

    /// # Safety
    ///
    /// `port < port_count`, `lane < lane_size` and the buffer must still be live.
    pub(crate) unsafe fn packet(&self, lane_size: u32, port: u32, lane: u32) -> *mut Packet {
        let offset = wire::packet_offset(self.port_count, lane_size, port, lane);
        // SAFETY: in bounds per the constructor contract.
        unsafe { self.base.add(offset) as *mut Packet }
    }
}

/// Call `f` for each lane set in `mask`.
pub(crate) fn for_each_lane(lane_size: u32, mask: u64, mut f: impl FnMut(u32)) {
    for lane in 0..lane_size.min(64) {
        if mask & (1u64 << lane) != 0 {
            f(lane);
        }
    }
}

/// The in-tree channel transport over host-visible shared memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShmTransport;

impl ShmTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for ShmTransport {
    fn name(&self) -> &'static str {
        "shm"
    }

    fn client_symbol(&self) -> Option<&'static str> {
        Some(CLIENT_SYMBOL)
    }

    fn allocation_size(&self, lane_size: u32, port_count: u32) -> usize {
        wire::allocation_size(lane_size, port_count)
    }

    fn reset(&self, view: &ServerView) {
        if view.size() == 0 {
            return;
        }
        // SAFETY: the view constructor guarantees `size` live bytes at `buffer`.
        unsafe {
            std::ptr::write_bytes(view.buffer().addr() as *mut u8, 0, view.size());
        }
    }

    fn try_open<'a>(&'a self, view: &'a ServerView, lane_size: u32) -> Option<Box<dyn Port + 'a>> {
        if view.size() < wire::allocation_size(lane_size, view.port_count()) {
            return None;
        }
        // SAFETY: the size check above covers every header and packet.
        let channel = unsafe { RawChannel::new(view.buffer().addr() as *mut u8, view.port_count()) };

        for index in 0..channel.port_count() {
            // SAFETY: index < port_count.
            let header = unsafe { channel.header(index) };
            if header.request.load(Ordering::Acquire) == header.response.load(Ordering::Relaxed) {
                continue;
            }
            if header
                .lock
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            // Another dispatcher may have finished this exchange before we locked.
            let seq = header.request.load(Ordering::Acquire);
            if seq == header.response.load(Ordering::Acquire) {
                header.lock.store(0, Ordering::Release);
                continue;
            }

            let port = ShmPort {
                header,
                // SAFETY: lane 0 of a valid port.
                packets: unsafe { channel.packet(lane_size, index, 0) },
                index,
                lane_size,
                seq,
                opcode: header.opcode.load(Ordering::Relaxed),
                mask: header.mask.load(Ordering::Relaxed),
                _view: PhantomData,
            };
            trace!(port = index, seq, opcode = port.opcode, "opened port");
            return Some(Box::new(port));
        }
        None
    }
}

struct ShmPort<'a> {
    header: &'a PortHeader,
    packets: *mut Packet,
    index: u32,
    lane_size: u32,
    seq: u32,
    opcode: u32,
    mask: u64,
    _view: PhantomData<&'a ServerView>,
}

impl ShmPort<'_> {
    fn lane_packet(&mut self, lane: u32) -> &mut Packet {
        // SAFETY: the port is locked, so the device does not touch its packets
        // until close; lane < lane_size.
        unsafe { &mut *self.packets.add(lane as usize) }
    }
}

impl Port for ShmPort<'_> {
    fn index(&self) -> u32 {
        self.index
    }

    fn opcode(&self) -> u32 {
        self.opcode
    }

    fn lane_mask(&self) -> u64 {
        self.mask
    }

    fn lane_size(&self) -> u32 {
        self.lane_size
    }

    fn recv(&mut self, f: &mut dyn FnMut(&Packet, u32)) {
        let (lane_size, mask) = (self.lane_size, self.mask);
        for_each_lane(lane_size, mask, |lane| f(&*self.lane_packet(lane), lane));
    }

    fn send(&mut self, f: &mut dyn FnMut(&mut Packet, u32)) {
        let (lane_size, mask) = (self.lane_size, self.mask);
        for_each_lane(lane_size, mask, |lane| f(self.lane_packet(lane), lane));
    }

    fn recv_and_send(&mut self, f: &mut dyn FnMut(&mut Packet, u32)) {
        self.send(f);
    }
}

impl Drop for ShmPort<'_> {
    fn drop(&mut self) {
        self.header.response.store(self.seq, Ordering::Release);
        self.header.lock.store(0, Ordering::Release);
        trace!(port = self.index, seq = self.seq, "closed port");
    }
}
