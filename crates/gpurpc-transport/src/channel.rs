use gpurpc_protocol::wire::BUFFER_ALIGN;
use gpurpc_protocol::{DevicePtr, Packet};

use crate::error::TransportError;

/// A channel transport: sizes shared buffers and opens pending ports on them.
///
/// Implementations must guarantee that a port returned by [`Transport::try_open`]
/// is invisible to every other caller until it is closed, so concurrent
/// dispatchers on the same channel never service the same request.
pub trait Transport: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Device global the client descriptor is installed through.
    /// `None` means this transport never talks to device programs.
    fn client_symbol(&self) -> Option<&'static str>;

    /// Bytes of shared memory a channel needs. Pure function of its inputs.
    fn allocation_size(&self, lane_size: u32, port_count: u32) -> usize;

    /// Put a freshly allocated buffer into the idle state.
    fn reset(&self, view: &ServerView);

    /// Open one pending port without blocking. `None` when nothing is pending.
    fn try_open<'a>(&'a self, view: &'a ServerView, lane_size: u32) -> Option<Box<dyn Port + 'a>>;
}

/// An opened request/response exchange.
///
/// Dropping the port closes it. The device sees the response only after close.
pub trait Port {
    /// Index of this port within the channel.
    fn index(&self) -> u32;

    fn opcode(&self) -> u32;

    /// Lanes of the execution group that took part in this request.
    fn lane_mask(&self) -> u64;

    fn lane_size(&self) -> u32;

    /// Read the request payload of every active lane.
    fn recv(&mut self, f: &mut dyn FnMut(&Packet, u32));

    /// Write a response payload for every active lane.
    fn send(&mut self, f: &mut dyn FnMut(&mut Packet, u32));

    /// Read the request and overwrite it with the response in one pass.
    fn recv_and_send(&mut self, f: &mut dyn FnMut(&mut Packet, u32));

    /// Close the port, publishing whatever was sent.
    fn close(self: Box<Self>) {}
}

/// Host-side view of a channel buffer. Rebuilt on every dispatch attempt;
/// it does not own the buffer.
#[derive(Debug, Clone, Copy)]
pub struct ServerView {
    port_count: u32,
    buffer: DevicePtr,
    size: usize,
}

impl ServerView {
    /// Build a view over `size` bytes at `buffer`.
    ///
    /// # Safety
    ///
    /// When `size` is non-zero, `buffer` must be a host-accessible address of a
    /// live allocation of at least `size` bytes that stays valid for as long as
    /// the view or any port opened through it is in use.
    pub unsafe fn new(port_count: u32, buffer: DevicePtr, size: usize) -> Result<Self, TransportError> {
        if size > 0 {
            if buffer.is_null() {
                return Err(TransportError::NullBuffer { size });
            }
            if buffer.addr() % BUFFER_ALIGN as u64 != 0 {
                return Err(TransportError::Misaligned {
                    addr: buffer.addr(),
                    align: BUFFER_ALIGN,
                });
            }
        }
        Ok(Self {
            port_count,
            buffer,
            size,
        })
    }

    pub fn port_count(&self) -> u32 {
        self.port_count
    }

    pub fn buffer(&self) -> DevicePtr {
        self.buffer
    }

    pub fn size(&self) -> usize {
        self.size
    }
}
