//! Host-side stand-in for the device end of a shared-memory channel.
//!
//! Real device programs issue requests from accelerator code. Tests and the
//! simulator use [`DeviceClient`] to play that role from host threads against
//! the same buffer layout [`crate::ShmTransport`] serves.

use std::sync::atomic::{AtomicBool, Ordering};

use gpurpc_protocol::wire::{self, BUFFER_ALIGN};
use gpurpc_protocol::{ClientDescriptor, Packet};

use crate::error::TransportError;
use crate::shm::{for_each_lane, RawChannel};

/// An issued request awaiting its response.
#[derive(Debug)]
#[must_use = "a submitted request holds its port until polled to completion"]
pub struct Ticket {
    /// Base address of the channel that issued the ticket.
    channel: usize,
    port: u32,
    seq: u32,
    mask: u64,
}

impl Ticket {
    pub fn port(&self) -> u32 {
        self.port
    }
}

/// Device-side view of a channel, built from the descriptor the host installed.
pub struct DeviceClient {
    channel: RawChannel,
    lane_size: u32,
}

// SAFETY: all shared state is reached through the port headers' atomics, and a
// port's packets are only touched by the side that currently owns the port.
unsafe impl Send for DeviceClient {}
unsafe impl Sync for DeviceClient {}

impl DeviceClient {
    /// # Safety
    ///
    /// `descriptor.buffer` must be the host address of a live channel buffer
    /// sized for `lane_size` and `descriptor.port_count`, and it must outlive
    /// the client.
    pub unsafe fn from_descriptor(
        descriptor: ClientDescriptor,
        lane_size: u32,
    ) -> Result<Self, TransportError> {
        wire::validate_lane_size(lane_size)?;
        let port_count = u32::try_from(descriptor.port_count)
            .map_err(|_| gpurpc_protocol::ProtocolError::TooManyPorts(descriptor.port_count))?;
        let size = wire::allocation_size(lane_size, port_count);
        if size > 0 {
            if descriptor.buffer == 0 {
                return Err(TransportError::NullBuffer { size });
            }
            if descriptor.buffer % BUFFER_ALIGN as u64 != 0 {
                return Err(TransportError::Misaligned {
                    addr: descriptor.buffer,
                    align: BUFFER_ALIGN,
                });
            }
        }
        Ok(Self {
            // SAFETY: forwarded from the caller's contract.
            channel: unsafe { RawChannel::new(descriptor.buffer as *mut u8, port_count) },
            lane_size,
        })
    }

    pub fn lane_size(&self) -> u32 {
        self.lane_size
    }

    pub fn port_count(&self) -> u32 {
        self.channel.port_count()
    }

    /// Claim a free port, write the request for every lane in `lane_mask` and
    /// publish it. `None` when every port is busy.
    pub fn submit(
        &self,
        opcode: u32,
        lane_mask: u64,
        mut fill: impl FnMut(&mut Packet, u32),
    ) -> Option<Ticket> {
        let mask = lane_mask & wire::full_lane_mask(self.lane_size);
        for port in 0..self.channel.port_count() {
            // SAFETY: port < port_count.
            let header = unsafe { self.channel.header(port) };
            if header
                .claim
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            let current = header.request.load(Ordering::Relaxed);
            if current != header.response.load(Ordering::Acquire) {
                // Still owned by the host from an abandoned exchange.
                header.claim.store(0, Ordering::Release);
                continue;
            }

            header.opcode.store(opcode, Ordering::Relaxed);
            header.mask.store(mask, Ordering::Relaxed);
            for_each_lane(self.lane_size, mask, |lane| {
                // SAFETY: the claimed, idle port is owned by this caller.
                let packet = unsafe { &mut *self.channel.packet(self.lane_size, port, lane) };
                *packet = Packet::default();
                fill(packet, lane);
            });

            let seq = current.wrapping_add(1);
            header.request.store(seq, Ordering::Release);
            return Some(Ticket {
                channel: self.channel.base_addr(),
                port,
                seq,
                mask,
            });
        }
        None
    }

    /// Collect the response for `ticket` if the host has closed its port.
    /// Hands the ticket back when the response is not ready yet, or untouched
    /// when it was issued by a different client.
    pub fn poll(&self, ticket: Ticket, mut read: impl FnMut(&Packet, u32)) -> Result<(), Ticket> {
        if ticket.channel != self.channel.base_addr() || ticket.port >= self.channel.port_count() {
            return Err(ticket);
        }
        // SAFETY: the ticket was issued by this channel and its port is in range.
        let header = unsafe { self.channel.header(ticket.port) };
        if header.response.load(Ordering::Acquire) != ticket.seq {
            return Err(ticket);
        }
        for_each_lane(self.lane_size, ticket.mask, |lane| {
            // SAFETY: the host closed the port; it is ours until we release the claim.
            let packet = unsafe { &*self.channel.packet(self.lane_size, ticket.port, lane) };
            read(packet, lane);
        });
        header.claim.store(0, Ordering::Release);
        Ok(())
    }

    /// Issue a request and spin until the host answers it.
    /// Hangs forever if nobody dispatches this channel.
    pub fn call(
        &self,
        opcode: u32,
        lane_mask: u64,
        mut fill: impl FnMut(&mut Packet, u32),
        mut read: impl FnMut(&Packet, u32),
    ) {
        let mut ticket = loop {
            match self.submit(opcode, lane_mask, &mut fill) {
                Some(ticket) => break ticket,
                None => std::thread::yield_now(),
            }
        };
        loop {
            match self.poll(ticket, &mut read) {
                Ok(()) => return,
                Err(pending) => {
                    ticket = pending;
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Like [`DeviceClient::call`], but gives up once `cancel` is set.
    /// Returns whether the request was answered. An abandoned request keeps
    /// its port claimed, so the channel must be torn down afterwards.
    pub fn call_cancellable(
        &self,
        opcode: u32,
        lane_mask: u64,
        mut fill: impl FnMut(&mut Packet, u32),
        mut read: impl FnMut(&Packet, u32),
        cancel: &AtomicBool,
    ) -> bool {
        let mut ticket = loop {
            if cancel.load(Ordering::Relaxed) {
                return false;
            }
            match self.submit(opcode, lane_mask, &mut fill) {
                Some(ticket) => break ticket,
                None => std::thread::yield_now(),
            }
        };
        loop {
            match self.poll(ticket, &mut read) {
                Ok(()) => return true,
                Err(_) if cancel.load(Ordering::Relaxed) => return false,
                Err(pending) => {
                    ticket = pending;
                    std::thread::yield_now();
                }
            }
        }
    }
}
