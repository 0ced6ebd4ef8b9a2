//! Opcodes the bridge services itself.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use tracing::{trace, warn};

use gpurpc_protocol::{DevicePtr, Opcode, Packet, Status};
use gpurpc_transport::Port;

use crate::device::{AllocKind, Device};
use crate::metrics::BridgeMetrics;

/// What a dispatcher should do with an opened port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Builtin(BuiltinHandler),
    /// Hand the port to the opcode delegate.
    Delegate,
}

/// Host-side implementations of device memory management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinHandler {
    /// Per lane: word 0 holds the requested size on entry and the allocated
    /// address (0 on exhaustion) on return.
    Malloc,
    /// Per lane: word 0 holds the address to release.
    Free,
}

/// State a builtin handler may touch while servicing one port.
pub struct HandlerContext<'a> {
    pub device: &'a dyn Device,
    pub metrics: &'a BridgeMetrics,
}

impl BuiltinHandler {
    pub const ALL: [BuiltinHandler; 2] = [BuiltinHandler::Malloc, BuiltinHandler::Free];

    pub fn opcode(self) -> Opcode {
        match self {
            BuiltinHandler::Malloc => Opcode::Malloc,
            BuiltinHandler::Free => Opcode::Free,
        }
    }

    pub fn run(self, ctx: &HandlerContext<'_>, port: &mut dyn Port) -> Status {
        match self {
            BuiltinHandler::Malloc => malloc(ctx, port),
            BuiltinHandler::Free => free(ctx, port),
        }
    }
}

fn malloc(ctx: &HandlerContext<'_>, port: &mut dyn Port) -> Status {
    let device = ctx.device;
    port.recv_and_send(&mut |packet: &mut Packet, lane: u32| {
        let size = packet.data[0];
        let ptr = device
            .allocate(size, None, AllocKind::DeviceNonBlocking)
            .unwrap_or(DevicePtr::NULL);
        if ptr.is_null() {
            ctx.metrics.failed_allocations.fetch_add(1, Ordering::Relaxed);
        } else {
            ctx.metrics.allocations.fetch_add(1, Ordering::Relaxed);
        }
        trace!(device = %device.id(), lane, size, ptr = %ptr, "device malloc");
        packet.data[0] = ptr.addr();
    });
    Status::Success
}

fn free(ctx: &HandlerContext<'_>, port: &mut dyn Port) -> Status {
    let device = ctx.device;
    port.recv(&mut |packet: &Packet, lane: u32| {
        let ptr = DevicePtr(packet.data[0]);
        match device.free(ptr, AllocKind::DeviceNonBlocking) {
            Ok(()) => {
                ctx.metrics.frees.fetch_add(1, Ordering::Relaxed);
                trace!(device = %device.id(), lane, ptr = %ptr, "device free");
            }
            // The device API has no way to report this back.
            Err(e) => warn!(device = %device.id(), lane, ptr = %ptr, "device free failed: {}", e),
        }
    });
    Status::Success
}

/// Opcode -> builtin lookup. Opcodes not in the table go to the delegate.
#[derive(Debug, Clone)]
pub struct HandlerTable {
    builtins: HashMap<u32, BuiltinHandler>,
}

impl HandlerTable {
    /// Table with every builtin registered under its libc opcode.
    pub fn new() -> Self {
        let builtins = BuiltinHandler::ALL
            .iter()
            .map(|handler| (handler.opcode().raw(), *handler))
            .collect();
        Self { builtins }
    }

    /// Table that delegates everything.
    pub fn empty() -> Self {
        Self {
            builtins: HashMap::new(),
        }
    }

    /// Register `handler` under a raw opcode, replacing any previous entry.
    pub fn with(mut self, opcode: u32, handler: BuiltinHandler) -> Self {
        self.builtins.insert(opcode, handler);
        self
    }

    pub fn lookup(&self, opcode: u32) -> Handler {
        match self.builtins.get(&opcode) {
            Some(handler) => Handler::Builtin(*handler),
            None => Handler::Delegate,
        }
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}
