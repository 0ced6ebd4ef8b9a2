use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use gpurpc_core::config::BridgeConfig;
use gpurpc_core::{ChannelBuffer, ChannelRegistry, CoreError};
use gpurpc_protocol::wire;
use gpurpc_protocol::{ClientDescriptor, DeviceId, DevicePtr, Opcode};
use gpurpc_transport::{DisabledTransport, ServerView, ShmTransport, Transport};

use crate::delegate::{OpcodeDelegate, UnhandledOpcodes};
use crate::device::{AllocKind, Device, DeviceImage, GlobalHandler};
use crate::error::RpcError;
use crate::handlers::{Handler, HandlerContext, HandlerTable};
use crate::metrics::BridgeMetrics;

/// Size of the device global that points at the client descriptor.
const CLIENT_GLOBAL_SIZE: u64 = std::mem::size_of::<u64>() as u64;

/// Host end of the device-to-host RPC bridge.
///
/// Owns one shared channel per attached device. [`RpcServer::run_server`]
/// services at most one pending request per call and never blocks waiting
/// for one; callers poll it from whatever loop drives the device.
pub struct RpcServer {
    transport: Box<dyn Transport>,
    delegate: Box<dyn OpcodeDelegate>,
    handlers: HandlerTable,
    registry: ChannelRegistry,
    metrics: BridgeMetrics,
}

impl RpcServer {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Box::new(transport),
            delegate: Box::new(UnhandledOpcodes),
            handlers: HandlerTable::new(),
            registry: ChannelRegistry::new(),
            metrics: BridgeMetrics::new(),
        }
    }

    /// Select the transport from configuration.
    pub fn from_config(config: &BridgeConfig) -> Self {
        if config.enabled {
            Self::new(ShmTransport::new())
        } else {
            Self::new(DisabledTransport)
        }
    }

    /// Forward opcodes without a builtin handler to `delegate`.
    pub fn with_delegate(mut self, delegate: impl OpcodeDelegate + 'static) -> Self {
        self.delegate = Box::new(delegate);
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerTable) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &BridgeMetrics {
        &self.metrics
    }

    pub fn is_initialized(&self, device: &dyn Device) -> bool {
        self.registry.contains(device.id())
    }

    /// Whether the program loaded on `device` links the RPC client.
    pub fn is_device_using_rpc(
        &self,
        device: &dyn Device,
        handler: &dyn GlobalHandler,
        image: &DeviceImage,
    ) -> Result<bool, RpcError> {
        let Some(symbol) = self.transport.client_symbol() else {
            return Ok(false);
        };
        handler
            .is_symbol_in_image(device, image, symbol)
            .map_err(|source| RpcError::ImageLookup {
                device: device.id(),
                source,
            })
    }

    /// Allocate the shared channel for `device` and point the device program at it.
    ///
    /// On failure nothing is registered and any allocated buffer is released.
    pub fn init_device(
        &self,
        device: &dyn Device,
        handler: &dyn GlobalHandler,
        image: &DeviceImage,
    ) -> Result<(), RpcError> {
        let id = device.id();
        if self.registry.contains(id) {
            return Err(RpcError::AlreadyInitialized(id));
        }

        let (lane_size, port_count) = channel_shape(device)?;
        let size = self.transport.allocation_size(lane_size, port_count);

        let Some(symbol) = self.transport.client_symbol() else {
            self.register(
                id,
                ChannelBuffer {
                    buffer: DevicePtr::NULL,
                    size: 0,
                    port_count,
                    lane_size,
                },
            )?;
            debug!(device = %id, transport = self.transport.name(), "RPC channel needs no buffer");
            return Ok(());
        };

        let buffer = device
            .allocate(size as u64, None, AllocKind::Host)
            .filter(|ptr| !ptr.is_null())
            .ok_or(RpcError::Allocation(id))?;

        let channel = ChannelBuffer {
            buffer,
            size,
            port_count,
            lane_size,
        };
        let installed = self
            .install_client(device, handler, image, symbol, &channel)
            .and_then(|()| self.register(id, channel));
        if let Err(e) = installed {
            if let Err(free_err) = device.free(buffer, AllocKind::Host) {
                warn!(device = %id, buffer = %buffer, "failed to release RPC buffer: {}", free_err);
            }
            return Err(e);
        }

        info!(
            device = %id,
            port_count,
            lane_size,
            size,
            buffer = %buffer,
            transport = self.transport.name(),
            "RPC channel initialized"
        );
        Ok(())
    }

    fn register(&self, id: DeviceId, channel: ChannelBuffer) -> Result<(), RpcError> {
        self.registry.insert(id, channel).map_err(|e| match e {
            CoreError::ChannelExists(device) => RpcError::AlreadyInitialized(device),
            other => RpcError::Registry(other),
        })
    }

    fn install_client(
        &self,
        device: &dyn Device,
        handler: &dyn GlobalHandler,
        image: &DeviceImage,
        symbol: &'static str,
        channel: &ChannelBuffer,
    ) -> Result<(), RpcError> {
        let id = device.id();

        // SAFETY: the buffer was just allocated host-visible with `size` bytes
        // and is released only by deinit_device or the caller's error path.
        let view = unsafe { ServerView::new(channel.port_count, channel.buffer, channel.size) }
            .map_err(|source| RpcError::Buffer { device: id, source })?;
        self.transport.reset(&view);

        let global = handler
            .global_metadata(device, image, symbol, CLIENT_GLOBAL_SIZE)
            .map_err(|source| RpcError::SymbolMetadata {
                device: id,
                symbol,
                source,
            })?;

        let mut client_ptr = [0u8; CLIENT_GLOBAL_SIZE as usize];
        device
            .data_retrieve(&mut client_ptr, global.addr)
            .map_err(|source| RpcError::Transfer { device: id, source })?;
        let client_ptr = DevicePtr(u64::from_ne_bytes(client_ptr));

        let descriptor = ClientDescriptor::new(channel.port_count, channel.buffer);
        device
            .data_submit(client_ptr, &descriptor.to_bytes())
            .map_err(|source| RpcError::Transfer { device: id, source })?;

        debug!(device = %id, symbol, client = %client_ptr, "installed RPC client descriptor");
        Ok(())
    }

    /// Service at most one pending request on `device`'s channel.
    ///
    /// Returns `Ok(())` when nothing is pending. The port is always closed
    /// before returning, including when the handler rejects the opcode.
    pub fn run_server(&self, device: &dyn Device) -> Result<(), RpcError> {
        let id = device.id();
        let lease = self.registry.lease(id).ok_or(RpcError::NotInitialized(id))?;
        // Pinned until the port is closed so teardown cannot free the buffer under us.
        let channel = lease.pin().ok_or(RpcError::NotInitialized(id))?;

        let (lane_size, port_count) = channel_shape(device)?;
        if port_count != channel.port_count || lane_size != channel.lane_size {
            return Err(RpcError::LayoutMismatch {
                device: id,
                port_count,
                lane_size,
                expected_ports: channel.port_count,
                expected_lanes: channel.lane_size,
            });
        }

        // SAFETY: a pinned channel's buffer stays allocated with `size` bytes
        // until `channel` is dropped.
        let view = unsafe { ServerView::new(channel.port_count, channel.buffer, channel.size) }
            .map_err(|source| RpcError::Buffer { device: id, source })?;

        let Some(mut port) = self.transport.try_open(&view, lane_size) else {
            return Ok(());
        };

        let opcode = port.opcode();
        let index = port.index();
        let status = match self.handlers.lookup(opcode) {
            Handler::Builtin(builtin) => {
                let ctx = HandlerContext {
                    device,
                    metrics: &self.metrics,
                };
                builtin.run(&ctx, port.as_mut())
            }
            Handler::Delegate => {
                self.metrics.delegated.fetch_add(1, Ordering::Relaxed);
                self.delegate.handle_port(port.as_mut(), lane_size)
            }
        };
        port.close();
        self.metrics.requests.fetch_add(1, Ordering::Relaxed);

        let name = Opcode::from_raw(opcode).map(Opcode::name).unwrap_or("external");
        if !status.is_success() {
            self.metrics.errors.fetch_add(1, Ordering::Relaxed);
            debug!(device = %id, port = index, opcode, name, ?status, "RPC request rejected");
            return Err(RpcError::InvalidOpcode { opcode, status });
        }

        debug!(device = %id, port = index, opcode, name, "RPC request serviced");
        Ok(())
    }

    /// Release `device`'s channel. Later dispatches for it fail with
    /// [`RpcError::NotInitialized`]; a dispatch already in flight on this
    /// device is allowed to close its port before the buffer is freed.
    pub fn deinit_device(&self, device: &dyn Device) -> Result<(), RpcError> {
        let id = device.id();
        let channel = self.registry.remove(id).ok_or(RpcError::NotInitialized(id))?;
        if channel.owns_memory() {
            device
                .free(channel.buffer, AllocKind::Host)
                .map_err(|source| RpcError::Release { device: id, source })?;
        }
        info!(device = %id, buffer = %channel.buffer, "RPC channel released");
        Ok(())
    }
}

/// Lane size and clamped port count for `device`. Used both to size the
/// buffer at init and to rebuild the view at dispatch, so the two agree.
fn channel_shape(device: &dyn Device) -> Result<(u32, u32), RpcError> {
    let lane_size = device.lane_size();
    wire::validate_lane_size(lane_size).map_err(|_| RpcError::UnsupportedLaneSize {
        device: device.id(),
        lane_size,
    })?;
    Ok((lane_size, wire::clamp_port_count(device.requested_port_count())))
}

