use gpurpc_protocol::Status;
use gpurpc_transport::Port;

/// Services opcodes the bridge has no built-in handler for.
///
/// The port is open for the duration of the call and is closed by the caller
/// afterwards, whatever status is returned.
///
/// The device's channel is pinned while the delegate runs: calling
/// [`crate::RpcServer::deinit_device`] for that same device from inside
/// `handle_port` never returns. Other devices are unaffected.
pub trait OpcodeDelegate: Send + Sync {
    fn handle_port(&self, port: &mut dyn Port, lane_size: u32) -> Status;
}

impl<F> OpcodeDelegate for F
where
    F: Fn(&mut dyn Port, u32) -> Status + Send + Sync,
{
    fn handle_port(&self, port: &mut dyn Port, lane_size: u32) -> Status {
        self(port, lane_size)
    }
}

/// Delegate used when no external handler library is attached:
/// every opcode it sees is rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnhandledOpcodes;

impl OpcodeDelegate for UnhandledOpcodes {
    fn handle_port(&self, _port: &mut dyn Port, _lane_size: u32) -> Status {
        Status::UnhandledOpcode
    }
}
