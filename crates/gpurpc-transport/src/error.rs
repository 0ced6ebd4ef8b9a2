#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("protocol error: {0}")]
    Protocol(#[from] gpurpc_protocol::ProtocolError),

    #[error("channel buffer is null but {size} bytes were expected")]
    NullBuffer { size: usize },

    #[error("channel buffer at 0x{addr:x} is not {align}-byte aligned")]
    Misaligned { addr: u64, align: usize },
}
