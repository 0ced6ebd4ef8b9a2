#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("client descriptor must be {expected} bytes, got {actual}")]
    DescriptorSize { expected: usize, actual: usize },

    #[error("client descriptor names {0} ports, above the supported maximum")]
    TooManyPorts(u64),

    #[error("unknown status code: {0:#x}")]
    UnknownStatus(u32),

    #[error("unsupported lane size: {0}")]
    UnsupportedLaneSize(u32),
}
