pub mod channel;
pub mod shm;
pub mod disabled;
pub mod sim;
pub mod error;

pub use channel::{Port, ServerView, Transport};
pub use disabled::DisabledTransport;
pub use shm::ShmTransport;
pub use error::TransportError;
