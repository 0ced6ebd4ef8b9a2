use crate::channel::{Port, ServerView, Transport};

/// Transport selected when the bridge is switched off.
///
/// Channels need no memory, no device program is ever wired up, and no
/// request is ever pending, so every bridge operation is a no-op success.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledTransport;

impl Transport for DisabledTransport {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn client_symbol(&self) -> Option<&'static str> {
        None
    }

    fn allocation_size(&self, _lane_size: u32, _port_count: u32) -> usize {
        0
    }

    fn reset(&self, _view: &ServerView) {}

    fn try_open<'a>(&'a self, _view: &'a ServerView, _lane_size: u32) -> Option<Box<dyn Port + 'a>> {
        None
    }
}
