use std::ops::Deref;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{RwLock, RwLockReadGuard};
use gpurpc_protocol::{DeviceId, DevicePtr};

use crate::error::CoreError;

/// Shared channel buffer recorded for one attached device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBuffer {
    /// Base of the host-visible buffer. Null for channels that need no memory.
    pub buffer: DevicePtr,
    /// Bytes allocated at `buffer`
    pub size: usize,
    /// Clamped port count the buffer was sized for
    pub port_count: u32,
    /// Lane size the buffer was sized for
    pub lane_size: u32,
}

impl ChannelBuffer {
    /// Whether releasing this channel must free device memory.
    pub fn owns_memory(&self) -> bool {
        self.size > 0 && !self.buffer.is_null()
    }
}

struct ChannelEntry {
    channel: ChannelBuffer,
    /// `true` until the entry is removed. Dispatchers hold the read side
    /// while they touch the buffer.
    live: RwLock<bool>,
}

/// Shared handle to one device's channel, detached from the registry map.
#[derive(Clone)]
pub struct ChannelLease {
    entry: Arc<ChannelEntry>,
}

impl ChannelLease {
    /// Pin the buffer for one dispatch. `None` once the channel was removed.
    ///
    /// [`ChannelRegistry::remove`] for this device waits until the returned
    /// guard is dropped, so it must not be called from the pinning thread
    /// while the guard is alive.
    pub fn pin(&self) -> Option<PinnedChannel<'_>> {
        let live = self.entry.live.read();
        if !*live {
            return None;
        }
        Some(PinnedChannel {
            _live: live,
            channel: &self.entry.channel,
        })
    }
}

/// A channel whose buffer cannot be released while this guard exists.
pub struct PinnedChannel<'a> {
    _live: RwLockReadGuard<'a, bool>,
    channel: &'a ChannelBuffer,
}

impl Deref for PinnedChannel<'_> {
    type Target = ChannelBuffer;

    fn deref(&self) -> &ChannelBuffer {
        self.channel
    }
}

/// Per-device channel buffers, at most one per device.
///
/// The map itself is only locked for lookups; dispatchers work on a
/// [`ChannelLease`] so devices never wait on each other.
pub struct ChannelRegistry {
    channels: DashMap<DeviceId, Arc<ChannelEntry>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Record the buffer for a device. Fails if the device already has one.
    pub fn insert(&self, device: DeviceId, channel: ChannelBuffer) -> Result<(), CoreError> {
        match self.channels.entry(device) {
            Entry::Occupied(_) => Err(CoreError::ChannelExists(device)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(ChannelEntry {
                    channel,
                    live: RwLock::new(true),
                }));
                Ok(())
            }
        }
    }

    /// Copy of a device's channel record.
    pub fn get(&self, device: DeviceId) -> Option<ChannelBuffer> {
        self.channels.get(&device).map(|entry| entry.channel)
    }

    /// Handle for dispatching on a device's channel.
    pub fn lease(&self, device: DeviceId) -> Option<ChannelLease> {
        let entry = self.channels.get(&device)?.value().clone();
        Some(ChannelLease { entry })
    }

    pub fn contains(&self, device: DeviceId) -> bool {
        self.channels.contains_key(&device)
    }

    /// Remove a device's channel, returning the buffer to release.
    ///
    /// Waits for in-flight dispatches pinned on the channel to finish; once
    /// this returns nobody can reach the buffer through the registry.
    pub fn remove(&self, device: DeviceId) -> Option<ChannelBuffer> {
        let (_, entry) = self.channels.remove(&device)?;
        *entry.live.write() = false;
        Some(entry.channel)
    }

    /// Devices with a registered channel, in ascending order.
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self.channels.iter().map(|e| *e.key()).collect();
        devices.sort_unstable();
        devices
    }

    /// Return number of registered channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
