//! Tests for configuration loading and the channel registry.

use gpurpc_core::config::RpcConfig;
use gpurpc_core::{ChannelBuffer, ChannelRegistry, CoreError};
use gpurpc_protocol::{DeviceId, DevicePtr};

fn channel(addr: u64) -> ChannelBuffer {
    ChannelBuffer {
        buffer: DevicePtr(addr),
        size: 4096,
        port_count: 8,
        lane_size: 32,
    }
}

#[test]
fn test_registry_one_channel_per_device() {
    let registry = ChannelRegistry::new();
    registry.insert(DeviceId(0), channel(0x1000)).unwrap();

    let err = registry.insert(DeviceId(0), channel(0x2000)).unwrap_err();
    assert!(matches!(err, CoreError::ChannelExists(DeviceId(0))));
    assert_eq!(registry.get(DeviceId(0)).map(|c| c.buffer), Some(DevicePtr(0x1000)));
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_registry_remove() {
    let registry = ChannelRegistry::new();
    registry.insert(DeviceId(3), channel(0x1000)).unwrap();
    registry.insert(DeviceId(1), channel(0x2000)).unwrap();
    assert_eq!(registry.devices(), vec![DeviceId(1), DeviceId(3)]);

    assert_eq!(registry.remove(DeviceId(3)), Some(channel(0x1000)));
    assert_eq!(registry.remove(DeviceId(3)), None);
    assert!(!registry.contains(DeviceId(3)));
    assert!(registry.get(DeviceId(3)).is_none());

    // The slot can be reused after removal.
    registry.insert(DeviceId(3), channel(0x3000)).unwrap();
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_lease_outlives_map_lookup() {
    let registry = ChannelRegistry::new();
    registry.insert(DeviceId(0), channel(0x1000)).unwrap();
    registry.insert(DeviceId(1), channel(0x2000)).unwrap();

    let lease = registry.lease(DeviceId(0)).expect("registered");
    let pinned = lease.pin().expect("live");
    assert_eq!(pinned.buffer, DevicePtr(0x1000));

    // Other devices are free to come and go while device 0 is pinned.
    assert_eq!(registry.remove(DeviceId(1)), Some(channel(0x2000)));
    registry.insert(DeviceId(2), channel(0x3000)).unwrap();
    drop(pinned);

    assert_eq!(registry.remove(DeviceId(0)), Some(channel(0x1000)));
    assert!(lease.pin().is_none());
    assert!(registry.lease(DeviceId(0)).is_none());
}

#[test]
fn test_remove_waits_for_pinned_channel() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    let registry = ChannelRegistry::new();
    registry.insert(DeviceId(0), channel(0x1000)).unwrap();
    let lease = registry.lease(DeviceId(0)).unwrap();
    let removed = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let pinned = lease.pin().unwrap();
        let remover = scope.spawn(|| {
            let channel = registry.remove(DeviceId(0));
            removed.store(true, Ordering::SeqCst);
            channel
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!removed.load(Ordering::SeqCst));
        drop(pinned);

        assert_eq!(remover.join().unwrap(), Some(channel(0x1000)));
    });
    assert!(lease.pin().is_none());
}

#[test]
fn test_registries_are_independent() {
    let a = ChannelRegistry::new();
    let b = ChannelRegistry::default();
    a.insert(DeviceId(0), channel(0x1000)).unwrap();
    assert!(b.is_empty());
    b.insert(DeviceId(0), channel(0x2000)).unwrap();
}

#[test]
fn test_zero_sized_channel_owns_no_memory() {
    let empty = ChannelBuffer {
        buffer: DevicePtr::NULL,
        size: 0,
        port_count: 64,
        lane_size: 32,
    };
    assert!(!empty.owns_memory());
    assert!(channel(0x1000).owns_memory());
}

#[test]
fn test_config_defaults() {
    let config = RpcConfig::parse("").unwrap();
    assert!(config.bridge.enabled);
    assert_eq!(config.bridge.requested_port_count, 64);
    assert_eq!(config.simulation.lane_size, 32);
    assert_eq!(config.simulation.devices, 1);
}

#[test]
fn test_config_overrides() {
    let config = RpcConfig::parse(
        r#"
        [bridge]
        enabled = false
        requested_port_count = 10000

        [simulation]
        devices = 3
        lane_size = 64
        requests = 8
        "#,
    )
    .unwrap();
    assert!(!config.bridge.enabled);
    assert_eq!(config.bridge.requested_port_count, 10000);
    assert_eq!(config.simulation.devices, 3);
    assert_eq!(config.simulation.lane_size, 64);
    assert_eq!(config.simulation.poll_interval_us, 50);
}

#[test]
fn test_config_rejects_bad_values() {
    assert!(matches!(
        RpcConfig::parse("[simulation]\nlane_size = 128\n"),
        Err(CoreError::ConfigError(_))
    ));
    assert!(matches!(
        RpcConfig::parse("[bridge]\nrequested_port_count = 0\n"),
        Err(CoreError::ConfigError(_))
    ));
    assert!(matches!(RpcConfig::parse("[bridge\n"), Err(CoreError::Parse(_))));
}

#[test]
fn test_missing_config_file_uses_defaults() {
    let config = RpcConfig::load_or_default("/nonexistent/gpurpc.toml");
    assert!(config.bridge.enabled);
}
