//! `gpurpc simulate`: host-memory devices issuing requests from worker threads
//! while the bridge polls them from the async runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use gpurpc_core::RpcConfig;
use gpurpc_protocol::{wire, DeviceId, Opcode};
use gpurpc_server::host_device::HostDeviceStats;
use gpurpc_server::{Device, HostDevice, MetricsSnapshot, RpcError, RpcServer, SymbolTable};
use gpurpc_transport::sim::DeviceClient;

/// Opcode no handler claims; each worker sends it once.
const UNKNOWN_OPCODE: u32 = 0xdead;

/// What one device-side worker observed.
#[derive(Debug, Default, Clone, Copy)]
struct WorkerReport {
    device: u32,
    mallocs: u64,
    null_replies: u64,
    frees: u64,
}

pub struct Summary {
    transport: &'static str,
    elapsed: Duration,
    workers: Vec<WorkerReport>,
    devices: Vec<(DeviceId, HostDeviceStats)>,
    rejected: u64,
    metrics: MetricsSnapshot,
}

impl Summary {
    pub fn print(&self) {
        println!("Simulation finished in {:.2?} ({} transport)", self.elapsed, self.transport);
        println!();
        for worker in &self.workers {
            println!("  Device {}:", worker.device);
            println!("    Mallocs:       {}", worker.mallocs);
            println!("    Null replies:  {}", worker.null_replies);
            println!("    Frees:         {}", worker.frees);
        }
        for (id, stats) in &self.devices {
            println!("  Device {} memory: {} live blocks, {} bytes", id, stats.live_blocks, stats.bytes_in_use);
        }
        println!();
        println!("  Requests:      {}", self.metrics.requests);
        println!("  Delegated:     {}", self.metrics.delegated);
        println!("  Rejected:      {}", self.rejected);
        println!("  Allocations:   {}", self.metrics.allocations);
        println!("  Failed:        {}", self.metrics.failed_allocations);
        println!("  Frees:         {}", self.metrics.frees);
    }
}

/// Workers and channels started so far. Whatever happens while driving
/// them, [`Fleet::shutdown`] stops the workers before any channel is released.
struct Fleet {
    workers: JoinSet<WorkerReport>,
    attached: Vec<Arc<HostDevice>>,
    stop: Arc<AtomicBool>,
}

impl Fleet {
    fn new() -> Self {
        Self {
            workers: JoinSet::new(),
            attached: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn shutdown(mut self, server: &RpcServer) -> anyhow::Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                warn!("device worker failed during shutdown: {}", e);
            }
        }

        let mut first_err = None;
        for device in &self.attached {
            if let Err(e) = server.deinit_device(device.as_ref()) {
                warn!(device = %device.id(), "failed to release RPC channel: {}", e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

pub async fn run(config: &RpcConfig) -> anyhow::Result<Summary> {
    let sim = &config.simulation;
    let server = RpcServer::from_config(&config.bridge);
    info!(
        transport = server.transport_name(),
        devices = sim.devices,
        lanes = sim.lane_size,
        ports = config.bridge.requested_port_count,
        "starting simulation"
    );

    let devices: Vec<Arc<HostDevice>> = (0..sim.devices)
        .map(|id| {
            Arc::new(HostDevice::new(
                DeviceId(id),
                sim.lane_size,
                config.bridge.requested_port_count,
                sim.memory_limit,
            ))
        })
        .collect();

    let started = Instant::now();
    let mut fleet = Fleet::new();
    let outcome = drive(config, &server, &devices, &mut fleet).await;
    let released = fleet.shutdown(&server).await;
    let (mut reports, rejected) = outcome?;
    released?;

    let metrics = server.metrics().snapshot();
    info!(
        requests = metrics.requests,
        errors = metrics.errors,
        delegated = metrics.delegated,
        allocations = metrics.allocations,
        failed_allocations = metrics.failed_allocations,
        frees = metrics.frees,
        "simulation finished"
    );

    reports.sort_by_key(|r| r.device);
    Ok(Summary {
        transport: server.transport_name(),
        elapsed: started.elapsed(),
        workers: reports,
        devices: devices.iter().map(|d| (d.id(), d.stats())).collect(),
        rejected,
        metrics,
    })
}

/// Attach every device, start its worker and poll until all workers finish.
/// Returns the worker reports and the number of rejected requests.
async fn drive(
    config: &RpcConfig,
    server: &RpcServer,
    devices: &[Arc<HostDevice>],
    fleet: &mut Fleet,
) -> anyhow::Result<(Vec<WorkerReport>, u64)> {
    let sim = &config.simulation;

    for device in devices {
        let image = device
            .load_rpc_image(device.id().0)
            .with_context(|| format!("loading image on device {}", device.id()))?;

        if !server.is_device_using_rpc(device.as_ref(), &SymbolTable, &image)? {
            info!(device = %device.id(), "image does not use RPC, skipping");
            continue;
        }
        server.init_device(device.as_ref(), &SymbolTable, &image)?;
        fleet.attached.push(device.clone());

        let descriptor = device.read_client_descriptor(&image)?;
        // SAFETY: channels are released only by Fleet::shutdown, after every
        // worker has been joined, and `device` (which owns the memory) is kept
        // alive by the worker's own handle.
        let client = unsafe { DeviceClient::from_descriptor(descriptor, device.lane_size()) }?;
        let owner = device.clone();
        let stop = fleet.stop.clone();
        let requests = sim.requests;
        fleet.workers.spawn_blocking(move || {
            let report = device_worker(&client, owner.id(), requests, &stop);
            drop(owner);
            report
        });
    }

    let burst = wire::clamp_port_count(config.bridge.requested_port_count).max(1);
    let mut ticker = tokio::time::interval(Duration::from_micros(sim.poll_interval_us.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut reports = Vec::new();
    let mut rejected = 0;
    while !fleet.workers.is_empty() {
        tokio::select! {
            _ = ticker.tick() => {
                for device in &fleet.attached {
                    rejected += poll_device(server, device.as_ref(), burst)?;
                }
            }
            Some(joined) = fleet.workers.join_next() => {
                let report = joined.context("device worker panicked")?;
                debug!(device = report.device, "device worker finished");
                reports.push(report);
            }
        }
    }
    Ok((reports, rejected))
}

/// Service up to `burst` requests on one device. Returns how many were rejected.
fn poll_device(server: &RpcServer, device: &dyn Device, burst: u32) -> Result<u64, RpcError> {
    let mut rejected = 0;
    for _ in 0..burst {
        match server.run_server(device) {
            Ok(()) => {}
            Err(RpcError::InvalidOpcode { opcode, status }) => {
                warn!(device = %device.id(), opcode, ?status, "device sent an opcode nobody handles");
                rejected += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(rejected)
}

/// Device side: rounds of malloc across every lane followed by the matching
/// frees, plus one request nobody handles. Returns early once `stop` is set.
fn device_worker(client: &DeviceClient, id: DeviceId, requests: u32, stop: &AtomicBool) -> WorkerReport {
    let lane_size = client.lane_size();
    let mask = wire::full_lane_mask(lane_size);
    let mut report = WorkerReport {
        device: id.0,
        ..WorkerReport::default()
    };

    for round in 0..requests {
        let mut addresses = vec![0u64; lane_size as usize];
        let answered = client.call_cancellable(
            Opcode::Malloc.raw(),
            mask,
            |packet, lane| packet.data[0] = 64 * (lane as u64 + 1) + round as u64,
            |packet, lane| addresses[lane as usize] = packet.data[0],
            stop,
        );
        if !answered {
            return report;
        }
        report.mallocs += u64::from(lane_size);
        report.null_replies += addresses.iter().filter(|addr| **addr == 0).count() as u64;

        let answered = client.call_cancellable(
            Opcode::Free.raw(),
            mask,
            |packet, lane| packet.data[0] = addresses[lane as usize],
            |_, _| {},
            stop,
        );
        if !answered {
            return report;
        }
        report.frees += addresses.iter().filter(|addr| **addr != 0).count() as u64;
    }

    client.call_cancellable(UNKNOWN_OPCODE, 0b1, |_, _| {}, |_, _| {}, stop);
    report
}
