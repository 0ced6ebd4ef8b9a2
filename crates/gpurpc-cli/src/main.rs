use clap::{Parser, Subcommand};

mod simulate;

#[derive(Parser)]
#[command(name = "gpurpc")]
#[command(about = "gpurpc - device-to-host RPC bridge")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run simulated devices against the bridge and report what it served
    Simulate {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,

        /// Number of simulated devices
        #[arg(short, long)]
        devices: Option<u32>,

        /// Malloc/free rounds issued by each device
        #[arg(short, long)]
        requests: Option<u32>,

        /// Requested ports per device (clamped to the protocol maximum)
        #[arg(short, long)]
        ports: Option<u32>,

        /// Lanes per device
        #[arg(short, long)]
        lanes: Option<u32>,
    },

    /// Show the channel layout for a device shape
    Layout {
        /// Lanes per device
        #[arg(short, long, default_value_t = 32)]
        lanes: u32,

        /// Requested port count
        #[arg(short, long, default_value_t = 64)]
        ports: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gpurpc_common::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            config,
            devices,
            requests,
            ports,
            lanes,
        } => {
            let path = config.unwrap_or_else(gpurpc_core::config::default_config_path);
            let mut rpc_config = gpurpc_core::RpcConfig::load_or_default(&path);

            if let Some(devices) = devices {
                rpc_config.simulation.devices = devices;
            }
            if let Some(requests) = requests {
                rpc_config.simulation.requests = requests;
            }
            if let Some(ports) = ports {
                rpc_config.bridge.requested_port_count = ports;
            }
            if let Some(lanes) = lanes {
                rpc_config.simulation.lane_size = lanes;
            }

            let summary = simulate::run(&rpc_config).await?;
            summary.print();
        }

        Commands::Layout { lanes, ports } => {
            use gpurpc_protocol::wire;

            wire::validate_lane_size(lanes)?;
            let port_count = wire::clamp_port_count(ports);
            let size = wire::allocation_size(lanes, port_count);

            println!("Channel layout:");
            println!();
            println!("  Lanes:        {}", lanes);
            println!("  Ports:        {} (requested {})", port_count, ports);
            println!("  Header size:  {} bytes", wire::HEADER_SIZE);
            println!("  Packet size:  {} bytes", wire::PACKET_SIZE);
            println!("  Buffer size:  {} bytes", size);
            if port_count > 0 {
                println!(
                    "  Last packet:  offset {}",
                    wire::packet_offset(port_count, lanes, port_count - 1, lanes - 1)
                );
            }
        }
    }

    Ok(())
}
