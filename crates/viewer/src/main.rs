use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;

use veldt::stats::rand_u64;
use veldt::{
    CircuitConfig, CircuitIdentity, ObjectUpdate, PacketLossSimulation, Simulator, SimulatorEvent,
};

#[derive(Parser)]
#[command(name = "veldt-viewer")]
#[command(about = "Headless viewer: opens a circuit to a region and logs decoded traffic")]
struct Args {
    /// Region simulator address, host:port
    address: String,

    #[arg(short, long, default_value_t = 0)]
    circuit_code: u32,

    #[arg(short, long, default_value_t = 0, help = "Stop after N seconds (0 = until dropped)")]
    duration: u64,

    #[arg(long, help = "Enable inbound packet loss simulation")]
    simulate_packet_loss: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,
}

fn random_id() -> [u8; 16] {
    let mut id = [0u8; 16];
    id[..8].copy_from_slice(&rand_u64().to_le_bytes());
    id[8..].copy_from_slice(&rand_u64().to_le_bytes());
    id
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = CircuitConfig {
        loss_simulation: PacketLossSimulation {
            enabled: args.simulate_packet_loss,
            loss_percent: args.loss_percent,
        },
        ..CircuitConfig::default()
    };

    // Session and agent ids would normally come from the login service.
    let identity = CircuitIdentity {
        circuit_code: if args.circuit_code != 0 {
            args.circuit_code
        } else {
            rand_u64() as u32
        },
        session_id: random_id(),
        agent_id: random_id(),
    };

    let (mut simulator, events) = Simulator::connect(&args.address, identity, config)?;
    log::info!(
        "circuit {} opened to {}",
        simulator.circuit_code(),
        simulator.peer()
    );

    let started = Instant::now();
    let mut objects_seen: u64 = 0;

    loop {
        if args.duration > 0 && started.elapsed() >= Duration::from_secs(args.duration) {
            log::info!("duration elapsed, closing circuit");
            simulator.disconnect();
            break;
        }

        let event = match events.recv_timeout(Duration::from_millis(250)) {
            Ok(event) => event,
            Err(_) => continue,
        };

        match event {
            SimulatorEvent::Connected => {
                log::info!("region acknowledged movement, circuit live");
            }
            SimulatorEvent::Disconnected { reason } => {
                log::info!("circuit dropped: {reason:?}");
                break;
            }
            SimulatorEvent::ObjectUpdate(packet) => {
                objects_seen += packet.updates.len() as u64;
                for update in &packet.updates {
                    match update {
                        ObjectUpdate::Full(m) => {
                            log::info!(
                                "object {} at {:?} (avatar: {})",
                                m.local_id,
                                m.position,
                                m.is_avatar
                            );
                        }
                        ObjectUpdate::Terse(m) => {
                            log::debug!("object {} moved to {:?}", m.local_id, m.position);
                        }
                        ObjectUpdate::Compressed(c) => {
                            log::info!(
                                "object {} (pcode {}) at {:?}",
                                c.movement.local_id,
                                c.extras.pcode,
                                c.movement.position
                            );
                        }
                        ObjectUpdate::CacheMiss { local_id, .. } => {
                            log::debug!("cache miss for object {local_id}, re-requested");
                        }
                    }
                }
            }
            SimulatorEvent::PingMeasured {
                rtt_ms,
                time_dilation,
            } => {
                log::info!("ping {rtt_ms:.1} ms, time dilation {time_dilation:.2}");
            }
            SimulatorEvent::DeliveryFailed { sequence } => {
                log::warn!("packet {sequence} was never acknowledged");
            }
            SimulatorEvent::Packet { msg_id, payload } => {
                log::debug!("catalog packet {msg_id} ({} bytes)", payload.len());
            }
        }
    }

    let stats = simulator.stats();
    log::info!(
        "session: {} packets out ({} bytes), {} in ({} bytes), {} resent, {} dropped, {} objects",
        stats.packets_sent,
        stats.bytes_sent,
        stats.packets_received,
        stats.bytes_received,
        stats.packets_resent,
        stats.packets_dropped,
        objects_seen
    );

    Ok(())
}
