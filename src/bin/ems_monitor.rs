/// EMS Bus Monitor
///
/// Starts the protocol engine against a running bus driver and prints
/// every discovered device and every changed value.
///
/// Usage: `ems_monitor [config.yaml|config.json]`

use std::sync::Arc;

use anyhow::Context;
use ems_bus::logging::init_tracing;
use ems_bus::queue::QueueConnector;
use ems_bus::{BusEvent, ChannelSink, EngineConfig, ExternalDriver, ProtocolEngine, TelegramTransport};

#[cfg(target_os = "linux")]
fn connector() -> Arc<dyn QueueConnector> {
    Arc::new(ems_bus::queue::posix::PosixConnector)
}

#[cfg(not(target_os = "linux"))]
fn connector() -> Arc<dyn QueueConnector> {
    eprintln!("⚠️  POSIX message queues unavailable, using in-process queues");
    ems_bus::queue::memory::MemoryBroker::new()
}

fn print_event(event: &BusEvent) {
    let device = event.device();
    match event {
        BusEvent::Discovered { .. } => {
            println!(
                "🔍 0x{:02x}: {} {} (product {}{})",
                device.address,
                device.device_type,
                device.product_name,
                device.product_id,
                if device.read_only { ", read-only" } else { "" }
            );
        }
        BusEvent::Updated { message, changed_fields, .. } => {
            for name in changed_fields {
                let field = message.layout().field(name);
                match (field, message.value(name)) {
                    (Some(field), Some(value)) => println!(
                        "📈 0x{:02x} {:<22} {:<28} {}",
                        device.address,
                        message.layout().name(),
                        field.label,
                        field.display(value)
                    ),
                    (Some(field), None) => println!(
                        "❓ 0x{:02x} {:<22} {:<28} (undecodable)",
                        device.address,
                        message.layout().name(),
                        field.label
                    ),
                    _ => {}
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    println!("🚀 {}", ems_bus::info());
    println!("==============================================");

    let config = match std::env::args().nth(1) {
        Some(path) => {
            println!("Loading configuration from {}", path);
            EngineConfig::load(&path).with_context(|| format!("loading {}", path))?
        }
        None => EngineConfig::default(),
    };
    println!(
        "Link {} as 0x{:02x}, queues {} / {}",
        config.link, config.client_id, config.transport.inbound_queue, config.transport.outbound_queue
    );

    let transport = TelegramTransport::new(&config, connector(), Arc::new(ExternalDriver::new()));
    let (sink, mut events) = ChannelSink::new(256);
    let engine = ProtocolEngine::new(config, transport, Arc::new(sink)).context("building protocol engine")?;

    let handle = match engine.start().await {
        Ok(handle) => {
            println!("✅ Engine started, waiting for the bus driver...");
            handle
        }
        Err(e) => {
            eprintln!("❌ Failed to start: {}", e);
            return Err(e.into());
        }
    };

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\n🛑 Stopping...");
                break;
            }
        }
    }

    handle.stop().await.context("stopping engine")?;

    println!("\n📊 Statistics:");
    for (key, value) in engine.stats() {
        println!("  {:<20} {}", key, value);
    }
    for device in engine.registry().devices().await {
        println!("  device 0x{:02x}: {}", device.address, device.product_name);
    }
    Ok(())
}
