use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::StreamExt;

use blelink::bluetooth::{BtleplugTransport, ConnectionEvent, Peripheral};
use blelink::config::LinkConfig;
use blelink::logging::configure_logging;

/// RSSI readings taken before disconnecting
const RSSI_SAMPLES: usize = 3;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let Some(prefix) = args.get(1) else {
        print_usage();
        return;
    };
    let config_path = args
        .get(2)
        .map(PathBuf::from)
        .unwrap_or_else(LinkConfig::default_path);

    if let Err(e) = run(prefix, config_path).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(prefix: &str, config_path: PathBuf) -> Result<()> {
    let config = LinkConfig::load_or_default(&config_path)
        .with_context(|| format!("Loading {}", config_path.display()))?;

    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else if let Err(e) = configure_logging(config.log_level, config.log_file.clone(), true) {
        eprintln!("Logging disabled: {}", e);
    }

    let transport = Arc::new(BtleplugTransport::open_default().await?);
    println!("Scanning for {:?}...", config.scan_duration);
    let scanned = transport.scan(config.scan_duration).await?;

    let Some(target) = scanned.into_iter().find(|p| {
        p.advertisement
            .local_name
            .as_deref()
            .is_some_and(|name| name.starts_with(prefix))
    }) else {
        bail!("No peripheral named {}* found", prefix);
    };
    println!("Found {} ({}, RSSI {})", target.advertisement.local_name.as_deref().unwrap_or("?"), target.id, target.rssi);

    let peripheral = Peripheral::new(target.id, target.advertisement, target.rssi, transport);
    let mut events = peripheral.connect(config.to_connect_options()).await?;

    while let Some(item) = events.next().await {
        match item {
            Ok(update) => match update.event {
                ConnectionEvent::Connect => {
                    println!("Connected");
                    inspect(&peripheral, &config).await?;
                    peripheral.disconnect().await?;
                }
                ConnectionEvent::Timeout | ConnectionEvent::Disconnect => {
                    println!("{:?}, reconnecting", update.event);
                    peripheral.reconnect().await?;
                }
                ConnectionEvent::ForceDisconnect => {
                    println!("Disconnected");
                    return Ok(());
                }
                ConnectionEvent::GiveUp => bail!("Gave up connecting to {}", peripheral.id()),
            },
            Err(e) => {
                println!("Connection error: {}, reconnecting", e);
                peripheral.reconnect().await?;
            }
        }
    }

    Ok(())
}

async fn inspect(peripheral: &Peripheral, config: &LinkConfig) -> Result<()> {
    if !peripheral.is_connected() {
        return Ok(());
    }

    match peripheral.discover_all_peripheral_services(config.discovery_timeout).await {
        Ok(services) => {
            for service in services {
                println!("  service {}{}", service.uuid, if service.primary { " (primary)" } else { "" });
                for characteristic in &service.characteristics {
                    println!("    characteristic {} (properties {:#04x})", characteristic.uuid, characteristic.properties);
                }
            }
        }
        Err(e) => println!("Service discovery failed: {}", e),
    }

    let mut readings = peripheral.start_polling_rssi(config.rssi_poll_interval).await?;
    let mut taken = 0;
    while let Some(reading) = readings.next().await {
        match reading {
            Ok(rssi) => {
                println!("  RSSI {}", rssi);
                taken += 1;
                if taken == RSSI_SAMPLES {
                    peripheral.stop_polling_rssi().await?;
                }
            }
            Err(e) => println!("RSSI polling stopped: {}", e),
        }
    }
    Ok(())
}

fn print_usage() {
    println!("Usage:");
    println!("  blelink <name-prefix> [config.json]");
    println!();
    println!("Connects to the first peripheral whose advertised name starts with");
    println!("<name-prefix>, lists its services, samples its RSSI and disconnects.");
}
