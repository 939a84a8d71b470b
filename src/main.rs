use std::{process, sync::OnceLock};

use tether::{config::Config, core::probe::Probe, logger::LoggerManager, print_error};
use tether_client::{Client, ConnectionState};
use tracing::{debug, error, info, warn};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

fn log_probe_table(cfg: &Config) {
    let rows: Vec<(String, String)> = cfg
        .probe
        .rooms
        .iter()
        .map(|room| ("ROOM".to_string(), room.clone()))
        .chain(
            cfg.probe
                .requests
                .iter()
                .map(|req| (req.verb.clone(), req.url.clone())),
        )
        .collect();

    let kind_width = rows
        .iter()
        .map(|(kind, _)| kind.len())
        .max()
        .unwrap_or(4)
        .max("Kind".len());

    info!("{:<width$} | Target", "Kind", width = kind_width);
    info!("{}-+-{}", "-".repeat(kind_width), "-".repeat(24));
    for (kind, target) in rows {
        info!("{:<width$} | {}", kind, target, width = kind_width);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting tether version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.client);

    log_probe_table(cfg);

    let client = Client::new(cfg.client.clone()).unwrap_or_else(|e| {
        error!("Failed to create client: {}", e);
        process::exit(1);
    });

    let mut states = client.subscribe_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            match states.borrow_and_update().clone() {
                ConnectionState::Connected => info!("Connection state: Connected"),
                ConnectionState::Connecting => debug!("Connection state: Connecting"),
                ConnectionState::Disconnected(reason) => {
                    warn!("Connection state: Disconnected ({})", reason)
                }
            }
        }
    });

    let probe = Probe::new(client.clone(), cfg.probe.clone());

    let interrupted = tokio::select! {
        result = probe.run() => {
            if let Err(e) = result {
                error!("Probe stopped: {}", e);
                client.shutdown().await;
                process::exit(1);
            }
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };

    if !interrupted {
        info!("Probe round finished, listening for room events (Ctrl+C to stop)");
        tokio::signal::ctrl_c().await?;
    }

    info!("Received Ctrl+C, initiating graceful shutdown...");
    client.shutdown().await;
    info!(
        succeeded = probe.stats().succeeded(),
        failed = probe.stats().failed(),
        room_events = probe.stats().room_events(),
        "Shutdown complete"
    );
    Ok(())
}
