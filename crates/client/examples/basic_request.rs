//! Connects to a node, joins a room and issues one request.
//!
//! ```text
//! TETHER_URL=ws://127.0.0.1:3000 cargo run -p tether-client --example basic_request
//! ```

use tether_client::{Client, ClientConfig, ConnectionState};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tether_client=debug".into()),
        )
        .init();

    let url = std::env::var("TETHER_URL").unwrap_or_else(|_| "ws://127.0.0.1:3000".into());
    let mut config = ClientConfig::new(url);
    if let Ok(token) = std::env::var("TETHER_TOKEN") {
        config = config.with_access_token(token);
    }

    let client = Client::new(config)?;
    info!(client_id = client.client_id(), "client created");

    // Log every connection state change
    let mut states = client.subscribe_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            match states.borrow_and_update().clone() {
                ConnectionState::Connected => info!("online"),
                ConnectionState::Disconnected(reason) => warn!(reason = %reason, "offline"),
                ConnectionState::Connecting => info!("connecting"),
            }
        }
    });

    client
        .subscribe("room-a", |data| info!(%data, "room-a event"))
        .await?;

    match client.request("GET", "/users/5").await {
        Ok(user) => info!(%user, "user loaded"),
        Err(e) => error!(error = %e, "request failed"),
    }

    info!("waiting for room events, press Ctrl+C to stop");
    signal::ctrl_c().await?;

    client.shutdown().await;
    info!("client stopped");
    Ok(())
}
