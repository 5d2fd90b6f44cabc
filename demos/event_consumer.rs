//! Long-running event consumer
//!
//! Connects, keeps reconnecting through switch restarts, and prints every
//! HEARTBEAT and BACKGROUND_JOB event as JSON. On each (re)connect a
//! `bgapi status` is queued so a BACKGROUND_JOB shows up right away.
//!
//! Usage: cargo run --example event_consumer [config.json]

use fsclient::{ClientConfig, EslClient, Subscriptions};
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = match std::env::args().nth(1) {
        Some(path) => ClientConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => ClientConfig::default().with_subscriptions(
            Subscriptions::new()
                .filter("Event-Name HEARTBEAT")
                .filter("Event-Name BACKGROUND_JOB")
                .event("HEARTBEAT")
                .event("BACKGROUND_JOB"),
        ),
    };
    info!(addr = %config.address, "Starting event consumer");

    let (client, mut events) = EslClient::builder(config)
        .on_connect(|client| async move {
            match client
                .bgapi("status")
                .await
            {
                Ok(job) => info!(job_uuid = %job, "Queued background status"),
                Err(e) => warn!("bgapi failed: {}", e),
            }
        })
        .start()?;

    if let Err(e) = client
        .wait_connected(Duration::from_secs(10))
        .await
    {
        warn!("Not connected yet ({}), continuing in the background", e);
    }

    let mut count = 0u64;
    while let Some(event) = events
        .recv()
        .await
    {
        count += 1;
        match event.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Could not serialize event: {}", e),
        }
        if count % 100 == 0 {
            info!(
                count,
                dropped = client.dropped_event_count(),
                "Events received"
            );
        }
    }

    info!("Event stream ended after {} events", count);
    Ok(())
}
