//! One-shot watering trigger for cron or a systemd timer: publishes a
//! command to each selected channel's topic, waits for the broker to
//! acknowledge, then exits.

mod config;

use anyhow::{bail, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use tokio::time::{sleep, timeout};
use tracing_subscriber::EnvFilter;

/// Spacing between publishes, so the pump sees the commands in order.
const PUBLISH_SPACING: Duration = Duration::from_millis(100);

/// How long to wait for the broker to acknowledge everything.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

const COMMANDS: [&str; 3] = ["on", "off", "shutdown"];

fn parse_command(raw: &str) -> Result<String> {
    let command = raw.trim().to_ascii_lowercase();
    if !COMMANDS.contains(&command.as_str()) {
        bail!("unknown COMMAND '{raw}' (use on, off or shutdown)");
    }
    Ok(command)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let command = parse_command(&env::var("COMMAND").unwrap_or_else(|_| "on".to_string()))?;

    let cfg = config::load(&config_path)?;
    let channels = cfg.select(env::var("CHANNELS").ok().as_deref())?;
    if channels.is_empty() {
        tracing::warn!("no channels to trigger");
        return Ok(());
    }

    let mut mqttoptions = MqttOptions::new("garden-trigger", broker.as_str(), port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    let base = cfg.base_topic().to_string();
    let publisher = client.clone();
    let topics: Vec<String> = channels
        .iter()
        .map(|c| config::command_topic(&base, c))
        .collect();
    let expected = topics.len();

    tokio::spawn(async move {
        for topic in topics {
            match publisher
                .publish(topic.as_str(), QoS::AtLeastOnce, false, command.as_bytes().to_vec())
                .await
            {
                Ok(()) => tracing::info!(%topic, %command, "published"),
                Err(e) => tracing::error!(%topic, "publish error: {e}"),
            }
            sleep(PUBLISH_SPACING).await;
        }
    });

    // Drive the connection until every publish is acknowledged.
    let acked = timeout(ACK_TIMEOUT, async {
        let mut acked = 0;
        while acked < expected {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!(%broker, port, "connected to mqtt");
                }
                Ok(Event::Incoming(Packet::PubAck(_))) => acked += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
        acked
    })
    .await;

    match acked {
        Ok(n) => tracing::info!(channels = n, "all commands acknowledged"),
        Err(_) => bail!("broker did not acknowledge all commands within {ACK_TIMEOUT:?}"),
    }

    if let Err(e) = client.disconnect().await {
        tracing::debug!("disconnect: {e}");
    }
    // Flush the disconnect packet.
    let _ = timeout(Duration::from_millis(500), eventloop.poll()).await;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
