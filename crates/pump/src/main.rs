mod channels;
mod config;
mod dispatcher;
mod error;
mod locks;
mod moisture;
mod mqtt;
mod notify;
mod relay;
mod session;
mod sessions;
mod state;
mod web;

#[cfg(test)]
mod testing;

use anyhow::Result;
use rumqttc::MqttOptions;
use std::{env, sync::Arc, time::Duration};
use tracing_subscriber::EnvFilter;

use channels::ChannelRegistry;
use dispatcher::Dispatcher;
use locks::LockTable;
use moisture::MoistureProbe;
use mqtt::MqttLink;
use notify::MqttNotifier;
use relay::RelayBoard;
use session::SessionContext;
use sessions::SessionRegistry;
use state::SystemState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let client_id = env::var("MQTT_CLIENT_ID").unwrap_or_else(|_| "garden-pump".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let base_topic = cfg.base_topic().to_string();

    let registry = ChannelRegistry::from_config(&cfg);
    if registry.is_empty() {
        tracing::warn!("no channels configured, every command will be refused");
    }
    let channel_to_pin: Vec<(String, u8)> = registry
        .channels()
        .map(|c| (c.name.clone(), c.pin))
        .collect();

    // ── Relay board ─────────────────────────────────────────────────
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);
    let relay = Arc::new(RelayBoard::new(&registry.pins(), active_low)?);

    // ── Moisture probe ──────────────────────────────────────────────
    let probe = moisture_probe();

    // ── Shared state (ephemeral, for the status API) ────────────────
    let shared = SystemState::new(&channel_to_pin).shared();
    shared
        .write()
        .await
        .record_system(format!("pump controller started, {} channel(s)", registry.len()));

    // ── MQTT ────────────────────────────────────────────────────────
    let mut options = MqttOptions::new(client_id, broker.as_str(), port);
    options.set_keep_alive(Duration::from_secs(30));
    let mut link = MqttLink::new(options, &base_topic);
    let notifier = Arc::new(MqttNotifier::new(link.client(), &base_topic));

    let ctx = Arc::new(SessionContext {
        relay,
        probe,
        notifier,
        locks: LockTable::new(),
        sessions: SessionRegistry::new(),
        state: Arc::clone(&shared),
    });
    let dispatcher = Dispatcher::new(
        registry,
        ctx,
        Duration::from_secs(cfg.shutdown_drain_sec),
    );

    // ── Web server ──────────────────────────────────────────────────
    let web_state = Arc::clone(&shared);
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            tracing::error!("{e:#}");
        }
    });

    tracing::info!(%broker, port, %base_topic, "pump controller running");

    tokio::select! {
        _ = mqtt::run(&mut link, &base_topic, &dispatcher, &shared) => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!("failed to listen for ctrl-c: {e}");
            }
            tracing::info!("interrupted, shutting down");
            dispatcher.shutdown().await;
        }
    }

    // Whatever ended the loop, leave every relay off.
    dispatcher.shutdown_all();
    tracing::info!("pump controller stopped");
    Ok(())
}

#[cfg(feature = "adc")]
fn moisture_probe() -> Option<Arc<dyn MoistureProbe>> {
    match moisture::Mcp3008::new() {
        Ok(adc) => Some(Arc::new(adc)),
        Err(e) => {
            tracing::error!("moisture ADC unavailable, gated channels will water: {e:#}");
            None
        }
    }
}

/// Without ADC hardware, `SIM_MOISTURE` sets the value every input reads.
#[cfg(not(feature = "adc"))]
fn moisture_probe() -> Option<Arc<dyn MoistureProbe>> {
    let value = env::var("SIM_MOISTURE").ok().and_then(|s| s.parse().ok());
    if value.is_none() {
        tracing::info!("no moisture hardware, gated channels will water");
    }
    Some(Arc::new(moisture::StaticProbe::new(value)))
}
