//! MQTT topic/payload helpers, the transport capability, and the command
//! loop that feeds inbound publishes to the dispatcher.
//!
//! Commands arrive on `<base>/<channel>` with a plain-text payload
//! (`on`, `off`, `shutdown`). Status goes out on `<base>/<channel>/state`.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::dispatcher::Dispatcher;
use crate::state::SharedState;

/// Upper bound for a fire-and-forget publish to reach the client queue.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a transport error before polling again.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract the channel from `<base>/<channel>`.
pub fn extract_channel<'a>(base: &str, topic: &'a str) -> Option<&'a str> {
    let rest = topic.strip_prefix(base)?.strip_prefix('/')?;
    if rest.is_empty() || rest.contains('/') {
        None
    } else {
        Some(rest)
    }
}

/// Subscription filter for every channel under `base`.
pub fn command_filter(base: &str) -> String {
    format!("{base}/+")
}

pub fn status_topic(base: &str, channel: &str) -> String {
    format!("{base}/{channel}/state")
}

pub fn notify_topic(base: &str) -> String {
    format!("{base}/notify")
}

/// Normalise a command payload: lossy UTF-8, trimmed, lowercase.
pub fn decode_payload(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).trim().to_lowercase()
}

/// Publish without waiting: the task is detached and gives up after
/// [`PUBLISH_TIMEOUT`]. Failures are logged, never returned.
pub fn spawn_publish(client: AsyncClient, topic: String, payload: Vec<u8>) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::time::timeout(
            PUBLISH_TIMEOUT,
            client.publish(topic.as_str(), QoS::AtLeastOnce, false, payload),
        )
        .await
        {
            Ok(Ok(())) => tracing::debug!(%topic, "published"),
            Ok(Err(e)) => tracing::warn!(%topic, "publish failed: {e}"),
            Err(_) => tracing::warn!(%topic, "publish timed out"),
        }
    })
}

// ---------------------------------------------------------------------------
// Transport capability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Message { topic: String, payload: Vec<u8> },
    /// Anything else the transport saw (acks, pings).
    Other,
}

/// What the command loop needs from a pub/sub connection.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Drive the connection until the next event. Errors are transport
    /// faults; the caller keeps polling and the transport reconnects.
    async fn next_event(&mut self) -> anyhow::Result<TransportEvent>;
}

pub struct MqttLink {
    client: AsyncClient,
    eventloop: EventLoop,
    filter: String,
}

impl MqttLink {
    pub fn new(options: MqttOptions, base_topic: &str) -> Self {
        let (client, eventloop) = AsyncClient::new(options, 20);
        Self {
            client,
            eventloop,
            filter: command_filter(base_topic),
        }
    }

    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }
}

impl Transport for MqttLink {
    async fn next_event(&mut self) -> anyhow::Result<TransportEvent> {
        let event = self.eventloop.poll().await?;
        Ok(match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                // Subscribing on every ConnAck renews the subscription after
                // a reconnect. try_subscribe: we are the task draining the
                // request queue, so awaiting here could stall.
                if let Err(e) = self.client.try_subscribe(self.filter.as_str(), QoS::AtLeastOnce) {
                    tracing::error!(filter = %self.filter, "subscribe failed: {e}");
                } else {
                    tracing::info!(filter = %self.filter, "subscribed");
                }
                TransportEvent::Connected
            }
            Event::Incoming(Packet::Disconnect) => TransportEvent::Disconnected,
            Event::Incoming(Packet::Publish(p)) => TransportEvent::Message {
                topic: p.topic.clone(),
                payload: p.payload.to_vec(),
            },
            _ => TransportEvent::Other,
        })
    }
}

// ---------------------------------------------------------------------------
// Command loop
// ---------------------------------------------------------------------------

/// Feed inbound commands to `dispatcher` until a `shutdown` command has
/// been handled.
pub async fn run<T: Transport>(
    transport: &mut T,
    base_topic: &str,
    dispatcher: &Dispatcher,
    shared: &SharedState,
) {
    loop {
        match transport.next_event().await {
            Ok(TransportEvent::Message { topic, payload }) => {
                let Some(channel) = extract_channel(base_topic, &topic) else {
                    tracing::warn!(%topic, "ignoring publish on unexpected topic");
                    continue;
                };
                let command = decode_payload(&payload);
                tracing::info!(%channel, %command, "received command");

                // Refusals are logged and recorded by the dispatcher.
                let _ = dispatcher.on_command(channel, &command).await;

                if dispatcher.is_stopped() {
                    tracing::info!("dispatcher stopped, leaving command loop");
                    return;
                }
            }
            Ok(TransportEvent::Connected) => {
                tracing::info!("mqtt connected");
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(TransportEvent::Disconnected) => {
                tracing::warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(TransportEvent::Other) => {}
            Err(e) => {
                // Running sessions are left alone: they stop on their own
                // duration and the registries keep their state.
                tracing::error!("mqtt error: {e:#}. reconnecting...");
                {
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                }
                sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
