//! Outbound status and notification events. Best-effort: a failed publish
//! is logged by the publishing task and never reaches the caller.

use rumqttc::AsyncClient;

use crate::mqtt::{notify_topic, spawn_publish, status_topic};
use crate::relay::Level;

pub trait Notifier: Send + Sync {
    /// Human-readable notification text.
    fn notify(&self, text: &str);

    /// Current relay level of a channel.
    fn publish_status(&self, channel: &str, level: Level);
}

/// Publishes status to `<base>/<channel>/state` and notifications to
/// `<base>/notify`.
pub struct MqttNotifier {
    client: AsyncClient,
    base_topic: String,
}

impl MqttNotifier {
    pub fn new(client: AsyncClient, base_topic: &str) -> Self {
        Self {
            client,
            base_topic: base_topic.to_string(),
        }
    }
}

impl Notifier for MqttNotifier {
    fn notify(&self, text: &str) {
        spawn_publish(
            self.client.clone(),
            notify_topic(&self.base_topic),
            text.as_bytes().to_vec(),
        );
    }

    fn publish_status(&self, channel: &str, level: Level) {
        spawn_publish(
            self.client.clone(),
            status_topic(&self.base_topic, channel),
            level.to_string().into_bytes(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::MqttOptions;

    #[tokio::test]
    async fn publish_failure_is_swallowed() {
        let opts = MqttOptions::new("test-notify", "127.0.0.1", 1883);
        let (client, eventloop) = AsyncClient::new(opts, 10);
        // Closing the request queue makes every publish fail.
        drop(eventloop);
        let notifier = MqttNotifier::new(client, "garden/watering");

        notifier.notify("dropped");
        notifier.publish_status("in01", Level::Off);
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn publish_without_broker_does_not_block_caller() {
        let opts = MqttOptions::new("test-notify", "127.0.0.1", 1883);
        // Capacity 1 and nobody polling: the second publish cannot be queued.
        let (client, _eventloop) = AsyncClient::new(opts, 1);
        let notifier = MqttNotifier::new(client, "garden/watering");

        for _ in 0..5 {
            notifier.publish_status("in01", Level::On);
        }
    }
}
