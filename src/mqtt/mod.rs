//! MQTT broker + client (spec §4.6): an in-process `rumqttd` broker with
//! anonymous auth and topic-check disabled, plus a co-located `rumqttc`
//! subscriber client dispatching inbound messages to a topic-pattern
//! handler registry. Grounded on the teacher's `notifier.rs` client-setup
//! pattern, paired with `rumqttd` for the broker half.

use std::collections::HashMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS};
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::event_bus::{Event, EventBus};

pub type TopicHandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type TopicHandlerFn = Arc<dyn Fn(String, Vec<u8>) -> TopicHandlerFuture + Send + Sync>;

/// Device logs published to `log/<uuid>/<level>` (SPEC_FULL.md supplement).
#[derive(Debug, Clone)]
pub struct DeviceLogEvent {
    pub uuid: String,
    pub message: String,
}

impl Event for DeviceLogEvent {}

struct TopicHandler {
    pattern: String,
    handler: TopicHandlerFn,
}

/// In-process broker plus co-located subscriber client (§4.6).
pub struct MqttBroker {
    address: Ipv4Addr,
    client: RwLock<Option<AsyncClient>>,
    handlers: RwLock<Vec<TopicHandler>>,
    events: EventBus,
}

impl MqttBroker {
    pub fn new(address: Ipv4Addr, events: EventBus) -> Self {
        Self {
            address,
            client: RwLock::new(None),
            handlers: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Registers a handler for a topic pattern using MQTT wildcard
    /// semantics (`+`, `#`). The co-located client subscribes to the
    /// union of all registered patterns.
    pub fn on_topic(
        &self,
        pattern: impl Into<String>,
        handler: impl Fn(String, Vec<u8>) -> TopicHandlerFuture + Send + Sync + 'static,
    ) {
        self.handlers.write().push(TopicHandler {
            pattern: pattern.into(),
            handler: Arc::new(handler),
        });
    }

    /// Starts the broker (in a blocking thread, since `rumqttd::Broker`
    /// drives its own thread pool) and connects the co-located client.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let config = broker_config(self.address);
        let broker_cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let mut broker = Broker::new(config);
            if let Err(err) = broker.start() {
                error!(error = %err, "rumqttd broker exited");
            }
            broker_cancel.cancel();
        });

        // give the broker a moment to bind before the client dials in.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut options = MqttOptions::new("cloudcutter-internal", self.address.to_string(), 1883);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let patterns: Vec<String> = self.handlers.read().iter().map(|h| h.pattern.clone()).collect();
        for pattern in &patterns {
            client.subscribe(pattern, QoS::AtMostOnce).await?;
        }
        *self.client.write() = Some(client);

        info!(addr = %self.address, topics = ?patterns, "MQTT broker and client started");

        let broker = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("MQTT event loop shutting down");
                        return;
                    }
                    polled = eventloop.poll() => {
                        match polled {
                            Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                                broker.dispatch(publish.topic, publish.payload.to_vec()).await;
                            }
                            Ok(_) => {}
                            Err(err) => {
                                warn!(error = %err, "MQTT event loop error");
                                tokio::time::sleep(Duration::from_millis(500)).await;
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }

    async fn dispatch(&self, topic: String, payload: Vec<u8>) {
        let matching: Vec<TopicHandlerFn> = self
            .handlers
            .read()
            .iter()
            .filter(|h| topic_matches(&h.pattern, &topic))
            .map(|h| Arc::clone(&h.handler))
            .collect();
        for handler in matching {
            handler(topic.clone(), payload.clone()).await;
        }
    }

    /// Publishes via the co-located client (§4.6).
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let client = self.client.read().clone();
        let Some(client) = client else {
            anyhow::bail!("MQTT client not started");
        };
        client.publish(topic, QoS::AtMostOnce, false, payload).await?;
        Ok(())
    }
}

fn broker_config(address: Ipv4Addr) -> Config {
    let listen = format!("{address}:1883").parse().expect("valid socket addr");
    let mut v4 = HashMap::new();
    v4.insert(
        "v4".to_string(),
        ServerSettings {
            name: "v4".to_string(),
            listen,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: 5000,
                max_payload_size: 20_480,
                max_inflight_count: 500,
                auth: None,
                external_auth: None,
                dynamic_filters: true,
            },
        },
    );

    Config {
        id: 0,
        router: RouterConfig {
            max_connections: 10_010,
            max_outgoing_packet_count: 200,
            max_segment_size: 104_857_600,
            max_segment_count: 10,
            ..Default::default()
        },
        v4: Some(v4),
        v5: None,
        ws: None,
        cluster: None,
        console: None,
        bridge: None,
        prometheus: None,
        metrics: None,
    }
}

/// MQTT wildcard topic matching: `+` matches exactly one level, `#`
/// (only valid as the final level) matches the rest of the topic (§4.6).
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern_levels: Vec<&str> = pattern.split('/').collect();
    let topic_levels: Vec<&str> = topic.split('/').collect();

    let mut pi = 0;
    let mut ti = 0;
    while pi < pattern_levels.len() {
        if pattern_levels[pi] == "#" {
            return true;
        }
        if ti >= topic_levels.len() {
            return false;
        }
        if pattern_levels[pi] != "+" && pattern_levels[pi] != topic_levels[ti] {
            return false;
        }
        pi += 1;
        ti += 1;
    }
    ti == topic_levels.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plus_matches_single_level() {
        assert!(topic_matches("smart/device/out/+", "smart/device/out/uuid123"));
        assert!(!topic_matches("smart/device/out/+", "smart/device/out/uuid123/extra"));
    }

    #[test]
    fn hash_matches_remaining_levels() {
        assert!(topic_matches("log/#", "log/uuid123/info"));
        assert!(topic_matches("log/+/+", "log/uuid123/info"));
        assert!(!topic_matches("log/+/+", "log/uuid123"));
    }
}
