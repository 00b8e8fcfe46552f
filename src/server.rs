use anyhow::Context as _;
use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::mqtt::MqttClient;
use crate::ports::Messenger;
use crate::registry::{Admission, Registry};
use crate::topics::{DeviceId, Role, TopicBuilder};

/// Outbound reply produced by the server for one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub topic: String,
    pub payload: String,
}

/// Server side of the handshake: hands out identities and acks heartbeats.
pub struct Server {
    registry: Registry,
    topics: TopicBuilder,
}

impl Server {
    pub fn new(registry: Registry, topics: TopicBuilder) -> Self {
        Server { registry, topics }
    }

    pub fn subscriptions(&self) -> [String; 2] {
        [
            self.topics.wildcard(Role::Register),
            self.topics.wildcard(Role::Heartbeat),
        ]
    }

    /// Decide the replies to one inbound message.
    pub fn handle(&mut self, topic: &str, payload: &str) -> anyhow::Result<Vec<Reply>> {
        match self.topics.parse(topic) {
            Some((Role::Register, hwid)) => self.handle_register(hwid, payload),
            Some((Role::Heartbeat, id)) => Ok(self.handle_heartbeat(id, payload)),
            _ => Ok(Vec::new()),
        }
    }

    fn handle_register(&mut self, hwid: &str, payload: &str) -> anyhow::Result<Vec<Reply>> {
        info!("[DISCOVERY] From {}: {}", hwid, payload);
        let id = match self.registry.register(hwid)? {
            Admission::Assigned(id) => {
                info!(
                    "[SERVER] Assigned new ID {} to {} ({} device(s) registered)",
                    id,
                    hwid,
                    self.registry.len()
                );
                id
            }
            Admission::Known(id) => {
                info!("[SERVER] Known device {}, re-sending ID {}", hwid, id);
                id
            }
            Admission::Full => {
                warn!("[SERVER] Max devices reached. Ignoring {}", hwid);
                return Ok(Vec::new());
            }
        };

        Ok(vec![
            Reply {
                topic: self.topics.topic(Role::AckRequest, hwid),
                payload: "ack_request".to_string(),
            },
            Reply {
                topic: self.topics.topic(Role::IdResponse, hwid),
                payload: id.to_string(),
            },
        ])
    }

    fn handle_heartbeat(&mut self, id: &str, payload: &str) -> Vec<Reply> {
        let id: DeviceId = match id.parse() {
            Ok(id) => id,
            Err(_) => {
                error!("[ERROR] Invalid ID in heartbeat topic: {}", id);
                return Vec::new();
            }
        };
        info!("[HELLO] From ID {}: {}", id, payload);

        if self.registry.record_heartbeat(id) {
            info!("[ACK] Sending ack to ID {}", id);
            vec![Reply {
                topic: self.topics.ack(id),
                payload: "ack".to_string(),
            }]
        } else {
            Vec::new()
        }
    }
}

async fn serve<M: Messenger>(
    messenger: &M,
    inbound: &mut mpsc::UnboundedReceiver<rumqttc::Publish>,
    server: &mut Server,
) {
    while let Some(publish) = inbound.recv().await {
        let payload = String::from_utf8_lossy(&publish.payload);
        let replies = match server.handle(&publish.topic, payload.trim()) {
            Ok(replies) => replies,
            Err(err) => {
                error!("Error handling message on {}: {:?}", publish.topic, err);
                continue;
            }
        };
        for reply in replies {
            if let Err(err) = messenger.publish(&reply.topic, reply.payload).await {
                error!("Error publishing to {}: {:?}", reply.topic, err);
            }
        }
    }
}

pub async fn run(config: &AppConfig) -> anyhow::Result<()> {
    let settings = config.server();
    let registry = Registry::open(
        settings.registry_path(),
        settings.max_devices(),
        settings.ack_every(),
    )?;
    let mut server = Server::new(registry, TopicBuilder::new(config.mqtt.topic_path()));

    let (client, eventloop) = MqttClient::new(&config.mqtt, "beacon-server");
    for topic in server.subscriptions() {
        client.subscribe(&topic).await?;
    }

    // Polling stays in its own task so replies never wait on the loop that
    // drains their request channel.
    let (tx, mut inbound) = mpsc::unbounded_channel();
    let events = tokio::spawn({
        let client = client.clone();
        async move { client.forward(eventloop, tx).await }
    });
    info!("Registry server started. Waiting for device messages...");

    tokio::select! {
        _ = serve(&client, &mut inbound, &mut server) => {
            warn!("MQTT event loop stopped");
        }
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for shutdown signal")?;
            info!("Shutting down");
        }
    }

    client.shutdown(events).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use rumqttc::{Publish, QoS};

    use super::*;

    #[derive(Default)]
    struct RecordingMessenger {
        published: Mutex<Vec<Reply>>,
    }

    impl Messenger for RecordingMessenger {
        async fn publish(&self, topic: &str, payload: String) -> anyhow::Result<()> {
            self.published.lock().unwrap().push(Reply {
                topic: topic.to_string(),
                payload,
            });
            Ok(())
        }

        async fn subscribe(&self, _topic: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn unsubscribe(&self, _topic: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    const MAC: &str = "24:0A:C4:00:00:01";

    fn server() -> Server {
        Server::new(Registry::new(2, 3), TopicBuilder::new("esp32"))
    }

    #[test]
    fn test_registration_replies_with_ack_request_then_id() {
        let mut server = server();
        let replies = server
            .handle(&format!("esp32/register/{MAC}"), "Trying to connect to server")
            .unwrap();
        assert_eq!(
            replies,
            vec![
                Reply {
                    topic: format!("esp32/ack_request/{MAC}"),
                    payload: "ack_request".to_string(),
                },
                Reply {
                    topic: format!("esp32/id_response/{MAC}"),
                    payload: "1".to_string(),
                },
            ]
        );

        // Re-registration re-sends the same id.
        let replies = server.handle(&format!("esp32/register/{MAC}"), "").unwrap();
        assert_eq!(replies[1].payload, "1");
    }

    #[test]
    fn test_full_registry_ignores_new_devices() {
        let mut server = server();
        server.handle("esp32/register/AA:00:00:00:00:01", "").unwrap();
        server.handle("esp32/register/AA:00:00:00:00:02", "").unwrap();
        let replies = server.handle("esp32/register/AA:00:00:00:00:03", "").unwrap();
        assert!(replies.is_empty());
    }

    #[test]
    fn test_heartbeats_acked_every_third() {
        let mut server = server();
        server.handle(&format!("esp32/register/{MAC}"), "").unwrap();
        let acks: Vec<usize> = (0..6)
            .map(|_| server.handle("esp32/id/1", "Hello").unwrap().len())
            .collect();
        assert_eq!(acks, vec![0, 0, 1, 0, 0, 1]);
        assert_eq!(
            server.handle("esp32/id/1", "Hello").unwrap(),
            Vec::<Reply>::new()
        );
        // Heartbeats from ids the registry never assigned are not acked.
        for _ in 0..6 {
            assert!(server.handle("esp32/id/4", "Hello").unwrap().is_empty());
        }
    }

    #[test]
    fn test_invalid_heartbeat_id_is_dropped() {
        let mut server = server();
        assert!(server.handle("esp32/id/abc", "Hello").unwrap().is_empty());
        assert!(server.handle("esp32/ack/1", "ack").unwrap().is_empty());
    }

    #[test]
    fn test_subscriptions() {
        assert_eq!(
            server().subscriptions(),
            ["esp32/register/+".to_string(), "esp32/id/+".to_string()]
        );
    }

    #[tokio::test]
    async fn test_serve_answers_a_burst_of_registrations() {
        let mut server = Server::new(Registry::new(16, 3), TopicBuilder::new("esp32"));
        let messenger = RecordingMessenger::default();
        let (tx, mut inbound) = mpsc::unbounded_channel();

        // More replies than the MQTT request channel holds.
        for n in 1..=12 {
            let topic = format!("esp32/register/AA:00:00:00:00:{n:02X}");
            tx.send(Publish::new(topic, QoS::AtLeastOnce, "hello")).unwrap();
        }
        drop(tx);

        serve(&messenger, &mut inbound, &mut server).await;

        let published = messenger.published.lock().unwrap();
        assert_eq!(published.len(), 24);
        assert_eq!(published[22].topic, "esp32/ack_request/AA:00:00:00:00:0C");
        assert_eq!(published[23].payload, "12");
    }
}
