use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config;
use crate::messages::EventFlags;
use crate::ports::Messenger;
use crate::signal::EventSignal;
use crate::topics::{Role, TopicBuilder};

const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    // Restored on every ConnAck, the broker forgets them across clean sessions.
    subscriptions: Arc<Mutex<Vec<String>>>,
    reconnect_delay: Duration,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig, default_id: &str) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or(default_id.to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id,
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                subscriptions: Arc::new(Mutex::new(Vec::new())),
                reconnect_delay: config.reconnect_delay(),
            },
            eventloop,
        )
    }

    fn tracked(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn restore_subscriptions(&self) -> Result<(), rumqttc::ClientError> {
        let filters: Vec<SubscribeFilter> = self
            .tracked()
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtLeastOnce))
            .collect();
        if filters.is_empty() {
            return Ok(());
        }
        debug!("Restoring {} subscription(s)", filters.len());
        self.client.subscribe_many(filters).await
    }

    /// Drive the connection until the next inbound publish. Connection errors
    /// are logged and retried after the configured delay. Returns `None` once
    /// our DISCONNECT has been written to the broker.
    pub async fn next_publish(
        &self,
        eventloop: &mut rumqttc::EventLoop,
    ) -> Option<rumqttc::Publish> {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);
                        return Some(p);
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        info!("Connected to MQTT broker");
                        if let Err(err) = self.restore_subscriptions().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    rumqttc::Event::Outgoing(rumqttc::Outgoing::Disconnect) => {
                        debug!("Disconnect sent to MQTT broker");
                        return None;
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        }
    }

    /// Message-arrival context of the device: classify every inbound message
    /// and raise the matching flag.
    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        topics: &TopicBuilder,
        signal: &EventSignal,
    ) {
        while let Some(publish) = self.next_publish(eventloop).await {
            route_incoming(topics, signal, &publish.topic, &publish.payload);
        }
    }

    /// Poll the connection and hand every inbound publish to `tx`. The
    /// receiver may publish freely; this task keeps draining the request
    /// channel meanwhile.
    pub async fn forward(
        &self,
        mut eventloop: rumqttc::EventLoop,
        tx: mpsc::UnboundedSender<rumqttc::Publish>,
    ) {
        while let Some(publish) = self.next_publish(&mut eventloop).await {
            if tx.send(publish).is_err() {
                debug!("Inbound receiver closed");
                break;
            }
        }
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }

    /// Queue a DISCONNECT and give the event loop task time to write it
    /// before tearing the task down.
    pub async fn shutdown(&self, mut events: JoinHandle<()>) {
        if let Err(err) = self.disconnect().await {
            error!("Error disconnecting from MQTT broker: {:?}", err);
            events.abort();
            return;
        }
        if tokio::time::timeout(DISCONNECT_GRACE, &mut events)
            .await
            .is_err()
        {
            warn!("MQTT event loop did not flush the disconnect in time");
            events.abort();
        }
    }
}

impl Messenger for MqttClient {
    async fn publish(&self, topic: &str, payload: String) -> anyhow::Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> anyhow::Result<()> {
        {
            let mut tracked = self.tracked();
            if !tracked.iter().any(|t| t == topic) {
                tracked.push(topic.to_string());
            }
        }
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()> {
        self.tracked().retain(|t| t != topic);
        self.client.unsubscribe(topic).await?;
        Ok(())
    }
}

/// Map an inbound device-side message onto the event flags. Never blocks.
pub fn route_incoming(topics: &TopicBuilder, signal: &EventSignal, topic: &str, payload: &[u8]) {
    match topics.parse(topic) {
        Some((Role::AckRequest, _)) => signal.set(EventFlags::ACK_REQUESTED),
        Some((Role::IdResponse, _)) => {
            signal.set_id_response(String::from_utf8_lossy(payload).into_owned())
        }
        Some((Role::Ack, _)) => signal.set(EventFlags::ACK_RECEIVED),
        _ => debug!("Ignoring message on topic {}", topic),
    }
}
