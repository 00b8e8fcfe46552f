use std::sync::Arc;

use anyhow::Context as _;
use log::info;

use crate::config::AppConfig;
use crate::indicator::LogIndicator;
use crate::machine::{MachineSettings, StateMachine};
use crate::mqtt::MqttClient;
use crate::ports::{IdentitySource as _, SystemIdentity, ThreadRandom, TokioClock};
use crate::signal::EventSignal;
use crate::topics::{HardwareId, TopicBuilder};

/// Runs the device side: the MQTT event loop feeding the event signal, and
/// the state machine consuming it.
pub struct Manager {
    machine: StateMachine<MqttClient, LogIndicator, TokioClock>,
    mqtt_client: MqttClient,
    mqtt_event_loop: rumqttc::EventLoop,
    signal: Arc<EventSignal>,
    topics: TopicBuilder,
}

impl Manager {
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let device = config.device();
        let identity = SystemIdentity {
            configured: device.hardware_address,
        };
        let hwid = HardwareId::new(identity.hardware_address()?);
        info!("Device hardware id: {}", hwid);

        let (mqtt_client, mqtt_event_loop) =
            MqttClient::new(&config.mqtt, &format!("beacon-{}", hwid).replace(':', ""));
        let signal = Arc::new(EventSignal::new());
        let topics = TopicBuilder::new(config.mqtt.topic_path());

        let machine = StateMachine::new(
            mqtt_client.clone(),
            LogIndicator::new(device.blink()),
            TokioClock,
            &mut ThreadRandom,
            signal.clone(),
            topics.clone(),
            hwid,
            MachineSettings::from(&device),
        );

        Ok(Manager {
            machine,
            mqtt_client,
            mqtt_event_loop,
            signal,
            topics,
        })
    }

    pub async fn run_loop(mut self) -> anyhow::Result<()> {
        let client = self.mqtt_client.clone();
        let signal = self.signal.clone();
        let topics = self.topics.clone();
        let mut eventloop = self.mqtt_event_loop;

        // Message-arrival context: only classifies and raises flags.
        let events = tokio::task::spawn(async move {
            client.event_loop(&mut eventloop, &topics, &signal).await;
        });

        tokio::select! {
            _ = self.machine.run() => {}
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for shutdown signal")?;
                info!("Shutting down");
            }
        }

        self.mqtt_client.shutdown(events).await;
        info!(
            "Exiting device loop in state {:?} (identity {:?}, {} heartbeat(s) every {:?})",
            self.machine.state(),
            self.machine.identity(),
            self.machine.messages_sent(),
            self.machine.interval()
        );

        Ok(())
    }
}
