//! Device-identity state machine: Discovery, WaitingForId and Active.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::time::Instant;

use crate::indicator::IndicatorState;
use crate::messages::EventFlags;
use crate::ports::{Clock, Indicator, Messenger, RandomSource};
use crate::signal::EventSignal;
use crate::topics::{DeviceId, HardwareId, TopicBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Discovery,
    WaitingForId,
    Active,
}

/// Tunables of the handshake and recovery policy.
#[derive(Debug, Clone)]
pub struct MachineSettings {
    pub interval_range: (f64, f64),
    pub staleness_multiplier: f64,
    pub recovery_threshold: u32,
    pub id_wait_limit: Option<u32>,
    pub announce_message: String,
}

impl Default for MachineSettings {
    fn default() -> Self {
        MachineSettings {
            interval_range: (2.0, 5.0),
            staleness_multiplier: 4.0,
            recovery_threshold: 1,
            id_wait_limit: None,
            announce_message: "Trying to connect to server".to_string(),
        }
    }
}

impl From<&crate::config::DeviceConfig> for MachineSettings {
    fn from(config: &crate::config::DeviceConfig) -> Self {
        MachineSettings {
            interval_range: config.interval_range(),
            staleness_multiplier: config.staleness_multiplier(),
            recovery_threshold: config.recovery_threshold(),
            id_wait_limit: config.id_wait_limit,
            announce_message: config.announce_message(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveSession {
    id: DeviceId,
    last_ack: Instant,
    missed_acks: u32,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Discovery,
    WaitingForId { timeouts: u32 },
    Active(ActiveSession),
}

pub struct StateMachine<M, I, C> {
    messenger: M,
    indicator: I,
    clock: C,
    signal: Arc<EventSignal>,
    topics: TopicBuilder,
    hwid: HardwareId,
    settings: MachineSettings,
    interval: Duration,
    phase: Phase,
    messages_sent: u64,
}

impl<M, I, C> StateMachine<M, I, C>
where
    M: Messenger,
    I: Indicator,
    C: Clock,
{
    /// Build a machine in Discovery. The publish interval is drawn from
    /// `random` here and stays fixed for the whole session.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        messenger: M,
        indicator: I,
        clock: C,
        random: &mut impl RandomSource,
        signal: Arc<EventSignal>,
        topics: TopicBuilder,
        hwid: HardwareId,
        settings: MachineSettings,
    ) -> Self {
        let (low, high) = settings.interval_range;
        let interval = Duration::from_secs_f64(random.uniform(low, high));
        info!("Publish interval for this session: {:.3}s", interval.as_secs_f64());

        StateMachine {
            messenger,
            indicator,
            clock,
            signal,
            topics,
            hwid,
            settings,
            interval,
            phase: Phase::Discovery,
            messages_sent: 0,
        }
    }

    pub fn state(&self) -> DeviceState {
        match self.phase {
            Phase::Discovery => DeviceState::Discovery,
            Phase::WaitingForId { .. } => DeviceState::WaitingForId,
            Phase::Active(_) => DeviceState::Active,
        }
    }

    /// The assigned identity; only present while Active.
    pub fn identity(&self) -> Option<DeviceId> {
        match self.phase {
            Phase::Active(session) => Some(session.id),
            _ => None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    #[cfg(test)]
    pub fn missed_acks(&self) -> Option<u32> {
        match self.phase {
            Phase::Active(session) => Some(session.missed_acks),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn last_ack(&self) -> Option<Instant> {
        match self.phase {
            Phase::Active(session) => Some(session.last_ack),
            _ => None,
        }
    }

    /// Subscribe to the hardware-scoped handshake topics.
    pub async fn start(&self) {
        for topic in [
            self.topics.ack_request(&self.hwid),
            self.topics.id_response(&self.hwid),
        ] {
            match self.messenger.subscribe(&topic).await {
                Ok(()) => info!("Subscribed to {}", topic),
                Err(err) => error!("Error subscribing to {}: {:?}", topic, err),
            }
        }
    }

    pub async fn run(&mut self) {
        self.start().await;
        loop {
            self.step().await;
        }
    }

    /// Run one iteration. Returns the new state if a transition happened.
    pub async fn step(&mut self) -> Option<DeviceState> {
        let before = self.state();
        match self.phase {
            Phase::Discovery => self.discover().await,
            Phase::WaitingForId { timeouts } => self.wait_for_id(timeouts).await,
            Phase::Active(session) => self.heartbeat(session).await,
        }
        let after = self.state();
        (after != before).then_some(after)
    }

    async fn publish(&self, topic: &str, payload: String) {
        if let Err(err) = self.messenger.publish(topic, payload).await {
            error!("Error publishing to {}: {:?}", topic, err);
        }
    }

    async fn discover(&mut self) {
        let topic = self.topics.register(&self.hwid);
        warn!("[DISCOVERY] Publishing: {} -> {}", topic, self.settings.announce_message);
        self.publish(&topic, self.settings.announce_message.clone())
            .await;
        self.indicator.show(IndicatorState::Discovering).await;

        let fired = self
            .signal
            .wait_any(EventFlags::ACK_REQUESTED, self.interval)
            .await;
        if fired.contains(EventFlags::ACK_REQUESTED) {
            info!("[DISCOVERY] Received ack_request from server");
            self.phase = Phase::WaitingForId { timeouts: 0 };
        }
    }

    async fn wait_for_id(&mut self, timeouts: u32) {
        info!("[WAITING] Waiting for an identity");
        self.indicator.show(IndicatorState::Waiting).await;

        let fired = self
            .signal
            .wait_any(EventFlags::ID_RECEIVED, self.interval)
            .await;
        if fired.contains(EventFlags::ID_RECEIVED) {
            let payload = self.signal.take_id_payload().unwrap_or_default();
            match payload.parse::<DeviceId>() {
                Ok(id) => {
                    self.assign(id).await;
                    return;
                }
                Err(err) => warn!("[WAITING] Rejecting id response {:?}: {}", payload, err),
            }
        }

        let timeouts = timeouts + 1;
        match self.settings.id_wait_limit {
            Some(limit) if timeouts >= limit => {
                warn!("[WAITING] No identity after {} attempts, restarting discovery", timeouts);
                self.phase = Phase::Discovery;
            }
            _ => self.phase = Phase::WaitingForId { timeouts },
        }
    }

    async fn assign(&mut self, id: DeviceId) {
        let ack_topic = self.topics.ack(id);
        if let Err(err) = self.messenger.subscribe(&ack_topic).await {
            error!("Error subscribing to {}: {:?}", ack_topic, err);
        }
        info!("[WAITING] Received ID from server: {}", id);
        self.phase = Phase::Active(ActiveSession {
            id,
            last_ack: self.clock.now(),
            missed_acks: 0,
        });
    }

    async fn heartbeat(&mut self, mut session: ActiveSession) {
        let started = self.clock.now();
        let topic = self.topics.heartbeat(session.id);
        let message = format!("Hello server! I am device {}", session.id);

        info!("[ACTIVE] Publishing: {} -> {}", topic, message);
        self.publish(&topic, message).await;
        self.indicator.show(IndicatorState::Active).await;
        self.messages_sent += 1;

        if self.signal.peek_and_clear(EventFlags::ACK_RECEIVED) {
            session.last_ack = self.clock.now();
            session.missed_acks = 0;
            info!("[ACTIVE] Received ACK from server");
        }

        let elapsed = self.clock.now().duration_since(session.last_ack);
        let staleness = self.interval.mul_f64(self.settings.staleness_multiplier);
        if elapsed > staleness {
            session.missed_acks += 1;
            warn!(
                "[ACTIVE] ACK timeout after {:?}. Missed count: {}",
                elapsed, session.missed_acks
            );
            if session.missed_acks >= self.settings.recovery_threshold {
                self.recover(session).await;
                return;
            }
        }
        self.phase = Phase::Active(session);

        debug!(
            "[ACTIVE] {} heartbeat(s) sent, sleeping until next interval",
            self.messages_sent
        );
        tokio::time::sleep_until(started + self.interval).await;
    }

    async fn recover(&mut self, session: ActiveSession) {
        error!("[RECOVERY] Lost connection. Returning to discovery mode.");
        let ack_topic = self.topics.ack(session.id);
        if let Err(err) = self.messenger.unsubscribe(&ack_topic).await {
            error!("Error unsubscribing from {}: {:?}", ack_topic, err);
        }
        self.signal
            .clear(EventFlags::ACK_RECEIVED | EventFlags::ACK_REQUESTED | EventFlags::ID_RECEIVED);
        self.phase = Phase::Discovery;
    }
}
