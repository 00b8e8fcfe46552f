use anyhow::Context as _;
use log::debug;
use mac_address::MacAddress;
use rand::Rng as _;
use tokio::time::Instant;

use crate::indicator::IndicatorState;

/// Pub/sub transport. Delivery is at-least-once; reconnecting and restoring
/// subscriptions is the implementation's job.
pub trait Messenger {
    async fn publish(&self, topic: &str, payload: String) -> anyhow::Result<()>;
    async fn subscribe(&self, topic: &str) -> anyhow::Result<()>;
    async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()>;
}

pub trait Clock {
    fn now(&self) -> Instant;
}

pub trait Indicator {
    async fn show(&mut self, state: IndicatorState);
}

pub trait RandomSource {
    /// Uniform sample from `[low, high)`.
    fn uniform(&mut self, low: f64, high: f64) -> f64;
}

pub trait IdentitySource {
    fn hardware_address(&self) -> anyhow::Result<MacAddress>;
}

/// Tokio's clock, so paused test time applies to the state machine too.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn uniform(&mut self, low: f64, high: f64) -> f64 {
        rand::thread_rng().gen_range(low..high)
    }
}

/// Reads the address of the first network interface unless one is configured.
#[derive(Debug, Default)]
pub struct SystemIdentity {
    pub configured: Option<MacAddress>,
}

impl IdentitySource for SystemIdentity {
    fn hardware_address(&self) -> anyhow::Result<MacAddress> {
        if let Some(address) = self.configured {
            debug!("Using configured hardware address {}", address);
            return Ok(address);
        }
        mac_address::get_mac_address()
            .context("reading hardware address")?
            .context("no network interface with a hardware address")
    }
}
