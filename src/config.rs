use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, bail};
use mac_address::MacAddress;
use serde_derive::Deserialize;

const MAX_INTERVAL_SECONDS: f64 = 3600.0;
const MAX_STALENESS_MULTIPLIER: f64 = 1000.0;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub device: Option<DeviceConfig>,
    pub server: Option<ServerConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    pub reconnect_delay_millis: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct DeviceConfig {
    /// Overrides the address read from the network interface.
    pub hardware_address: Option<MacAddress>,
    pub interval_min_seconds: Option<f64>,
    pub interval_max_seconds: Option<f64>,
    pub staleness_multiplier: Option<f64>,
    pub recovery_threshold: Option<u32>,
    /// Consecutive WaitingForId timeouts before falling back to discovery.
    /// Unset means wait forever.
    pub id_wait_limit: Option<u32>,
    pub announce_message: Option<String>,
    pub blink_millis: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ServerConfig {
    pub max_devices: Option<usize>,
    pub ack_every: Option<u64>,
    pub registry_path: Option<String>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: AppConfig = toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let device = self.device();
        let (low, high) = device.interval_range();
        if !(low.is_finite() && high.is_finite() && low > 0.0 && low < high) {
            bail!("device interval range [{low}, {high}) must be positive, finite and non-empty");
        }
        if high > MAX_INTERVAL_SECONDS {
            bail!("device.interval_max_seconds must not exceed {MAX_INTERVAL_SECONDS}");
        }
        let multiplier = device.staleness_multiplier();
        if !(multiplier.is_finite() && multiplier > 0.0 && multiplier <= MAX_STALENESS_MULTIPLIER) {
            bail!("device.staleness_multiplier must be in (0, {MAX_STALENESS_MULTIPLIER}]");
        }
        if device.recovery_threshold() == 0 {
            bail!("device.recovery_threshold must be at least 1");
        }
        if device.id_wait_limit == Some(0) {
            bail!("device.id_wait_limit must be at least 1 when set");
        }
        if self.server().ack_every() == 0 {
            bail!("server.ack_every must be at least 1");
        }
        Ok(())
    }

    pub fn device(&self) -> DeviceConfig {
        self.device.clone().unwrap_or_default()
    }

    pub fn server(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }
}

impl MqttConfig {
    pub fn topic_path(&self) -> String {
        self.topic_path.clone().unwrap_or("esp32".to_string())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_millis.unwrap_or(1000))
    }
}

impl DeviceConfig {
    pub fn interval_range(&self) -> (f64, f64) {
        (
            self.interval_min_seconds.unwrap_or(2.0),
            self.interval_max_seconds.unwrap_or(5.0),
        )
    }

    pub fn staleness_multiplier(&self) -> f64 {
        self.staleness_multiplier.unwrap_or(4.0)
    }

    pub fn recovery_threshold(&self) -> u32 {
        self.recovery_threshold.unwrap_or(1)
    }

    pub fn announce_message(&self) -> String {
        self.announce_message
            .clone()
            .unwrap_or("Trying to connect to server".to_string())
    }

    pub fn blink(&self) -> Duration {
        Duration::from_millis(self.blink_millis.unwrap_or(200))
    }
}

impl ServerConfig {
    pub fn max_devices(&self) -> usize {
        self.max_devices.unwrap_or(4)
    }

    pub fn ack_every(&self) -> u64 {
        self.ack_every.unwrap_or(3)
    }

    pub fn registry_path(&self) -> String {
        self.registry_path
            .clone()
            .unwrap_or("device_registry.json".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config() {
        let config_str = r#"
            [mqtt]
            host = "localhost"
            port = 1883
            username = "user"
            password = "pass"

            [device]
            hardware_address = "24:0A:C4:12:34:56"
            interval_min_seconds = 1.5
            recovery_threshold = 3

            [server]
            max_devices = 8
        "#;
        let config: AppConfig = toml::de::from_str(config_str).unwrap();
        assert!(config.mqtt.host == "localhost");
        assert_eq!(config.mqtt.topic_path(), "esp32");
        assert!(config.validate().is_ok());

        let device = config.device();
        assert_eq!(device.interval_range(), (1.5, 5.0));
        assert_eq!(device.recovery_threshold(), 3);
        assert_eq!(device.staleness_multiplier(), 4.0);
        assert_eq!(
            device.hardware_address.map(|mac| mac.bytes()),
            Some([0x24, 0x0A, 0xC4, 0x12, 0x34, 0x56])
        );
        assert_eq!(config.server().max_devices(), 8);
        assert_eq!(config.server().ack_every(), 3);
    }

    #[test]
    fn test_defaults_without_optional_sections() {
        let config: AppConfig = toml::de::from_str("[mqtt]\nhost = \"broker\"").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.device().interval_range(), (2.0, 5.0));
        assert_eq!(config.device().id_wait_limit, None);
        assert_eq!(config.server().registry_path(), "device_registry.json");
    }

    #[test]
    fn test_rejects_inverted_interval() {
        let config_str = r#"
            [mqtt]
            host = "localhost"

            [device]
            interval_min_seconds = 5.0
            interval_max_seconds = 2.0
        "#;
        let config: AppConfig = toml::de::from_str(config_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_recovery_threshold() {
        let config_str = r#"
            [mqtt]
            host = "localhost"

            [device]
            recovery_threshold = 0
        "#;
        let config: AppConfig = toml::de::from_str(config_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_non_finite_timing() {
        for device in [
            "interval_min_seconds = nan",
            "interval_max_seconds = inf",
            "interval_min_seconds = -inf",
            "staleness_multiplier = nan",
            "staleness_multiplier = inf",
        ] {
            let config_str = format!("[mqtt]\nhost = \"localhost\"\n[device]\n{device}\n");
            let config: AppConfig = toml::de::from_str(&config_str).unwrap();
            assert!(config.validate().is_err(), "accepted {device}");
        }
    }

    #[test]
    fn test_rejects_out_of_range_timing() {
        let config_str = r#"
            [mqtt]
            host = "localhost"

            [device]
            interval_max_seconds = 1e300
        "#;
        let config: AppConfig = toml::de::from_str(config_str).unwrap();
        assert!(config.validate().is_err());

        let config_str = r#"
            [mqtt]
            host = "localhost"

            [device]
            staleness_multiplier = 1e300
        "#;
        let config: AppConfig = toml::de::from_str(config_str).unwrap();
        assert!(config.validate().is_err());
    }
}
