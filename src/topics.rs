//! Topic layout of the handshake protocol.
//!
//! Every topic is `<prefix>/<role>/<subject>`, where the subject is either the
//! device hardware address (before an identity exists) or the assigned id.

use std::fmt;
use std::str::FromStr;

use mac_address::MacAddress;

/// Hardware-derived device name, rendered as uppercase colon-separated hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareId(MacAddress);

impl HardwareId {
    pub fn new(address: MacAddress) -> Self {
        HardwareId(address)
    }
}

impl fmt::Display for HardwareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0.bytes();
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Server-assigned device identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(DeviceId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Register,
    AckRequest,
    IdResponse,
    Ack,
    Heartbeat,
}

impl Role {
    const ALL: [Role; 5] = [
        Role::Register,
        Role::AckRequest,
        Role::IdResponse,
        Role::Ack,
        Role::Heartbeat,
    ];

    pub fn segment(self) -> &'static str {
        match self {
            Role::Register => "register",
            Role::AckRequest => "ack_request",
            Role::IdResponse => "id_response",
            Role::Ack => "ack",
            Role::Heartbeat => "id",
        }
    }

    fn from_segment(segment: &str) -> Option<Role> {
        Role::ALL.into_iter().find(|role| role.segment() == segment)
    }
}

#[derive(Debug, Clone)]
pub struct TopicBuilder {
    prefix: String,
}

impl TopicBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        TopicBuilder {
            prefix: prefix.into(),
        }
    }

    pub fn topic(&self, role: Role, subject: impl fmt::Display) -> String {
        format!("{}/{}/{}", self.prefix, role.segment(), subject)
    }

    /// Single-level wildcard filter matching every subject of `role`.
    pub fn wildcard(&self, role: Role) -> String {
        self.topic(role, "+")
    }

    pub fn register(&self, hwid: &HardwareId) -> String {
        self.topic(Role::Register, hwid)
    }

    pub fn ack_request(&self, hwid: &HardwareId) -> String {
        self.topic(Role::AckRequest, hwid)
    }

    pub fn id_response(&self, hwid: &HardwareId) -> String {
        self.topic(Role::IdResponse, hwid)
    }

    pub fn ack(&self, id: DeviceId) -> String {
        self.topic(Role::Ack, id)
    }

    pub fn heartbeat(&self, id: DeviceId) -> String {
        self.topic(Role::Heartbeat, id)
    }

    /// Split a concrete topic into its role and subject. Topics outside the
    /// prefix, with an unknown role or an empty subject yield `None`.
    pub fn parse<'t>(&self, topic: &'t str) -> Option<(Role, &'t str)> {
        let rest = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        let (segment, subject) = rest.split_once('/')?;
        if subject.is_empty() {
            return None;
        }
        Role::from_segment(segment).map(|role| (role, subject))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hwid() -> HardwareId {
        HardwareId::new(MacAddress::new([0x24, 0x0a, 0xc4, 0x01, 0xbe, 0xef]))
    }

    #[test]
    fn test_hardware_id_format() {
        assert_eq!(hwid().to_string(), "24:0A:C4:01:BE:EF");
    }

    #[test]
    fn test_topic_layout() {
        let topics = TopicBuilder::new("esp32");
        assert_eq!(topics.register(&hwid()), "esp32/register/24:0A:C4:01:BE:EF");
        assert_eq!(
            topics.ack_request(&hwid()),
            "esp32/ack_request/24:0A:C4:01:BE:EF"
        );
        assert_eq!(
            topics.id_response(&hwid()),
            "esp32/id_response/24:0A:C4:01:BE:EF"
        );
        assert_eq!(topics.ack(DeviceId(42)), "esp32/ack/42");
        assert_eq!(topics.heartbeat(DeviceId(42)), "esp32/id/42");
        assert_eq!(topics.wildcard(Role::Register), "esp32/register/+");
    }

    #[test]
    fn test_parse_distinguishes_ack_from_ack_request() {
        let topics = TopicBuilder::new("esp32");
        assert_eq!(
            topics.parse("esp32/ack_request/24:0A:C4:01:BE:EF"),
            Some((Role::AckRequest, "24:0A:C4:01:BE:EF"))
        );
        assert_eq!(topics.parse("esp32/ack/7"), Some((Role::Ack, "7")));
        assert_eq!(topics.parse("esp32/id/7"), Some((Role::Heartbeat, "7")));
        assert_eq!(topics.parse("other/ack/7"), None);
        assert_eq!(topics.parse("esp32x/ack/7"), None);
        assert_eq!(topics.parse("esp32/unknown/7"), None);
        assert_eq!(topics.parse("esp32/ack/"), None);
    }

    #[test]
    fn test_device_id_parsing() {
        assert_eq!(" 42\n".parse::<DeviceId>(), Ok(DeviceId(42)));
        assert!("abc".parse::<DeviceId>().is_err());
        assert!("-99".parse::<DeviceId>().is_err());
        assert!("".parse::<DeviceId>().is_err());
    }
}
