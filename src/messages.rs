use std::fmt;
use std::ops::BitOr;

/// Set of edge-triggered protocol events raised by inbound bus messages.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct EventFlags(u8);

impl EventFlags {
    /// The server asked the device to wait for an identity.
    pub const ACK_REQUESTED: EventFlags = EventFlags(1 << 0);
    /// An id-response arrived; the payload is held by the signal.
    pub const ID_RECEIVED: EventFlags = EventFlags(1 << 1);
    /// The server acknowledged a heartbeat.
    pub const ACK_RECEIVED: EventFlags = EventFlags(1 << 2);

    const NAMES: [(EventFlags, &'static str); 3] = [
        (EventFlags::ACK_REQUESTED, "AckRequested"),
        (EventFlags::ID_RECEIVED, "IdReceived"),
        (EventFlags::ACK_RECEIVED, "AckReceived"),
    ];

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: EventFlags) -> bool {
        !other.is_empty() && self.0 & other.0 == other.0
    }

    pub fn intersection(self, other: EventFlags) -> EventFlags {
        EventFlags(self.0 & other.0)
    }

    pub fn remove(&mut self, other: EventFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for EventFlags {
    type Output = EventFlags;

    fn bitor(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(
                Self::NAMES
                    .iter()
                    .filter(|(flag, _)| self.contains(*flag))
                    .map(|(_, name)| name),
            )
            .finish()
    }
}
