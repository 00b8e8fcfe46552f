//! Event flags raised by the MQTT event loop and consumed by the control loop.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::messages::EventFlags;

#[derive(Default)]
struct Pending {
    flags: EventFlags,
    id_payload: Option<String>,
}

#[derive(Default)]
pub struct EventSignal {
    pending: Mutex<Pending>,
    notify: Notify,
}

impl EventSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        // Pending is plain data, a panic elsewhere cannot leave it half-written.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, flags: EventFlags) {
        {
            let mut pending = self.lock();
            pending.flags = pending.flags | flags;
        }
        self.notify.notify_waiters();
    }

    /// Raise `ID_RECEIVED` and keep `payload` for the consumer. A newer
    /// response replaces an unconsumed older one.
    pub fn set_id_response(&self, payload: String) {
        {
            let mut pending = self.lock();
            pending.id_payload = Some(payload);
            pending.flags = pending.flags | EventFlags::ID_RECEIVED;
        }
        self.notify.notify_waiters();
    }

    pub fn take_id_payload(&self) -> Option<String> {
        self.lock().id_payload.take()
    }

    /// Atomically clear and return whichever of `wanted` are currently set.
    fn take(&self, wanted: EventFlags) -> EventFlags {
        let mut pending = self.lock();
        let fired = pending.flags.intersection(wanted);
        pending.flags.remove(fired);
        fired
    }

    /// Wait until any flag in `wanted` is set or `timeout` elapses. Every
    /// requested flag that was set is cleared and returned; an empty set means
    /// the wait timed out.
    pub async fn wait_any(&self, wanted: EventFlags, timeout: Duration) -> EventFlags {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before looking, so a set() in between still wakes us.
            notified.as_mut().enable();

            let fired = self.take(wanted);
            if !fired.is_empty() {
                return fired;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.take(wanted);
            }
        }
    }

    pub fn peek_and_clear(&self, flag: EventFlags) -> bool {
        !self.take(flag).is_empty()
    }

    /// Drop stale edges without acting on them.
    pub fn clear(&self, flags: EventFlags) {
        let mut pending = self.lock();
        pending.flags.remove(flags);
        if flags.contains(EventFlags::ID_RECEIVED) {
            pending.id_payload = None;
        }
    }
}
