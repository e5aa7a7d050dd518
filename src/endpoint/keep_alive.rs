use std::time::{Duration, Instant};

/// Keep-alive contract tracker.
///
/// PINGREQ is due when `interval` elapses without outbound traffic; the
/// connection is declared dead when 1.5x `interval` elapses without inbound
/// traffic. An interval of zero disables both.
#[derive(Debug)]
pub(crate) struct KeepAlive {
    interval: Option<Duration>,
    last_outbound: Instant,
    last_inbound: Instant,
}

impl KeepAlive {
    pub fn disabled(now: Instant) -> Self {
        Self {
            interval: None,
            last_outbound: now,
            last_inbound: now,
        }
    }

    pub fn configure(&mut self, seconds: u16, now: Instant) {
        self.interval = (seconds > 0).then(|| Duration::from_secs(u64::from(seconds)));
        self.last_outbound = now;
        self.last_inbound = now;
    }

    pub fn on_send(&mut self, now: Instant) {
        self.last_outbound = now;
    }

    pub fn on_receive(&mut self, now: Instant) {
        self.last_inbound = now;
    }

    pub fn ping_deadline(&self) -> Option<Instant> {
        self.interval.map(|i| self.last_outbound + i)
    }

    pub fn dead_deadline(&self) -> Option<Instant> {
        self.interval.map(|i| self.last_inbound + i * 3 / 2)
    }
}
