use std::time::{Duration, Instant};

use rand::Rng;

use super::fsm::Event;

/// Base connect-retry interval; the effective backoff grows linearly with
/// the retry count and is clamped at `CONNECT_RETRY_MAX`.
pub const CONNECT_RETRY_INT: u64 = 10;
pub const CONNECT_RETRY_MAX: u64 = 60;

/// Jittered interval in [0.75, 1.00] of the nominal value.
pub fn jitter(seconds: u64) -> u64 {
    let factor = 75 + rand::thread_rng().gen_range(0..26);
    seconds * factor / 100
}

/// Linear backoff, clamped.
pub fn connect_retry_backoff(retry_count: u32) -> u64 {
    (CONNECT_RETRY_INT * retry_count as u64).min(CONNECT_RETRY_MAX)
}

/// Deadline-based timers for one session incarnation. `None` means the
/// timer is disabled and can never fire; a negotiated hold time of zero
/// leaves both the hold and keepalive timers disabled for the session's
/// lifetime.
#[derive(Debug, Default)]
pub struct SessionTimers {
    pub connect_retry: Option<Instant>,
    pub hold: Option<Instant>,
    pub keepalive: Option<Instant>,
    /// Negotiated values, seconds.
    pub hold_interval: u64,
    pub keepalive_interval: u64,
    /// 3x the configured hold time, used while waiting for the peer's OPEN.
    pub large_hold_interval: u64,
}

impl SessionTimers {
    pub fn new(configured_hold: u16) -> Self {
        Self {
            large_hold_interval: configured_hold as u64 * 3,
            ..Default::default()
        }
    }

    /// Fix the negotiated hold time: min(local, remote), keepalive a third
    /// of it. Zero disables both timers.
    pub fn negotiate(&mut self, local_hold: u16, remote_hold: u16) {
        if remote_hold == 0 || local_hold == 0 {
            self.hold_interval = 0;
            self.keepalive_interval = 0;
            self.hold = None;
            self.keepalive = None;
            return;
        }
        self.hold_interval = local_hold.min(remote_hold) as u64;
        self.keepalive_interval = self.hold_interval / 3;
        self.restart_hold();
        self.restart_keepalive();
    }

    pub fn restart_hold(&mut self) {
        if self.hold_interval > 0 {
            self.hold = Some(Instant::now() + Duration::from_secs(jitter(self.hold_interval)));
        }
    }

    pub fn restart_large_hold(&mut self) {
        if self.large_hold_interval > 0 {
            self.hold =
                Some(Instant::now() + Duration::from_secs(jitter(self.large_hold_interval)));
        }
    }

    pub fn restart_keepalive(&mut self) {
        if self.keepalive_interval > 0 {
            self.keepalive =
                Some(Instant::now() + Duration::from_secs(jitter(self.keepalive_interval)));
        }
    }

    pub fn zero_all(&mut self) {
        self.connect_retry = None;
        self.hold = None;
        self.keepalive = None;
    }

    /// First expired timer, if any; keepalive is checked before hold so a
    /// stalled peer still receives our keepalives until the hold timer
    /// really runs out.
    pub fn expired(&self) -> Event {
        let now = Instant::now();
        if self.connect_retry.is_some_and(|t| t <= now) {
            return Event::ConnectRetryTimerExpires;
        }
        if self.keepalive.is_some_and(|t| t <= now) {
            return Event::KeepaliveTimerExpires;
        }
        if self.hold.is_some_and(|t| t <= now) {
            return Event::HoldTimerExpires;
        }
        Event::None
    }

    /// How long a blocking read may wait before the FSM must look at its
    /// timers again.
    pub fn read_timeout(&self) -> Duration {
        let default = Duration::from_secs(1);
        if self.keepalive_interval > 0 {
            Duration::from_secs(self.keepalive_interval).min(
                self.next_deadline()
                    .map(|d| d.saturating_duration_since(Instant::now()))
                    .unwrap_or(default)
                    .max(Duration::from_millis(100)),
            )
        } else {
            default
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [self.connect_retry, self.keepalive, self.hold]
            .into_iter()
            .flatten()
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_band() {
        for _ in 0..100 {
            let value = jitter(100);
            assert!((75..=100).contains(&value));
        }
    }

    #[test]
    fn backoff_is_linear_then_clamped() {
        assert_eq!(connect_retry_backoff(0), 0);
        assert_eq!(connect_retry_backoff(2), 20);
        assert_eq!(connect_retry_backoff(6), 60);
        assert_eq!(connect_retry_backoff(1000), CONNECT_RETRY_MAX);
    }

    #[test]
    fn hold_time_zero_disables_timers() {
        let mut timers = SessionTimers::new(180);
        timers.negotiate(180, 0);
        assert!(timers.hold.is_none());
        assert!(timers.keepalive.is_none());
        assert_eq!(timers.expired(), Event::None);
    }

    #[test]
    fn negotiated_hold_is_minimum() {
        let mut timers = SessionTimers::new(180);
        timers.negotiate(180, 90);
        assert_eq!(timers.hold_interval, 90);
        assert_eq!(timers.keepalive_interval, 30);
        assert!(timers.hold.is_some());
        assert!(timers.keepalive.is_some());
    }
}
