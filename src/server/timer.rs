use std::time::{Duration, Instant, SystemTime};
use tracing::*;

/// A single shot timer polled from the connection loop
#[derive(Debug, Default, Clone, Copy)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    /// Start unless already running
    pub fn start_if_idle(&mut self, after: Duration) {
        if self.deadline.is_none() {
            self.start(after);
        }
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_started(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Resolves at the deadline, never if the timer is stopped
    ///
    /// The timer is not reset, callers [`stop`](Self::stop) it when handling
    /// the expiry.
    pub async fn fire(deadline: Option<Instant>) {
        match deadline {
            Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
            None => futures::future::pending().await,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Timeouts below this are raised while a client is still authenticating
pub const MIN_HANDSHAKE_IDLE: Duration = Duration::from_secs(15);
/// A check later than this means the wall clock jumped
const MAX_LATENESS: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleVerdict {
    Disabled,
    /// Check again after this long
    Remaining(Duration),
    Expired,
}

/// Tracks the last client activity against the wall clock
#[derive(Debug, Clone, Copy)]
pub struct IdleTracker {
    last_event: SystemTime,
}

impl IdleTracker {
    pub fn new(now: SystemTime) -> Self {
        Self { last_event: now }
    }

    pub fn touch(&mut self, now: SystemTime) {
        self.last_event = now;
    }

    pub fn last_event(&self) -> SystemTime {
        self.last_event
    }

    pub fn check(&mut self, now: SystemTime, timeout: Duration, normal: bool) -> IdleVerdict {
        if timeout.is_zero() {
            return IdleVerdict::Disabled;
        }
        let timeout = if normal {
            timeout
        } else {
            timeout.max(MIN_HANDSHAKE_IDLE)
        };

        let Ok(elapsed) = now.duration_since(self.last_event) else {
            info!("Time has gone backwards - resetting idle timeout");
            self.last_event = now;
            return IdleVerdict::Remaining(timeout);
        };

        if elapsed > timeout + MAX_LATENESS {
            info!("Time has gone forwards - resetting idle timeout");
            self.last_event = now;
            return IdleVerdict::Remaining(timeout);
        }
        if elapsed >= timeout {
            return IdleVerdict::Expired;
        }
        IdleVerdict::Remaining(timeout - elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn idle_expiry() {
        let t0 = SystemTime::UNIX_EPOCH + secs(1_000_000);
        let mut idle = IdleTracker::new(t0);
        assert_eq!(idle.check(t0, Duration::ZERO, true), IdleVerdict::Disabled);
        assert_eq!(idle.check(t0 + secs(4), secs(10), true), IdleVerdict::Remaining(secs(6)));
        assert_eq!(idle.check(t0 + secs(10), secs(10), true), IdleVerdict::Expired);
        // still authenticating: at least 15 seconds
        assert_eq!(idle.check(t0 + secs(10), secs(10), false), IdleVerdict::Remaining(secs(5)));
        idle.touch(t0 + secs(10));
        assert_eq!(idle.check(t0 + secs(12), secs(10), true), IdleVerdict::Remaining(secs(8)));
    }

    #[test]
    fn clock_jumps_reset_the_reference() {
        let t0 = SystemTime::UNIX_EPOCH + secs(1_000_000);
        let mut idle = IdleTracker::new(t0);
        assert_eq!(idle.check(t0 - secs(30), secs(10), true), IdleVerdict::Remaining(secs(10)));
        assert_eq!(idle.last_event(), t0 - secs(30));

        let mut idle = IdleTracker::new(t0);
        // exactly one minute late still expires
        assert_eq!(idle.check(t0 + secs(70), secs(10), true), IdleVerdict::Expired);
        assert_eq!(idle.check(t0 + secs(71), secs(10), true), IdleVerdict::Remaining(secs(10)));
        assert_eq!(idle.last_event(), t0 + secs(71));
    }

    #[tokio::test]
    async fn stopped_timer_never_fires() {
        let mut timer = Timer::new();
        assert!(!timer.is_started());
        let pending = tokio::time::timeout(Duration::from_millis(20), Timer::fire(timer.deadline()));
        assert!(pending.await.is_err());

        timer.start(Duration::from_millis(5));
        Timer::fire(timer.deadline()).await;
        assert_eq!(timer.remaining(), Some(Duration::ZERO));
        timer.stop();
        assert!(timer.deadline().is_none());
    }
}
