//! Delay based congestion window.
//!
//! Every data update is bracketed by two round trip probes (see
//! [`Fence::ping`](super::fence::Fence::ping)). A probe remembers the output
//! position at the time it was queued; its answer tells how far the client
//! has gotten. Bytes queued after the last answered probe are in flight.
//! The window of bytes allowed in flight grows while answers come back close
//! to the lowest round trip seen and shrinks once they queue up.

use crate::config::CongestionPolicy;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Ping {
    sent_at: Instant,
    position: u64,
}

/// Outcome of [`Congestion::check`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Clear,
    /// Retry after `eta`, or once the next probe answer arrives if `None`
    Congested { eta: Option<Duration> },
}

impl Verdict {
    pub fn is_congested(&self) -> bool {
        matches!(self, Verdict::Congested { .. })
    }
}

#[derive(Debug)]
pub struct Congestion {
    policy: CongestionPolicy,
    last_position: u64,
    acked_position: u64,
    pings: VecDeque<Ping>,
    base_rtt: Option<Duration>,
    smoothed_rtt: Option<Duration>,
    last_rtt: Option<Duration>,
    window: usize,
    last_adjust: Option<Instant>,
}

impl Congestion {
    pub fn new(policy: CongestionPolicy) -> Self {
        Self {
            policy,
            last_position: 0,
            acked_position: 0,
            pings: VecDeque::new(),
            base_rtt: None,
            smoothed_rtt: None,
            last_rtt: None,
            window: policy
                .initial_window
                .clamp(policy.minimum_window, policy.maximum_window),
            last_adjust: None,
        }
    }

    /// Total number of bytes queued on the stream so far
    pub fn update_position(&mut self, position: u64) {
        self.last_position = position;
    }

    pub fn sent_ping(&mut self, now: Instant) {
        self.pings.push_back(Ping {
            sent_at: now,
            position: self.last_position,
        });
    }

    pub fn got_pong(&mut self, now: Instant) {
        let Some(ping) = self.pings.pop_front() else {
            return;
        };
        let rtt = now.saturating_duration_since(ping.sent_at);
        self.acked_position = ping.position;
        self.last_rtt = Some(rtt);
        self.base_rtt = Some(self.base_rtt.map_or(rtt, |base| base.min(rtt)));

        let smoothed = match self.smoothed_rtt {
            None => rtt,
            Some(srtt) => {
                let srtt_us = srtt.as_micros() as i64;
                let diff = rtt.as_micros() as i64 - srtt_us;
                let next = srtt_us + (diff >> self.policy.smoothing_shift);
                Duration::from_micros(next.max(0) as u64)
            }
        };
        self.smoothed_rtt = Some(smoothed);

        let due = self
            .last_adjust
            .map_or(true, |at| now.saturating_duration_since(at) >= self.policy.minimum_sample);
        if due {
            self.adjust_window();
            self.last_adjust = Some(now);
        }
    }

    fn adjust_window(&mut self) {
        let (Some(base), Some(srtt)) = (self.base_rtt, self.smoothed_rtt) else {
            return;
        };
        let delay = srtt.saturating_sub(base);
        let step = (self.window >> self.policy.smoothing_shift).max(1);
        if delay <= base / 8 {
            self.window = self.window.saturating_add(step);
        } else if delay > base / 2 {
            self.window = self.window.saturating_sub(step);
        }
        self.window = self
            .window
            .clamp(self.policy.minimum_window, self.policy.maximum_window);
    }

    /// Bytes queued after the last answered probe
    pub fn in_flight(&self) -> u64 {
        if self.pings.is_empty() {
            return 0;
        }
        self.last_position.saturating_sub(self.acked_position)
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn is_congested(&self) -> bool {
        self.in_flight() >= self.window as u64
    }

    fn rtt_estimate(&self) -> Duration {
        self.smoothed_rtt.unwrap_or(self.policy.initial_rtt)
    }

    /// How long until enough probes should be back to leave congestion
    pub fn uncongested_eta(&self, now: Instant) -> Option<Duration> {
        if !self.is_congested() {
            return Some(Duration::ZERO);
        }
        let rtt = self.rtt_estimate();
        self.pings
            .iter()
            .find(|ping| self.last_position.saturating_sub(ping.position) < self.window as u64)
            .map(|ping| {
                (ping.sent_at + rtt)
                    .saturating_duration_since(now)
                    .max(self.policy.minimum_sample)
            })
    }

    /// Estimated link capacity in bytes per second
    pub fn bandwidth(&self) -> u64 {
        let rtt = self.base_rtt.unwrap_or(self.policy.initial_rtt);
        let rtt_ms = (rtt.as_millis() as u64).max(1);
        self.window as u64 * 1000 / rtt_ms
    }

    /// Round trip time of the last answered probe
    pub fn ping_time(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Decide whether the next update has to wait
    ///
    /// Unsent bytes in the local buffer always mean congestion. Without
    /// fences there is nothing to measure, and the datagram channel has no
    /// stream congestion to speak of.
    pub fn check(
        &mut self,
        buffer_usage: usize,
        fences_supported: bool,
        datagram: bool,
        position: u64,
        now: Instant,
    ) -> Verdict {
        if buffer_usage > 0 {
            return Verdict::Congested { eta: None };
        }
        if !fences_supported || datagram {
            return Verdict::Clear;
        }
        self.update_position(position);
        if !self.is_congested() {
            return Verdict::Clear;
        }
        Verdict::Congested {
            eta: self.uncongested_eta(now),
        }
    }
}
