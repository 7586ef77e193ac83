//! Bottleneck and encode statistics of one connection.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Samples older than this drop out of the recent figures
pub const RECENT_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bottleneck {
    /// Encoding took at least 80% of a frame
    CpuClose,
    /// Encoding took a frame or longer
    CpuSlow,
    /// The link was congested for longer than a frame
    NetSlow,
    Frame,
}

impl Bottleneck {
    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default)]
pub struct BottleneckStats {
    recent: [VecDeque<Instant>; 4],
    total: [u64; 4],
}

impl BottleneckStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: Bottleneck, at: Instant) {
        self.recent[kind.index()].push_back(at);
        self.total[kind.index()] += 1;
    }

    /// Classify an update that took `encode_time` against a frame of `frame`
    ///
    /// An update spanning several frames counts once per frame so the
    /// figures react faster.
    pub fn record_encode(&mut self, encode_time: Duration, frame: Duration, at: Instant) {
        let ms = encode_time.as_millis() as u64;
        let limit = (frame.as_millis() as u64).max(1);
        if ms >= limit {
            self.record(Bottleneck::CpuSlow, at);
            for _ in 1..ms / limit {
                self.record(Bottleneck::CpuSlow, at);
                self.record(Bottleneck::Frame, at);
            }
        } else if ms as f32 >= limit as f32 * 0.8 {
            self.record(Bottleneck::CpuClose, at);
        }
    }

    pub fn total(&self, kind: Bottleneck) -> u64 {
        self.total[kind.index()]
    }

    fn prune(&mut self, now: Instant) {
        for list in self.recent.iter_mut() {
            while let Some(front) = list.front() {
                if now.saturating_duration_since(*front) > RECENT_WINDOW {
                    list.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Scores for the Stats message, 10 means no bottleneck at all
    pub fn scores(&mut self, now: Instant) -> StatsScores {
        self.prune(now);
        let recent = |kind: Bottleneck| self.recent[kind.index()].len() as f32;
        let total = |kind: Bottleneck| self.total[kind.index()] as f32;
        let ratio = |n: f32, frames: f32| if frames > 0.0 { n / frames } else { 0.0 };

        let frames = recent(Bottleneck::Frame);
        let cpu_recent = ratio(
            recent(Bottleneck::CpuSlow) + recent(Bottleneck::CpuClose) * 0.2,
            frames,
        );
        let net_recent = ratio(recent(Bottleneck::NetSlow), frames).min(1.0);

        let frames = total(Bottleneck::Frame);
        let cpu_total = ratio(
            total(Bottleneck::CpuSlow) + total(Bottleneck::CpuClose) * 0.2,
            frames,
        );
        let net_total = ratio(total(Bottleneck::NetSlow), frames).min(1.0);

        let ten = |x: f32| 10.0 - x * 10.0;
        StatsScores {
            cpu_recent: ten(cpu_recent),
            cpu_total: ten(cpu_total),
            net_recent: ten(net_recent),
            net_total: ten(net_total),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsScores {
    pub cpu_recent: f32,
    pub cpu_total: f32,
    pub net_recent: f32,
    pub net_total: f32,
}

impl fmt::Display for StatsScores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[ {:.1}, {:.1}, {:.1}, {:.1} ]",
            self.cpu_recent, self.cpu_total, self.net_recent, self.net_total
        )
    }
}

/// What one update cost
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EncodeStats {
    pub updates: u64,
    pub rects: u64,
    pub pixels: u64,
    pub bytes: u64,
    /// What the same rects would have taken as Raw
    pub equivalent: u64,
}

impl EncodeStats {
    pub fn add(&mut self, other: &EncodeStats) {
        self.updates += other.updates;
        self.rects += other.rects;
        self.pixels += other.pixels;
        self.bytes += other.bytes;
        self.equivalent += other.equivalent;
    }

    pub fn ratio(&self) -> f64 {
        if self.bytes == 0 {
            return 0.0;
        }
        self.equivalent as f64 / self.bytes as f64
    }
}

impl fmt::Display for EncodeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} updates, {} rects, {} pixels, {} bytes (ratio {:.1}:1)",
            self.updates,
            self.rects,
            self.pixels,
            self.bytes,
            self.ratio()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_connection_scores_ten() {
        let mut stats = BottleneckStats::new();
        assert_eq!(stats.scores(Instant::now()).to_string(), "[ 10.0, 10.0, 10.0, 10.0 ]");
    }

    #[test]
    fn slow_encodes_and_links_lower_the_score() {
        let mut stats = BottleneckStats::new();
        let start = Instant::now();
        let frame = Duration::from_millis(16);
        for _ in 0..10 {
            stats.record(Bottleneck::Frame, start);
        }
        // three frames worth of encoding: three slow samples, two extra frames
        stats.record_encode(Duration::from_millis(48), frame, start);
        assert_eq!(stats.total(Bottleneck::CpuSlow), 3);
        assert_eq!(stats.total(Bottleneck::Frame), 12);
        stats.record_encode(Duration::from_millis(13), frame, start);
        assert_eq!(stats.total(Bottleneck::CpuClose), 1);
        stats.record_encode(Duration::from_millis(5), frame, start);
        for _ in 0..6 {
            stats.record(Bottleneck::NetSlow, start);
        }

        let scores = stats.scores(start);
        // (3 + 0.2) / 12 and 6 / 12
        assert!((scores.cpu_recent - (10.0 - 32.0 / 12.0)).abs() < 1e-4);
        assert!((scores.net_total - 5.0).abs() < 1e-4);

        // the recent window empties, totals remain
        let scores = stats.scores(start + Duration::from_secs(11));
        assert_eq!(scores.cpu_recent, 10.0);
        assert_eq!(scores.net_recent, 10.0);
        assert!(scores.cpu_total < 10.0);
    }

    #[test]
    fn net_score_bottoms_out() {
        let mut stats = BottleneckStats::new();
        let now = Instant::now();
        stats.record(Bottleneck::Frame, now);
        stats.record(Bottleneck::NetSlow, now);
        stats.record(Bottleneck::NetSlow, now);
        assert_eq!(stats.scores(now).net_recent, 0.0);
    }

    #[test]
    fn encode_totals() {
        let mut total = EncodeStats::default();
        total.add(&EncodeStats {
            updates: 1,
            rects: 2,
            pixels: 100,
            bytes: 50,
            equivalent: 400,
        });
        assert_eq!(total.ratio(), 8.0);
        assert!(total.to_string().starts_with("1 updates, 2 rects"));
    }
}
