use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::queue::Lane;

#[derive(Debug, Clone, Copy)]
struct WaitSample {
    lane: Lane,
    start: Instant,
    end: Instant,
}

impl WaitSample {
    fn wait(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }
}

/// Rolling wait-time summary for one lane. Advisory only; the scheduler never reads it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WaitStats {
    pub samples: usize,
    pub avg_ms: Option<u64>,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
}

/// Wait-time samples ordered by completion time.
#[derive(Debug, Default)]
pub(crate) struct WaitTimes {
    samples: VecDeque<WaitSample>,
}

impl WaitTimes {
    pub(crate) fn record(&mut self, lane: Lane, start: Instant, end: Instant) {
        self.samples.push_back(WaitSample { lane, start, end });
    }

    pub(crate) fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.samples.front() {
            if now.saturating_duration_since(front.end) <= window {
                break;
            }
            self.samples.pop_front();
        }
    }

    pub(crate) fn stats(&self, lane: Lane, now: Instant, window: Duration) -> WaitStats {
        fn percentile(mut v: Vec<u64>, p: f64) -> Option<u64> {
            if v.is_empty() {
                return None;
            }
            let n = v.len();
            let idx = ((p * (n.saturating_sub(1) as f64)).ceil() as usize).min(n - 1);
            let (_, nth, _) = v.select_nth_unstable(idx);
            Some(*nth)
        }

        let waits: Vec<u64> = self
            .samples
            .iter()
            .filter(|s| s.lane == lane && now.saturating_duration_since(s.end) <= window)
            .map(|s| s.wait().as_millis() as u64)
            .collect();
        let total: u64 = waits.iter().sum();
        WaitStats {
            samples: waits.len(),
            avg_ms: (!waits.is_empty()).then(|| total / waits.len() as u64),
            p50_ms: percentile(waits.clone(), 0.50),
            p95_ms: percentile(waits, 0.95),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(start_paused = true)]
    async fn average_only_covers_the_window_and_lane() {
        let window = Duration::from_secs(300);
        let mut times = WaitTimes::default();
        let t0 = Instant::now();
        times.record(Lane::Claude, t0, t0 + Duration::from_millis(100));
        times.record(Lane::Claude, t0, t0 + Duration::from_millis(300));
        times.record(Lane::Turbo, t0, t0 + Duration::from_secs(9));

        let stats = times.stats(Lane::Claude, t0 + Duration::from_secs(1), window);
        assert_eq!(stats.samples, 2);
        assert_eq!(stats.avg_ms, Some(200));
        assert_eq!(stats.p50_ms, Some(300));

        let later = t0 + Duration::from_secs(400);
        assert_eq!(times.stats(Lane::Claude, later, window), WaitStats::default());
        times.prune(later, window);
        assert_eq!(times.len(), 0);
    }
}
