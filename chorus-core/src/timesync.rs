use crate::window::SampleWindow;

/// Cadence of the steady-state timekeep probe.
pub const TIMEKEEP_REFRESH_INTERVAL_MS: u64 = 100;

/// Probes fired in a burst when a peer connects, to populate the delta
/// window quickly. A peer counts as time-synchronized once its window
/// holds this many samples.
pub const TIMESYNC_INIT_REQUEST_COUNT: usize = 10;

/// Spacing of the initial burst.
pub const TIMESYNC_INIT_REQUEST_INTERVAL_MS: u64 = 10;

/// Retained delta samples per peer.
pub const DELTA_WINDOW_SIZE: usize = 100;

/// The committed delta only moves when the window median drifts further
/// than this from it.
pub const DELTA_UPDATE_THRESHOLD_MS: f64 = 5.0;

/// Per-peer clock offset estimator. Fed by reflected timekeep probes,
/// it maintains a bounded window of offset samples and a committed
/// scalar that consumers use to translate between clocks:
/// `remote_time ≈ local_time + delta`.
pub struct TimeSync {
    window: SampleWindow<DELTA_WINDOW_SIZE>,
    committed: f64,
}

impl Default for TimeSync {
    fn default() -> Self {
        TimeSync::new()
    }
}

impl TimeSync {
    pub fn new() -> TimeSync {
        TimeSync {
            window: SampleWindow::new(),
            committed: 0.0,
        }
    }

    /// Folds one reflected probe into the estimate. `sent_at` and
    /// `received_at` are local clock readings around the round trip,
    /// `responded_at` is the peer's clock when it reflected the probe.
    /// Assumes symmetric network delay.
    ///
    /// Returns the new committed delta when the median moved far enough
    /// to update it.
    pub fn record_probe(&mut self, sent_at: f64, responded_at: f64, received_at: f64) -> Option<f64> {
        let roundtrip = received_at - sent_at;
        let peer_received_at = sent_at + roundtrip / 2.0;
        let delta_sample = responded_at - peer_received_at;

        self.window.push(delta_sample);

        if !self.is_synchronized() {
            return None;
        }

        let real_delta = self.window.median()?;

        if (real_delta - self.committed).abs() > DELTA_UPDATE_THRESHOLD_MS {
            self.committed = real_delta;
            return Some(real_delta);
        }

        None
    }

    pub fn committed_delta(&self) -> f64 {
        self.committed
    }

    /// Median of the current window; finer than the committed value
    /// since it tracks between hysteresis updates.
    pub fn median_delta(&self) -> Option<f64> {
        self.window.median()
    }

    pub fn is_synchronized(&self) -> bool {
        self.window.is_full(TIMESYNC_INIT_REQUEST_COUNT)
    }

    /// Drops all samples. Called when the peer leaves the connected
    /// state; the committed value is left for late readers.
    pub fn flush(&mut self) {
        self.window.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(sync: &mut TimeSync, delta: f64, count: usize) -> Option<f64> {
        let mut last = None;
        for i in 0..count {
            let sent = i as f64 * 100.0;
            // symmetric 20 ms link: peer reflects 10 ms after the send
            let responded = sent + 10.0 + delta;
            let received = sent + 20.0;
            if let Some(update) = sync.record_probe(sent, responded, received) {
                last = Some(update);
            }
        }
        last
    }

    #[test]
    fn symmetric_link_cancels_out_of_the_estimate() {
        let mut sync = TimeSync::new();
        let update = fill(&mut sync, 137.0, TIMESYNC_INIT_REQUEST_COUNT);
        assert_eq!(update, Some(137.0));
        assert_eq!(sync.committed_delta(), 137.0);
        assert!(sync.is_synchronized());
    }

    #[test]
    fn no_commit_before_initial_count() {
        let mut sync = TimeSync::new();
        let update = fill(&mut sync, 137.0, TIMESYNC_INIT_REQUEST_COUNT - 1);
        assert_eq!(update, None);
        assert!(!sync.is_synchronized());
        assert_eq!(sync.committed_delta(), 0.0);
        // the window still tracks the samples
        assert_eq!(sync.median_delta(), Some(137.0));
    }

    #[test]
    fn committed_moves_only_past_the_threshold() {
        let mut sync = TimeSync::new();
        fill(&mut sync, 100.0, DELTA_WINDOW_SIZE);
        assert_eq!(sync.committed_delta(), 100.0);

        // drift of 3 ms: median moves, committed holds
        fill(&mut sync, 103.0, DELTA_WINDOW_SIZE);
        assert_eq!(sync.median_delta(), Some(103.0));
        assert_eq!(sync.committed_delta(), 100.0);

        // drift of 7 ms from the committed value: updates once
        let update = fill(&mut sync, 107.0, DELTA_WINDOW_SIZE);
        assert_eq!(update, Some(107.0));
        assert_eq!(sync.committed_delta(), 107.0);
    }

    #[test]
    fn committed_equals_median_at_assignment() {
        let mut sync = TimeSync::new();
        fill(&mut sync, 42.0, TIMESYNC_INIT_REQUEST_COUNT);
        assert_eq!(Some(sync.committed_delta()), sync.median_delta());
    }

    #[test]
    fn flush_empties_the_window() {
        let mut sync = TimeSync::new();
        fill(&mut sync, 42.0, TIMESYNC_INIT_REQUEST_COUNT);
        sync.flush();
        assert!(!sync.is_synchronized());
        assert_eq!(sync.median_delta(), None);
        // committed survives for late readers
        assert_eq!(sync.committed_delta(), 42.0);
    }
}
