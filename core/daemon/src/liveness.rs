//! Device presence derived from traffic recency.
//!
//! Holds exactly one current `PenState`. Samples push it to `Online`, the
//! device socket handshake to `Connected`, and either a teardown or a sweep
//! that finds `last_seen` stale drops it to `Offline`.

use chrono::{DateTime, Duration, Utc};
use penlab_protocol::PenState;

#[derive(Debug, Clone)]
pub struct LivenessTracker {
    state: PenState,
    last_seen: Option<DateTime<Utc>>,
    staleness: Duration,
}

impl LivenessTracker {
    pub fn new(staleness: Duration) -> Self {
        Self {
            state: PenState::Offline,
            last_seen: None,
            staleness,
        }
    }

    pub fn mark_online(&mut self, now: DateTime<Utc>) {
        self.last_seen = Some(now);
        self.state = PenState::Online;
    }

    pub fn mark_connected(&mut self) {
        self.state = PenState::Connected;
    }

    pub fn mark_disconnected(&mut self) {
        self.state = PenState::Offline;
        self.last_seen = None;
    }

    /// Returns the new state when the sweep downgraded it.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Option<PenState> {
        if self.state == PenState::Offline {
            return None;
        }

        let stale = match self.last_seen {
            Some(last_seen) => now.signed_duration_since(last_seen) > self.staleness,
            None => true,
        };
        if !stale {
            return None;
        }

        self.state = PenState::Offline;
        Some(self.state)
    }

    pub fn current_state(&self) -> PenState {
        self.state
    }

    #[cfg(test)]
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> LivenessTracker {
        LivenessTracker::new(Duration::seconds(3))
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-31T00:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn starts_offline() {
        let tracker = tracker();
        assert_eq!(tracker.current_state(), PenState::Offline);
        assert!(tracker.last_seen().is_none());
    }

    #[test]
    fn sweep_before_threshold_keeps_online() {
        let mut tracker = tracker();
        tracker.mark_online(t0());
        assert_eq!(tracker.sweep(t0() + Duration::milliseconds(2900)), None);
        assert_eq!(tracker.current_state(), PenState::Online);
    }

    #[test]
    fn sweep_after_threshold_goes_offline() {
        let mut tracker = tracker();
        tracker.mark_online(t0());
        assert_eq!(
            tracker.sweep(t0() + Duration::milliseconds(3100)),
            Some(PenState::Offline)
        );
        assert_eq!(tracker.current_state(), PenState::Offline);
        assert_eq!(tracker.sweep(t0() + Duration::seconds(10)), None);
    }

    #[test]
    fn connected_without_samples_is_swept_offline() {
        let mut tracker = tracker();
        tracker.mark_connected();
        assert_eq!(tracker.current_state(), PenState::Connected);
        assert_eq!(tracker.sweep(t0()), Some(PenState::Offline));
    }

    #[test]
    fn sample_after_handshake_moves_to_online() {
        let mut tracker = tracker();
        tracker.mark_connected();
        tracker.mark_online(t0());
        assert_eq!(tracker.current_state(), PenState::Online);
    }

    #[test]
    fn disconnect_clears_last_seen() {
        let mut tracker = tracker();
        tracker.mark_online(t0());
        tracker.mark_disconnected();
        assert_eq!(tracker.current_state(), PenState::Offline);
        assert!(tracker.last_seen().is_none());
    }
}
