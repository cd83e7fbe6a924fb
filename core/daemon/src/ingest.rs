//! Per-sample ingest pipeline.
//!
//! For each sample, in order: resolve defaults, mark the pen online, append to
//! the active session (if any), broadcast to observers. Neither a disk failure
//! nor an observer failure keeps the device from getting its ack.

use chrono::{DateTime, Utc};
use penlab_protocol::{IngestAck, LiveEvent, PenState, SampleReading};
use tracing::{debug, warn};

use crate::session_store::AppendOutcome;
use crate::state::SharedState;

impl SharedState {
    pub fn ingest(&self, reading: SampleReading, now: DateTime<Utc>) -> IngestAck {
        let sample = reading.resolve(epoch_seconds(now));

        {
            let mut liveness = self.liveness();
            let previous = liveness.current_state();
            liveness.mark_online(now);
            if previous != PenState::Online {
                self.publish_pen_state(&liveness, PenState::Online);
            }
        }

        let ack = match self.sessions().append(&sample) {
            Ok(AppendOutcome::Written) => IngestAck::Ok,
            Ok(AppendOutcome::NotRecording) => IngestAck::not_recording(),
            Err(err) => {
                warn!(error = %err, "Failed to persist sample");
                IngestAck::Error {
                    reason: err.to_string(),
                }
            }
        };

        let report = self.hub.publish(&LiveEvent::MpuData { data: sample });
        debug!(
            delivered = report.delivered,
            purged = report.purged,
            "Sample broadcast"
        );

        ack
    }
}

fn epoch_seconds(now: DateTime<Utc>) -> f64 {
    now.timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::testing::RecordingSink;
    use crate::state::tests::shared_state;
    use fs_err as fs;

    fn reading() -> SampleReading {
        SampleReading {
            ax: 1.0,
            ay: 0.0,
            az: 0.0,
            gx: 0.0,
            gy: 0.0,
            gz: 0.0,
            temp: None,
            timestamp: None,
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-31T00:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn idle_sample_is_ignored_but_broadcast() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let state = shared_state(temp_dir.path());
        let sink = RecordingSink::default();
        state.subscribe(Box::new(sink.clone())).expect("subscribe");

        let ack = state.ingest(reading(), t0());
        assert_eq!(ack, IngestAck::not_recording());
        assert_eq!(state.pen_state(), PenState::Online);

        let events = sink.events();
        let expected_sample = reading().resolve(epoch_seconds(t0()));
        assert_eq!(
            events.last(),
            Some(&LiveEvent::MpuData {
                data: expected_sample
            })
        );
        assert_eq!(expected_sample.timestamp, 1_769_817_600.0);
    }

    #[test]
    fn recording_sample_is_persisted_with_default_temp() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let state = shared_state(temp_dir.path());
        let started = state.start_session("circle").expect("start");

        let status = state.status();
        assert!(status.recording);
        assert_eq!(status.shape.as_deref(), Some("circle"));

        assert_eq!(state.ingest(reading(), t0()), IngestAck::Ok);
        state.stop_session().expect("stop");

        let path = temp_dir
            .path()
            .join("sessions")
            .join("raw")
            .join(&started.filename);
        let contents = fs::read_to_string(path).expect("read session");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines,
            vec![
                "timestamp,ax,ay,az,gx,gy,gz,temp",
                "1769817600.0,1.0,0.0,0.0,0.0,0.0,0.0,0.0",
            ]
        );
    }

    #[test]
    fn pen_state_announced_only_on_transition_to_online() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let state = shared_state(temp_dir.path());
        let sink = RecordingSink::default();
        state.subscribe(Box::new(sink.clone())).expect("subscribe");

        state.ingest(reading(), t0());
        state.ingest(reading(), t0());

        let kinds: Vec<&str> = sink.events().iter().map(LiveEvent::kind).collect();
        assert_eq!(kinds, vec!["connection", "pen_state", "mpu_data", "mpu_data"]);
    }

    #[test]
    fn disk_failure_acks_error_and_still_broadcasts() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let state = shared_state(temp_dir.path());
        let sink = RecordingSink::default();
        state.subscribe(Box::new(sink.clone())).expect("subscribe");
        state.start_session("circle").expect("start");
        state.sessions().break_writer();

        match state.ingest(reading(), t0()) {
            IngestAck::Error { reason } => assert!(reason.contains("Failed to append sample")),
            other => panic!("expected error ack, got {:?}", other),
        }
        assert_eq!(
            sink.events().last(),
            Some(&LiveEvent::MpuData {
                data: reading().resolve(epoch_seconds(t0()))
            })
        );
        assert!(state.status().recording);
        assert_eq!(state.pen_state(), PenState::Online);
    }

    #[test]
    fn broken_observer_does_not_block_persistence() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let state = shared_state(temp_dir.path());
        let broken = RecordingSink::default();
        let healthy = RecordingSink::default();
        state.subscribe(Box::new(broken.clone())).expect("subscribe");
        state.subscribe(Box::new(healthy.clone())).expect("subscribe");
        broken.break_pipe();

        state.start_session("square").expect("start");
        assert_eq!(state.ingest(reading(), t0()), IngestAck::Ok);
        assert_eq!(state.status().observer_count, 1);
        assert_eq!(
            healthy
                .events()
                .iter()
                .filter(|event| event.kind() == "mpu_data")
                .count(),
            1
        );
    }
}
