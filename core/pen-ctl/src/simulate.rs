//! Synthetic MPU6050 stream for exercising the daemon without a pen.
//!
//! Ranges mimic a handheld pen: acceleration within ±1.5 g, angular rate
//! within ±180 °/s, die temperature 20–35 °C.

use penlab_protocol::{IngestAck, Method, SampleParams};
use rand::Rng;
use std::time::{Duration, Instant};

use crate::daemon_client::{self, ClientError};

pub fn random_sample<R: Rng>(rng: &mut R, timestamp: f64) -> SampleParams {
    SampleParams {
        ax: Some(round(rng.gen_range(-1.5..=1.5), 3)),
        ay: Some(round(rng.gen_range(-1.5..=1.5), 3)),
        az: Some(round(rng.gen_range(-1.5..=1.5), 3)),
        gx: Some(round(rng.gen_range(-180.0..=180.0), 3)),
        gy: Some(round(rng.gen_range(-180.0..=180.0), 3)),
        gz: Some(round(rng.gen_range(-180.0..=180.0), 3)),
        temp: Some(round(rng.gen_range(20.0..=35.0), 2)),
        timestamp: Some(timestamp),
    }
}

fn round(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

pub fn send_sample(sample: &SampleParams) -> Result<IngestAck, ClientError> {
    let data = daemon_client::call(Method::Ingest, Some(serde_json::to_value(sample)?))?;
    Ok(serde_json::from_value(data)?)
}

/// Streams samples at `rate_hz` until `count` samples were sent (forever when
/// `None`). Send failures are reported and the stream keeps going.
pub fn run(rate_hz: f64, count: Option<u64>) -> Result<(), ClientError> {
    let period = Duration::from_secs_f64(1.0 / rate_hz.max(0.1));
    let mut rng = rand::thread_rng();
    let mut sent = 0u64;

    println!("Simulating MPU6050 data stream at {:.1} Hz...", rate_hz);
    while count.map_or(true, |limit| sent < limit) {
        let started = Instant::now();
        let now = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        let sample = random_sample(&mut rng, now);
        match send_sample(&sample) {
            Ok(ack) => println!("Sent: {} -> {}", serde_json::to_string(&sample)?, describe(&ack)),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to send simulated sample");
                eprintln!("Error sending data: {}", err);
            }
        }
        sent += 1;
        if let Some(remaining) = period.checked_sub(started.elapsed()) {
            std::thread::sleep(remaining);
        }
    }
    Ok(())
}

pub fn describe(ack: &IngestAck) -> String {
    match ack {
        IngestAck::Ok => "ok".to_string(),
        IngestAck::Ignored { reason } => format!("ignored ({})", reason),
        IngestAck::Error { reason } => format!("error ({})", reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn random_samples_stay_in_sensor_ranges() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let sample = random_sample(&mut rng, 1.0);
            for axis in [sample.ax, sample.ay, sample.az] {
                let value = axis.expect("accel axis");
                assert!((-1.5..=1.5).contains(&value));
            }
            for axis in [sample.gx, sample.gy, sample.gz] {
                let value = axis.expect("gyro axis");
                assert!((-180.0..=180.0).contains(&value));
            }
            let temp = sample.temp.expect("temp");
            assert!((20.0..=35.0).contains(&temp));
        }
    }

    #[test]
    fn random_samples_pass_daemon_validation() {
        let mut rng = StdRng::seed_from_u64(11);
        let sample = random_sample(&mut rng, 42.0);
        let value = serde_json::to_value(&sample).expect("json");
        let reading = penlab_protocol::parse_sample(value).expect("valid sample");
        assert_eq!(reading.timestamp, Some(42.0));
    }

    #[test]
    fn rounds_to_requested_decimals() {
        assert_eq!(round(1.23456, 3), 1.235);
        assert_eq!(round(-0.004, 2), -0.0);
    }

    #[test]
    fn describes_acks() {
        assert_eq!(describe(&IngestAck::Ok), "ok");
        assert_eq!(
            describe(&IngestAck::not_recording()),
            "ignored (not recording)"
        );
    }
}
