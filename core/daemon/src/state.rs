//! Shared coordinator state handed to every connection handler.
//!
//! One `SharedState` owns the session store, the liveness tracker and the
//! broadcast hub. Session mutations (start/stop/append/label) go through a
//! single mutex; the tracker has its own, and the hub synchronizes its
//! observer list internally. Pen-state changes are announced while the
//! tracker lock is still held, so observers see them in the order they
//! happened. Lock order is tracker, then hub.

use chrono::{DateTime, Duration, Local, Utc};
use penlab_protocol::{
    LabelRequest, LiveEvent, PenState, SessionLabeled, SessionStarted, SessionStopped,
    StatusSnapshot,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::error::CoreResult;
use crate::hub::{BroadcastHub, DeliveryError, ObserverId, ObserverSink};
use crate::liveness::LivenessTracker;
use crate::session_store::{SessionLayout, SessionStore};

/// Identifies one attachment of the device channel. A detach only counts if it
/// belongs to the most recent attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLease(u64);

pub struct SharedState {
    pub(crate) sessions: Mutex<SessionStore>,
    pub(crate) liveness: Mutex<LivenessTracker>,
    pub(crate) hub: BroadcastHub,
    device_generation: AtomicU64,
}

impl SharedState {
    pub fn new(layout: SessionLayout, staleness: Duration) -> Self {
        Self {
            sessions: Mutex::new(SessionStore::new(layout)),
            liveness: Mutex::new(LivenessTracker::new(staleness)),
            hub: BroadcastHub::new(),
            device_generation: AtomicU64::new(0),
        }
    }

    pub(crate) fn sessions(&self) -> MutexGuard<'_, SessionStore> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn liveness(&self) -> MutexGuard<'_, LivenessTracker> {
        self.liveness.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start_session(&self, shape: &str) -> CoreResult<SessionStarted> {
        let started = self.sessions().start(shape, Local::now())?;
        debug!(path = %started.path.display(), "Session file created");
        Ok(SessionStarted {
            message: format!("Recording started for shape '{}'", started.shape),
            filename: started.filename,
        })
    }

    pub fn stop_session(&self) -> CoreResult<SessionStopped> {
        let stopped = self.sessions().stop()?;
        Ok(SessionStopped {
            message: format!("Recording stopped for shape '{}'", stopped.shape),
            shape: stopped.shape,
            filename: stopped.filename,
        })
    }

    pub fn label_session(&self, request: &LabelRequest) -> CoreResult<SessionLabeled> {
        let destination = self.sessions().label(
            &request.shape,
            &request.quality,
            request.hand.as_deref(),
            &request.filename,
        )?;
        Ok(SessionLabeled {
            message: format!(
                "Labeled as {}",
                crate::session_store::capitalize(&request.quality)
            ),
            moved_to: destination.display().to_string(),
        })
    }

    pub fn status(&self) -> StatusSnapshot {
        let session = self.sessions().status();
        StatusSnapshot {
            server: "online".to_string(),
            recording: session.recording,
            shape: session.shape,
            filename: session.filename,
            observer_count: self.hub.observer_count(),
            pen_state: self.pen_state(),
        }
    }

    pub fn pen_state(&self) -> PenState {
        self.liveness().current_state()
    }

    /// Registers a live-feed observer; the welcome carries the pen state as of
    /// this call, and no pen-state change can slip between the two.
    pub fn subscribe(&self, sink: Box<dyn ObserverSink>) -> Result<ObserverId, DeliveryError> {
        let liveness = self.liveness();
        let pen_state = liveness.current_state();
        let id = self.hub.register(sink, pen_state)?;
        drop(liveness);
        info!(observer = %id, pen_state = pen_state.as_str(), "Live feed observer connected");
        Ok(id)
    }

    pub fn unsubscribe(&self, id: ObserverId) {
        if self.hub.unregister(id) {
            info!(observer = %id, "Live feed observer disconnected");
        }
    }

    pub fn attach_device(&self) -> DeviceLease {
        let mut liveness = self.liveness();
        let lease = DeviceLease(self.device_generation.fetch_add(1, Ordering::SeqCst) + 1);
        liveness.mark_connected();
        info!("Pen connected");
        self.publish_pen_state(&liveness, PenState::Connected);
        lease
    }

    pub fn detach_device(&self, lease: DeviceLease) {
        let mut liveness = self.liveness();
        if self.device_generation.load(Ordering::SeqCst) != lease.0 {
            debug!("Ignoring detach from a superseded pen connection");
            return;
        }
        liveness.mark_disconnected();
        info!("Pen disconnected");
        self.publish_pen_state(&liveness, PenState::Offline);
    }

    /// Periodic staleness check; announces the downgrade to observers.
    pub fn sweep_liveness(&self, now: DateTime<Utc>) -> Option<PenState> {
        let mut liveness = self.liveness();
        let downgraded = liveness.sweep(now);
        if let Some(state) = downgraded {
            info!(pen_state = state.as_str(), "Pen went quiet");
            self.publish_pen_state(&liveness, state);
        }
        downgraded
    }

    /// Takes the tracker guard to prove the caller still holds the lock the
    /// transition was made under.
    pub(crate) fn publish_pen_state(&self, _held: &LivenessTracker, state: PenState) {
        let report = self.hub.publish(&LiveEvent::PenState { state });
        debug!(
            pen_state = state.as_str(),
            delivered = report.delivered,
            purged = report.purged,
            "Published pen state"
        );
    }
}
