//! Long-lived connections: live-feed observers and the pen's device channel.
//!
//! Both start with a normal request/response handshake and then stay open.
//! Inbound frames on either channel never drive state: observers may send
//! keep-alives, and the pen's frames are only logged. Liveness comes from the
//! ingest path.

use std::io::{BufRead, BufReader, Read};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use tracing::{debug, warn};

use penlab_protocol::{LiveEvent, Response, MAX_REQUEST_BYTES};

use crate::config::DaemonConfig;
use crate::hub::{DeliveryError, JsonLineSink, ObserverSink};
use crate::state::SharedState;
use crate::write_response;

/// Observer sink over the client socket. A failed write shuts the socket down
/// so the connection's reader loop ends too.
struct SocketSink {
    lines: JsonLineSink<UnixStream>,
    control: UnixStream,
}

impl ObserverSink for SocketSink {
    fn deliver(&mut self, event: &LiveEvent) -> Result<(), DeliveryError> {
        let result = self.lines.deliver(event);
        if result.is_err() {
            let _ = self.control.shutdown(Shutdown::Both);
        }
        result
    }
}

pub fn run_observer(
    mut reader: BufReader<UnixStream>,
    mut writer: UnixStream,
    request_id: Option<String>,
    state: &SharedState,
    config: &DaemonConfig,
) {
    let _ = reader.get_ref().set_read_timeout(None);
    let _ = writer.set_write_timeout(Some(config.observer_send_timeout()));

    let response = Response::ok(request_id, serde_json::json!({ "subscribed": true }));
    if let Err(err) = write_response(&mut writer, response) {
        warn!(error = %err, "Failed to acknowledge observer");
        return;
    }

    let control = match writer.try_clone() {
        Ok(control) => control,
        Err(err) => {
            warn!(error = %err, "Failed to clone observer socket");
            return;
        }
    };
    let sink = SocketSink {
        lines: JsonLineSink::new(writer),
        control,
    };
    let id = match state.subscribe(Box::new(sink)) {
        Ok(id) => id,
        Err(err) => {
            warn!(error = %err, "Observer dropped before welcome");
            return;
        }
    };

    drain_frames(&mut reader, |_| {});
    state.unsubscribe(id);
}

pub fn run_device(
    mut reader: BufReader<UnixStream>,
    mut writer: UnixStream,
    request_id: Option<String>,
    state: &SharedState,
) {
    let _ = reader.get_ref().set_read_timeout(None);

    let response = Response::ok(request_id, serde_json::json!({ "attached": true }));
    if let Err(err) = write_response(&mut writer, response) {
        warn!(error = %err, "Failed to acknowledge pen connection");
        return;
    }

    let lease = state.attach_device();
    drain_frames(&mut reader, |frame| {
        debug!(frame = %String::from_utf8_lossy(frame).trim_end(), "Pen frame");
    });
    state.detach_device(lease);
}

/// Reads newline-delimited frames until EOF or a read error. Frames longer
/// than the request limit are split rather than buffered whole.
fn drain_frames<R: BufRead>(reader: &mut R, mut on_frame: impl FnMut(&[u8])) {
    let mut frame = Vec::new();
    loop {
        frame.clear();
        match reader
            .by_ref()
            .take(MAX_REQUEST_BYTES as u64)
            .read_until(b'\n', &mut frame)
        {
            Ok(0) => return,
            Ok(_) => on_frame(&frame),
            Err(err) => {
                debug!(error = %err, "Channel closed");
                return;
            }
        }
    }
}
