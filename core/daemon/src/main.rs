//! Penlab daemon entrypoint.
//!
//! Owns the recording session, the pen's liveness and the live-feed fan-out.
//! Clients speak newline-delimited JSON over a Unix socket: one request per
//! connection, except `subscribe` and `attach_device`, which keep the
//! connection open as an observer or as the device channel.

use fs_err as fs;
use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use penlab_protocol::{
    parse_label_session, parse_sample, parse_start_session, ErrorInfo, Method, Request, Response,
    ERROR_INVALID_JSON, ERROR_MISSING_FIELD, ERROR_TOO_MANY_CONNECTIONS, MAX_REQUEST_BYTES,
    PROTOCOL_VERSION,
};
use serde::Serialize;

mod channels;
mod config;
mod error;
mod hub;
mod ingest;
mod liveness;
mod session_store;
mod state;

use config::DaemonConfig;
use session_store::SessionLayout;
use state::SharedState;

const READ_TIMEOUT_SECS: u64 = 2;
const DEBUG_LOG_ENV: &str = "PENLAB_DEBUG_LOG";

fn main() {
    init_logging();

    let config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load daemon config; using defaults");
            DaemonConfig::default()
        }
    };

    let sessions_dir = match config.resolve_sessions_dir() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve sessions directory");
            std::process::exit(1);
        }
    };
    let layout = SessionLayout::new(&sessions_dir);
    if let Err(err) = layout.ensure() {
        error!(error = %err, path = %sessions_dir.display(), "Failed to prepare sessions directory");
        std::process::exit(1);
    }

    let socket_path = match config::socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(
        socket = %socket_path.display(),
        sessions = %sessions_dir.display(),
        staleness_secs = config.staleness_secs,
        "Penlab daemon started"
    );

    let config = Arc::new(config);
    let shared_state = Arc::new(SharedState::new(layout, config.staleness()));
    spawn_liveness_sweeper(Arc::clone(&shared_state), config.sweep_interval());

    let active = Arc::new(AtomicUsize::new(0));
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let guard = match ConnectionGuard::acquire(&active, config.max_connections) {
                    Some(guard) => guard,
                    None => {
                        reject_connection(stream);
                        continue;
                    }
                };
                let state = Arc::clone(&shared_state);
                let config = Arc::clone(&config);
                thread::spawn(move || handle_connection(stream, state, &config, guard));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn spawn_liveness_sweeper(state: Arc<SharedState>, interval: Duration) {
    thread::spawn(move || loop {
        thread::sleep(interval);
        state.sweep_liveness(chrono::Utc::now());
    });
}

fn init_logging() {
    let debug_enabled = env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

/// Counts a connection against `max_connections` until dropped. Streaming
/// channels release it once acknowledged, so the cap only bounds one-shot
/// requests.
struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn acquire(active: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        let previous = active.fetch_add(1, Ordering::SeqCst);
        if previous >= limit {
            active.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(Self {
            active: Arc::clone(active),
        })
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn reject_connection(mut stream: UnixStream) {
    warn!("Rejecting connection: too many active connections");
    let _ = stream.set_write_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));
    let response = Response::error(
        None,
        ERROR_TOO_MANY_CONNECTIONS,
        "daemon is at its connection limit",
    );
    let _ = write_response(&mut stream, response);
}

fn handle_connection(
    stream: UnixStream,
    state: Arc<SharedState>,
    config: &DaemonConfig,
    guard: ConnectionGuard,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(err) => {
            warn!(error = %err, "Failed to clone daemon connection");
            return;
        }
    };
    let mut reader = BufReader::new(stream);

    let request = match read_request(&mut reader) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut writer, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    if request.protocol_version != PROTOCOL_VERSION {
        let response = Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
        let _ = write_response(&mut writer, response);
        return;
    }

    match request.method {
        Method::Subscribe => {
            drop(guard);
            channels::run_observer(reader, writer, request.id, &state, config)
        }
        Method::AttachDevice => {
            drop(guard);
            channels::run_device(reader, writer, request.id, &state)
        }
        _ => {
            let response = handle_request(request, &state);
            let _ = write_response(&mut writer, response);
        }
    }
}

pub(crate) fn read_request<R: BufRead>(reader: &mut R) -> Result<Request, ErrorInfo> {
    let mut buffer = Vec::new();
    let limit = (MAX_REQUEST_BYTES + 1) as u64;
    match reader.by_ref().take(limit).read_until(b'\n', &mut buffer) {
        Ok(_) => {}
        Err(err)
            if matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) =>
        {
            return Err(ErrorInfo::new("read_timeout", "request timed out"));
        }
        Err(err) => {
            return Err(ErrorInfo::new(
                "read_error",
                format!("failed to read request: {}", err),
            ));
        }
    }

    if buffer.len() > MAX_REQUEST_BYTES {
        return Err(ErrorInfo::new(
            "request_too_large",
            "request exceeded maximum size",
        ));
    }

    if buffer.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(&buffer).map_err(|err| {
        ErrorInfo::new(
            ERROR_INVALID_JSON,
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, state: &SharedState) -> Response {
    match request.method {
        Method::GetHealth => {
            let data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "observers": state.status().observer_count,
                "pen_state": state.pen_state(),
            });
            Response::ok(request.id, data)
        }
        Method::GetStatus => respond(request.id, Ok(state.status())),
        Method::StartSession => {
            let shape = match parse_start_session(request.params) {
                Ok(shape) => shape,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            respond(
                request.id,
                state.start_session(&shape).map_err(ErrorInfo::from),
            )
        }
        Method::StopSession => respond(request.id, state.stop_session().map_err(ErrorInfo::from)),
        Method::LabelSession => {
            let label = match parse_label_session(request.params) {
                Ok(label) => label,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            respond(
                request.id,
                state.label_session(&label).map_err(ErrorInfo::from),
            )
        }
        Method::Ingest => {
            let params = match request.params {
                Some(params) => params,
                None => {
                    return Response::error(request.id, ERROR_MISSING_FIELD, "sample is required")
                }
            };
            let reading = match parse_sample(params) {
                Ok(reading) => reading,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            respond(request.id, Ok(state.ingest(reading, chrono::Utc::now())))
        }
        Method::Subscribe | Method::AttachDevice => Response::error(
            request.id,
            "invalid_params",
            "streaming methods must open their own connection",
        ),
    }
}

fn respond<T: Serialize>(id: Option<String>, result: Result<T, ErrorInfo>) -> Response {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => Response::ok(id, value),
            Err(err) => Response::error(
                id,
                "serialization_error",
                format!("Failed to serialize response: {}", err),
            ),
        },
        Err(err) => Response::error_with_info(id, err),
    }
}

pub(crate) fn write_response<W: Write>(stream: &mut W, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn read_request_parses_first_line() {
        let mut input = Cursor::new(
            b"{\"protocol_version\":1,\"method\":\"get_status\"}\n{\"ignored\":true}\n".to_vec(),
        );
        let request = read_request(&mut input).expect("request");
        assert_eq!(request.method, Method::GetStatus);
    }

    #[test]
    fn read_request_rejects_empty_and_invalid_json() {
        let mut empty = Cursor::new(b"  \n".to_vec());
        assert_eq!(read_request(&mut empty).expect_err("empty").code, "empty_request");

        let mut garbage = Cursor::new(b"not json\n".to_vec());
        assert_eq!(
            read_request(&mut garbage).expect_err("garbage").code,
            ERROR_INVALID_JSON
        );
    }

    #[test]
    fn read_request_rejects_oversized_payload() {
        let mut input = Cursor::new(vec![b'a'; MAX_REQUEST_BYTES + 10]);
        assert_eq!(
            read_request(&mut input).expect_err("too large").code,
            "request_too_large"
        );
    }

    #[test]
    fn connection_guard_enforces_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let first = ConnectionGuard::acquire(&active, 1).expect("first slot");
        assert!(ConnectionGuard::acquire(&active, 1).is_none());
        drop(first);
        assert!(ConnectionGuard::acquire(&active, 1).is_some());
    }

    #[test]
    fn ingest_request_rejects_missing_axis() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let state = state::tests::shared_state(temp_dir.path());
        let mut request = Request::new(
            Method::Ingest,
            Some(serde_json::json!({"ax": 1.0, "ay": 0.0, "az": 0.0, "gx": 0.0, "gy": 0.0})),
        );
        request.id = Some("sample-1".to_string());

        let response = handle_request(request, &state);
        assert!(!response.ok);
        assert_eq!(response.id.as_deref(), Some("sample-1"));
        assert_eq!(response.error.expect("error").code, "missing_field");
        assert_eq!(state.pen_state(), penlab_protocol::PenState::Offline);
    }

    #[test]
    fn ingest_request_without_sample_is_missing_field() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let state = state::tests::shared_state(temp_dir.path());
        let response = handle_request(Request::new(Method::Ingest, None), &state);
        assert!(!response.ok);
        assert_eq!(response.error.expect("error").code, ERROR_MISSING_FIELD);
        assert_eq!(state.pen_state(), penlab_protocol::PenState::Offline);
    }

    #[test]
    fn start_request_without_shape_is_rejected() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let state = state::tests::shared_state(temp_dir.path());
        let response = handle_request(Request::new(Method::StartSession, None), &state);
        assert!(!response.ok);
        assert_eq!(response.error.expect("error").code, "missing_field");
        assert!(!state.status().recording);
    }

    #[test]
    fn label_request_for_missing_file_is_not_found() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let state = state::tests::shared_state(temp_dir.path());
        let response = handle_request(
            Request::new(
                Method::LabelSession,
                Some(serde_json::json!({
                    "shape": "circle",
                    "quality": "good",
                    "filename": "circle_20240101_000000.csv"
                })),
            ),
            &state,
        );
        assert_eq!(response.error.expect("error").code, "not_found");
    }
}
