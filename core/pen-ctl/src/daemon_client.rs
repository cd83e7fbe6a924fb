//! Client helper for talking to the penlab daemon.
//!
//! One request per connection, with a single retry when the daemon could not
//! be reached. Streaming methods return the open connection after the ack.

use penlab_protocol::{ErrorInfo, Method, Request, Response, MAX_REQUEST_BYTES};
use serde_json::Value;
use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const SOCKET_ENV: &str = "PENLAB_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 2000;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Home directory not found")]
    NoHome,

    #[error("Failed to connect to daemon socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid daemon payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Daemon response was empty")]
    EmptyResponse,

    #[error("Response exceeded maximum size")]
    ResponseTooLarge,

    #[error("{}: {}", .0.code, .0.message)]
    Daemon(ErrorInfo),
}

impl ClientError {
    fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Connect { .. } | ClientError::Io(_))
    }
}

pub fn socket_path() -> Result<PathBuf, ClientError> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir().ok_or(ClientError::NoHome)?;
    Ok(home.join(".penlab").join(SOCKET_NAME))
}

/// Sends one request and returns the `data` of an ok response.
pub fn call(method: Method, params: Option<Value>) -> Result<Value, ClientError> {
    match call_once(method, params.clone()) {
        Err(err) if err.is_retryable() => {
            tracing::warn!(error = %err, method = ?method, "Daemon request failed; retrying");
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            call_once(method, params).map_err(|retry_err| {
                tracing::warn!(error = %retry_err, method = ?method, "Retry failed");
                retry_err
            })
        }
        other => other,
    }
}

fn call_once(method: Method, params: Option<Value>) -> Result<Value, ClientError> {
    let mut stream = connect()?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    send(&mut stream, &Request::new(method, params))?;
    let mut reader = BufReader::new(stream);
    into_data(read_response(&mut reader)?)
}

/// Opens a streaming connection (`subscribe` or `attach_device`). Returns the
/// reader positioned after the ack, plus the write half.
pub fn open_stream(method: Method) -> Result<(BufReader<UnixStream>, UnixStream), ClientError> {
    let mut stream = connect()?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    send(&mut stream, &Request::new(method, None))?;

    let writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    into_data(read_response(&mut reader)?)?;
    let _ = reader.get_ref().set_read_timeout(None);
    Ok((reader, writer))
}

fn connect() -> Result<UnixStream, ClientError> {
    let path = socket_path()?;
    let stream =
        UnixStream::connect(&path).map_err(|source| ClientError::Connect { path, source })?;
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
    Ok(stream)
}

fn send<W: Write>(stream: &mut W, request: &Request) -> Result<(), ClientError> {
    serde_json::to_writer(&mut *stream, request)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

pub fn read_response<R: BufRead>(reader: &mut R) -> Result<Response, ClientError> {
    let mut buffer = Vec::new();
    reader
        .by_ref()
        .take((MAX_REQUEST_BYTES + 1) as u64)
        .read_until(b'\n', &mut buffer)?;
    if buffer.len() > MAX_REQUEST_BYTES {
        return Err(ClientError::ResponseTooLarge);
    }
    if buffer.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ClientError::EmptyResponse);
    }
    Ok(serde_json::from_slice(&buffer)?)
}

fn into_data(response: Response) -> Result<Value, ClientError> {
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    let error = response
        .error
        .unwrap_or_else(|| ErrorInfo::new("unknown", "Unknown daemon error"));
    Err(ClientError::Daemon(error))
}
