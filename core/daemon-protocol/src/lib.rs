//! IPC protocol types and validation for penlab-daemon.
//!
//! This crate is shared by the daemon and its clients (the pen, the simulator,
//! dashboards) to prevent schema drift. The daemon remains the authority on
//! validation, but clients can reuse the same types to construct valid requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

pub const ERROR_INVALID_JSON: &str = "invalid_json";
pub const ERROR_INVALID_PARAMS: &str = "invalid_params";
pub const ERROR_MISSING_FIELD: &str = "missing_field";
pub const ERROR_NOT_FOUND: &str = "not_found";
pub const ERROR_STATE_CONFLICT: &str = "state_conflict";
pub const ERROR_IO: &str = "io_error";
pub const ERROR_TOO_MANY_CONNECTIONS: &str = "too_many_connections";

pub const CSV_HEADER: [&str; 8] = ["timestamp", "ax", "ay", "az", "gx", "gy", "gz", "temp"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    GetStatus,
    StartSession,
    StopSession,
    LabelSession,
    Ingest,
    /// Keeps the connection open as a live-feed observer.
    Subscribe,
    /// Keeps the connection open as the device channel.
    AttachDevice,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: None,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Presence of the pen as derived by the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PenState {
    #[default]
    Offline,
    /// Device socket is attached but no samples have arrived yet.
    Connected,
    /// Samples are actively streaming.
    Online,
}

impl PenState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PenState::Offline => "offline",
            PenState::Connected => "connected",
            PenState::Online => "online",
        }
    }
}

/// One inertial reading as sent by the device. Axes are optional here only so
/// that a missing axis produces a `missing_field` error naming it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SampleParams {
    #[serde(default)]
    pub ax: Option<f64>,
    #[serde(default)]
    pub ay: Option<f64>,
    #[serde(default)]
    pub az: Option<f64>,
    #[serde(default)]
    pub gx: Option<f64>,
    #[serde(default)]
    pub gy: Option<f64>,
    #[serde(default)]
    pub gz: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

/// A validated reading whose optional fields have not been resolved yet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleReading {
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    pub gx: f64,
    pub gy: f64,
    pub gz: f64,
    pub temp: Option<f64>,
    pub timestamp: Option<f64>,
}

impl SampleReading {
    /// Fills in `timestamp` (receipt time, epoch seconds) and `temp` (0.0)
    /// when the device left them out.
    pub fn resolve(self, received_at: f64) -> Sample {
        Sample {
            timestamp: self.timestamp.unwrap_or(received_at),
            ax: self.ax,
            ay: self.ay,
            az: self.az,
            gx: self.gx,
            gy: self.gy,
            gz: self.gz,
            temp: self.temp.unwrap_or(0.0),
        }
    }
}

/// Canonical, fully-populated sample. This is what gets recorded and broadcast.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub timestamp: f64,
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    pub gx: f64,
    pub gy: f64,
    pub gz: f64,
    pub temp: f64,
}

impl Sample {
    /// Values in `CSV_HEADER` order.
    pub fn columns(&self) -> [f64; 8] {
        [
            self.timestamp,
            self.ax,
            self.ay,
            self.az,
            self.gx,
            self.gy,
            self.gz,
            self.temp,
        ]
    }
}

/// Events pushed to live-feed observers, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    /// Welcome event sent once when an observer subscribes.
    Connection { message: String, pen_state: PenState },
    MpuData { data: Sample },
    PenState { state: PenState },
}

impl LiveEvent {
    pub fn welcome(pen_state: PenState) -> Self {
        LiveEvent::Connection {
            message: "Connected to live feed".to_string(),
            pen_state,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LiveEvent::Connection { .. } => "connection",
            LiveEvent::MpuData { .. } => "mpu_data",
            LiveEvent::PenState { .. } => "pen_state",
        }
    }
}

/// Outcome of an ingest request. Never an error for a well-formed sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestAck {
    Ok,
    Ignored { reason: String },
    /// The sample was broadcast but could not be persisted.
    Error { reason: String },
}

impl IngestAck {
    pub fn not_recording() -> Self {
        IngestAck::Ignored {
            reason: "not recording".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartSessionParams {
    #[serde(default)]
    pub shape: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelSessionParams {
    #[serde(default)]
    pub shape: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hand: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRequest {
    pub shape: String,
    pub quality: String,
    pub hand: Option<String>,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStarted {
    pub message: String,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStopped {
    pub message: String,
    pub shape: String,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionLabeled {
    pub message: String,
    pub moved_to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub server: String,
    pub recording: bool,
    #[serde(default)]
    pub shape: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    pub observer_count: usize,
    pub pen_state: PenState,
}

pub fn parse_sample(params: Value) -> Result<SampleReading, ErrorInfo> {
    let raw: SampleParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            ERROR_INVALID_PARAMS,
            format!("sample payload is invalid: {}", err),
        )
    })?;

    Ok(SampleReading {
        ax: require_number(raw.ax, "ax")?,
        ay: require_number(raw.ay, "ay")?,
        az: require_number(raw.az, "az")?,
        gx: require_number(raw.gx, "gx")?,
        gy: require_number(raw.gy, "gy")?,
        gz: require_number(raw.gz, "gz")?,
        temp: raw.temp,
        timestamp: raw.timestamp,
    })
}

pub fn parse_start_session(params: Option<Value>) -> Result<String, ErrorInfo> {
    let params: StartSessionParams = match params {
        Some(value) => serde_json::from_value(value).map_err(|err| {
            ErrorInfo::new(
                ERROR_INVALID_PARAMS,
                format!("start_session params are invalid: {}", err),
            )
        })?,
        None => StartSessionParams::default(),
    };
    let shape = require_string(params.shape, "shape")?;
    require_path_segment(&shape, "shape")?;
    Ok(shape)
}

pub fn parse_label_session(params: Option<Value>) -> Result<LabelRequest, ErrorInfo> {
    let params: LabelSessionParams = match params {
        Some(value) => serde_json::from_value(value).map_err(|err| {
            ErrorInfo::new(
                ERROR_INVALID_PARAMS,
                format!("label_session params are invalid: {}", err),
            )
        })?,
        None => LabelSessionParams::default(),
    };

    let shape = require_string(params.shape, "shape")?;
    require_path_segment(&shape, "shape")?;
    let quality = require_string(params.quality, "quality")?;
    require_path_segment(&quality, "quality")?;
    let hand = match params.hand {
        Some(hand) if !hand.trim().is_empty() => {
            require_path_segment(&hand, "hand")?;
            Some(hand)
        }
        _ => None,
    };
    let filename = require_string(params.filename, "filename")?;
    require_path_segment(&filename, "filename")?;

    Ok(LabelRequest {
        shape,
        quality,
        hand,
        filename,
    })
}

fn require_number(value: Option<f64>, field: &str) -> Result<f64, ErrorInfo> {
    value.ok_or_else(|| ErrorInfo::new(ERROR_MISSING_FIELD, format!("{} is required", field)))
}

fn require_string(value: Option<String>, field: &str) -> Result<String, ErrorInfo> {
    if let Some(candidate) = value {
        let trimmed = candidate.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    Err(ErrorInfo::new(
        ERROR_MISSING_FIELD,
        format!("{} is required", field),
    ))
}

// Labels and filenames become path components under the sessions root.
fn require_path_segment(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value == "." || value == ".." || value.contains(['/', '\\', '\0']) {
        return Err(ErrorInfo::new(
            ERROR_INVALID_PARAMS,
            format!("{} must be a single path segment", field),
        ));
    }
    Ok(())
}
