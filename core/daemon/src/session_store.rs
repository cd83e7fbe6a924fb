//! Recording session lifecycle and on-disk layout.
//!
//! `sessions/raw/<shape>_<YYYYMMDD_HHMMSS>.csv` holds in-progress and finished
//! recordings; labeling moves a finished file into
//! `sessions/labeled/<Shape>/<Quality>[/<Hand>]/`. The store is not internally
//! synchronized; `SharedState` owns it behind a single mutex.

use chrono::{DateTime, Local};
use fs_err as fs;
use fs_err::File;
use penlab_protocol::{Sample, CSV_HEADER};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};

const RAW_DIR: &str = "raw";
const LABELED_DIR: &str = "labeled";
const FILENAME_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone)]
pub struct SessionLayout {
    root: PathBuf,
}

impl SessionLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[cfg(test)]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join(RAW_DIR)
    }

    pub fn labeled_dir(&self) -> PathBuf {
        self.root.join(LABELED_DIR)
    }

    pub fn ensure(&self) -> CoreResult<()> {
        for dir in [self.raw_dir(), self.labeled_dir()] {
            fs::create_dir_all(&dir)
                .map_err(|err| CoreError::io("Failed to create sessions directory", err))?;
        }
        Ok(())
    }
}

struct ActiveSession {
    shape: String,
    filename: String,
    writer: File,
    rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedSession {
    pub shape: String,
    pub filename: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoppedSession {
    pub shape: String,
    pub filename: String,
    pub rows: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub recording: bool,
    pub shape: Option<String>,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Written,
    NotRecording,
}

pub struct SessionStore {
    layout: SessionLayout,
    // Some iff recording; the writer lives and dies with the session.
    active: Option<ActiveSession>,
}

impl SessionStore {
    pub fn new(layout: SessionLayout) -> Self {
        Self {
            layout,
            active: None,
        }
    }

    #[cfg(test)]
    pub fn layout(&self) -> &SessionLayout {
        &self.layout
    }

    /// Starts recording `shape`. A session that is already recording is
    /// flushed and closed first, so its file stays intact. A start whose file
    /// name is already taken (same shape within the same second) is refused
    /// and leaves the current session untouched.
    pub fn start(&mut self, shape: &str, now: DateTime<Local>) -> CoreResult<StartedSession> {
        let shape = shape.trim();
        if shape.is_empty() {
            return Err(CoreError::Validation("Shape not provided".to_string()));
        }

        let raw_dir = self.layout.raw_dir();
        let filename = format!("{}_{}.csv", shape, now.format(FILENAME_TIME_FORMAT));
        let path = raw_dir.join(&filename);
        if path.exists() {
            return Err(filename_taken(&filename));
        }

        if let Some(previous) = self.active.take() {
            warn!(
                shape = %previous.shape,
                filename = %previous.filename,
                rows = previous.rows,
                "Session already recording; closing it before starting a new one"
            );
            close_writer(previous);
        }

        fs::create_dir_all(&raw_dir)
            .map_err(|err| CoreError::io("Failed to create raw sessions directory", err))?;

        let mut writer = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::AlreadyExists => filename_taken(&filename),
                _ => CoreError::io("Failed to create session file", err),
            })?;
        let header = format!("{}\n", CSV_HEADER.join(","));
        writer
            .write_all(header.as_bytes())
            .and_then(|_| writer.sync_data())
            .map_err(|err| CoreError::io("Failed to write session header", err))?;

        info!(shape = %shape, filename = %filename, "Recording started");
        self.active = Some(ActiveSession {
            shape: shape.to_string(),
            filename: filename.clone(),
            writer,
            rows: 0,
        });

        Ok(StartedSession {
            shape: shape.to_string(),
            filename,
            path,
        })
    }

    /// Appends one row and syncs it to disk before returning. Idle is a no-op.
    pub fn append(&mut self, sample: &Sample) -> CoreResult<AppendOutcome> {
        let active = match self.active.as_mut() {
            Some(active) => active,
            None => return Ok(AppendOutcome::NotRecording),
        };

        let row = format_row(sample);
        active
            .writer
            .write_all(row.as_bytes())
            .and_then(|_| active.writer.sync_data())
            .map_err(|err| CoreError::io("Failed to append sample", err))?;
        active.rows += 1;
        Ok(AppendOutcome::Written)
    }

    pub fn stop(&mut self) -> CoreResult<StoppedSession> {
        let active = self
            .active
            .take()
            .ok_or_else(|| CoreError::StateConflict("No active recording".to_string()))?;

        let stopped = StoppedSession {
            shape: active.shape.clone(),
            filename: active.filename.clone(),
            rows: active.rows,
        };
        close_writer(active);
        info!(
            shape = %stopped.shape,
            filename = %stopped.filename,
            rows = stopped.rows,
            "Recording stopped"
        );
        Ok(stopped)
    }

    /// Moves a finished raw recording into the labeled tree. An existing file
    /// with the same name at the destination is replaced.
    pub fn label(
        &mut self,
        shape: &str,
        quality: &str,
        hand: Option<&str>,
        filename: &str,
    ) -> CoreResult<PathBuf> {
        if let Some(active) = &self.active {
            if active.filename == filename {
                return Err(CoreError::StateConflict(format!(
                    "Cannot label {} while it is being recorded",
                    filename
                )));
            }
        }

        let source = self.layout.raw_dir().join(filename);
        if !source.is_file() {
            return Err(CoreError::NotFound(filename.to_string()));
        }

        let mut dest_dir = self
            .layout
            .labeled_dir()
            .join(capitalize(shape))
            .join(capitalize(quality));
        if let Some(hand) = hand.map(str::trim).filter(|hand| !hand.is_empty()) {
            dest_dir = dest_dir.join(capitalize(hand));
        }
        fs::create_dir_all(&dest_dir)
            .map_err(|err| CoreError::io("Failed to create label directory", err))?;

        let destination = dest_dir.join(filename);
        if destination.exists() {
            debug!(path = %destination.display(), "Replacing existing labeled file");
        }
        fs::rename(&source, &destination)
            .map_err(|err| CoreError::io("Failed to move session file", err))?;

        info!(
            filename = %filename,
            destination = %destination.display(),
            "Session labeled"
        );
        Ok(destination)
    }

    /// Swaps the active writer for a read-only handle so every append fails.
    #[cfg(test)]
    pub(crate) fn break_writer(&mut self) {
        if let Some(active) = self.active.as_mut() {
            let path = self.layout.raw_dir().join(&active.filename);
            active.writer = File::open(path).expect("reopen session file read-only");
        }
    }

    pub fn status(&self) -> SessionStatus {
        match &self.active {
            Some(active) => SessionStatus {
                recording: true,
                shape: Some(active.shape.clone()),
                filename: Some(active.filename.clone()),
            },
            None => SessionStatus::default(),
        }
    }
}

fn filename_taken(filename: &str) -> CoreError {
    CoreError::StateConflict(format!(
        "Session file {} already exists; wait a second before starting again",
        filename
    ))
}

fn close_writer(mut active: ActiveSession) {
    if let Err(err) = active.writer.flush().and_then(|_| active.writer.sync_all()) {
        warn!(
            error = %err,
            filename = %active.filename,
            "Failed to flush session file on close"
        );
    }
}

fn format_row(sample: &Sample) -> String {
    let mut row = sample
        .columns()
        .iter()
        .map(|value| format!("{:?}", value))
        .collect::<Vec<_>>()
        .join(",");
    row.push('\n');
    row
}

/// Uppercases the first character and lowercases the rest ("GOOD" -> "Good").
pub fn capitalize(segment: &str) -> String {
    let mut chars = segment.trim().chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}
