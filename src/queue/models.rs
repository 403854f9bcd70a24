//! Per-file data model for upload sessions.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::engine::FileInfo;
use crate::queue::response::UploadResponse;

/// Lifecycle of a single file inside a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileState {
    /// Queued but not started yet
    #[default]
    Queued,
    /// Bytes are moving
    Uploading,
    /// Finished successfully
    Uploaded,
    /// Failed with a transport error
    Failed,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "Queued"),
            Self::Uploading => write!(f, "Uploading"),
            Self::Uploaded => write!(f, "Uploaded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Failure payload for one file, as surfaced to targets and outcome
/// handles. The message passes through verbatim from the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("upload of '{name}' ({file}) failed: {message}")]
pub struct UploadFailure {
    /// Engine-assigned file id
    pub file: String,
    pub name: String,
    pub message: String,
}

/// State tracked for one file in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Engine-assigned file id
    pub id: String,
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Percent transferred, 0–100
    pub percent: u8,
    pub state: FileState,
    /// Set before any error dispatch happens, so state reflects the failure
    /// even when nobody awaits the outcome
    pub error: Option<UploadFailure>,
    /// Normalized transport response, once the file finished and the engine
    /// reported one
    #[serde(skip)]
    pub response: Option<UploadResponse>,
}

impl FileRecord {
    fn from_info(info: FileInfo) -> Self {
        Self {
            id: info.id,
            name: info.name,
            size: info.size,
            percent: 0,
            state: FileState::Queued,
            error: None,
            response: None,
        }
    }
}

struct FileCell {
    record: FileRecord,
    outcome: Option<Result<String, UploadFailure>>,
    waiters: Vec<oneshot::Sender<Result<String, UploadFailure>>>,
}

impl FileCell {
    // Single resolution: the first settle wins, later ones are dropped.
    fn settle(&mut self, outcome: Result<String, UploadFailure>) {
        if self.outcome.is_some() {
            return;
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
        self.outcome = Some(outcome);
    }
}

/// Shared handle onto one file's record and outcome.
///
/// Cloneable; the session, the queue's error dispatch, and the consumer all
/// observe the same underlying record.
#[derive(Clone)]
pub struct FileHandle {
    cell: Arc<Mutex<FileCell>>,
}

impl FileHandle {
    pub(crate) fn new(info: FileInfo) -> Self {
        Self {
            cell: Arc::new(Mutex::new(FileCell {
                record: FileRecord::from_info(info),
                outcome: None,
                waiters: Vec::new(),
            })),
        }
    }

    pub fn id(&self) -> String {
        self.cell.lock().unwrap().record.id.clone()
    }

    /// Snapshot of the current record.
    pub fn record(&self) -> FileRecord {
        self.cell.lock().unwrap().record.clone()
    }

    pub fn state(&self) -> FileState {
        self.cell.lock().unwrap().record.state
    }

    pub fn percent(&self) -> u8 {
        self.cell.lock().unwrap().record.percent
    }

    pub fn error(&self) -> Option<UploadFailure> {
        self.cell.lock().unwrap().record.error.clone()
    }

    /// Normalized transport response, when the engine delivered one.
    pub fn response(&self) -> Option<UploadResponse> {
        self.cell.lock().unwrap().record.response.clone()
    }

    /// Await this file's outcome.
    ///
    /// Resolves with the file id on success and with the failure payload on
    /// error. A handle consulted after the file already settled resolves
    /// immediately from the stored outcome; nothing is pre-allocated per
    /// file before someone asks.
    pub async fn outcome(&self) -> Result<String, UploadFailure> {
        let (rx, dropped) = {
            let mut cell = self.cell.lock().unwrap();
            if let Some(outcome) = &cell.outcome {
                return outcome.clone();
            }
            let (tx, rx) = oneshot::channel();
            cell.waiters.push(tx);
            let dropped = UploadFailure {
                file: cell.record.id.clone(),
                name: cell.record.name.clone(),
                message: "session dropped before the upload finished".into(),
            };
            (rx, dropped)
        };
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(dropped),
        }
    }

    pub(crate) fn set_progress(&self, percent: u8) {
        let mut cell = self.cell.lock().unwrap();
        if cell.outcome.is_some() {
            return;
        }
        cell.record.percent = percent;
        if cell.record.state == FileState::Queued {
            cell.record.state = FileState::Uploading;
        }
    }

    pub(crate) fn resolve(&self, response: Option<UploadResponse>) {
        let mut cell = self.cell.lock().unwrap();
        if cell.outcome.is_some() {
            return;
        }
        cell.record.percent = 100;
        cell.record.state = FileState::Uploaded;
        cell.record.response = response;
        let id = cell.record.id.clone();
        cell.settle(Ok(id));
    }

    pub(crate) fn reject(&self, failure: UploadFailure) {
        let mut cell = self.cell.lock().unwrap();
        if cell.outcome.is_some() {
            return;
        }
        cell.record.state = FileState::Failed;
        cell.record.error = Some(failure.clone());
        cell.settle(Err(failure));
    }

    /// Reject with a synthesized failure unless the file already settled.
    /// Used at release time so no outcome waiter hangs forever.
    pub(crate) fn reject_if_unsettled(&self, message: &str) {
        let failure = {
            let cell = self.cell.lock().unwrap();
            if cell.outcome.is_some() {
                return;
            }
            UploadFailure {
                file: cell.record.id.clone(),
                name: cell.record.name.clone(),
                message: message.into(),
            }
        };
        self.reject(failure);
    }
}
