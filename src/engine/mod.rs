//! Engine abstraction for upload transports.
//!
//! The queue never talks to a concrete transport library directly. A
//! transport is adapted behind [`UploadEngine`]: construction with an
//! [`UploadConfig`] through an [`EngineSpawner`], a bind operation that
//! hands the engine an [`EventSink`], and start/stop control. The engine
//! reports back exclusively through [`EngineEvent`] values pushed into the
//! sink — byte counts, file lifecycle, and the raw transport response.
//!
//! Adapters own everything below that line: HTTP method selection,
//! chunking, multipart encoding, retries.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
pub(crate) mod mock;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine construction failed: {0}")]
    Construct(String),

    #[error("no engine available for transport '{0}'")]
    UnknownTransport(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Configuration handed to an engine at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Destination the engine uploads to
    pub url: String,
    /// Extra request headers for the transport
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    /// Split files into parts of this many bytes, transport permitting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    /// How many times the transport may retry a failed part
    pub max_retries: u32,
}

impl UploadConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: None,
            chunk_size: None,
            max_retries: 0,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = Some(bytes);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Latest byte and file counts reported by an engine.
///
/// Replaced wholesale on every totals event. The session stores the most
/// recent snapshot and never recomputes it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    /// Combined size of every queued file, in bytes
    pub size: u64,
    /// Bytes transferred so far
    pub loaded: u64,
    /// Files waiting to start
    pub queued: u32,
    /// Files currently in flight
    pub active: u32,
}

impl Totals {
    /// Percent transferred for this engine alone.
    ///
    /// Returns None when the engine has not reported a size yet.
    pub fn percentage(&self) -> Option<f32> {
        if self.size == 0 {
            None
        } else {
            Some((self.loaded as f32 / self.size as f32) * 100.0)
        }
    }

    /// True when the engine has nothing queued and nothing in flight.
    pub fn is_drained(&self) -> bool {
        self.queued == 0 && self.active == 0
    }
}

/// Descriptor for one file as the engine sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Engine-assigned file id
    pub id: String,
    pub name: String,
    /// Size in bytes
    pub size: u64,
}

/// Raw transport response as delivered by an engine, before normalization.
///
/// See [`crate::queue::response::parse_response`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawResponse {
    pub status: u16,
    /// Undecoded response body
    pub body: String,
    /// Raw header blob, one `name: value` pair per line
    pub headers: String,
}

/// Events an engine pushes into the sink it was bound with.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Files entered the engine's internal queue
    FilesAdded(Vec<FileInfo>),
    /// Progress for a single file
    FileProgress { file: String, percent: u8 },
    /// The engine's aggregate totals changed
    TotalsChanged(Totals),
    /// One file finished successfully, optionally carrying the transport
    /// response
    FileUploaded {
        file: String,
        response: Option<RawResponse>,
    },
    /// One file failed. The descriptor is complete because the engine may
    /// report failure for a file it never announced via `FilesAdded`.
    FileFailed { file: FileInfo, message: String },
    /// Every queued file has finished, successfully or not
    Complete,
}

/// Callback through which an engine reports events.
///
/// Invoked synchronously by the engine; all queue and session mutation for
/// one event happens inside the invocation.
pub type EventSink = Arc<dyn Fn(EngineEvent) + Send + Sync>;

/// Capability interface over one concrete upload transport.
pub trait UploadEngine: Send {
    /// Register the sink the engine reports through. Called once, before
    /// `start`.
    fn bind(&mut self, sink: EventSink);

    /// Begin accepting and transferring files.
    fn start(&mut self);

    /// Stop transferring. In-flight work may still complete.
    fn stop(&mut self);

    /// Drop the sink. Events delivered afterwards are the engine's bug; the
    /// session guards against them regardless.
    fn unbind(&mut self);
}

/// Factory for engines, one implementation per transport library.
pub trait EngineSpawner: Send + Sync {
    fn spawn(&self, config: &UploadConfig) -> Result<Box<dyn UploadEngine>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_percentage_needs_a_size() {
        let totals = Totals::default();
        assert!(totals.percentage().is_none());

        let totals = Totals {
            size: 4000,
            loaded: 1000,
            ..Default::default()
        };
        assert_eq!(totals.percentage(), Some(25.0));
    }

    #[test]
    fn totals_drained_ignores_bytes() {
        let totals = Totals {
            size: 4000,
            loaded: 4000,
            queued: 0,
            active: 0,
        };
        assert!(totals.is_drained());

        let totals = Totals {
            queued: 0,
            active: 1,
            ..Default::default()
        };
        assert!(!totals.is_drained());
    }

    #[test]
    fn config_builders_accumulate() {
        let config = UploadConfig::new("https://uploads.example/receive")
            .with_header("authorization", "Bearer token")
            .with_chunk_size(512 * 1024)
            .with_max_retries(3);

        assert_eq!(config.url, "https://uploads.example/receive");
        assert_eq!(
            config.headers.as_ref().and_then(|h| h.get("authorization")),
            Some(&"Bearer token".to_string())
        );
        assert_eq!(config.chunk_size, Some(512 * 1024));
        assert_eq!(config.max_retries, 3);
    }
}
