//! Orchestration for concurrent file-upload sessions.
//!
//! This crate tracks upload sessions run by a pluggable transport engine.
//! It moves no bytes itself; what it owns is:
//!
//! - The configure/orphan lifecycle binding sessions to their engines,
//!   with drain-before-release semantics
//! - Aggregate progress across every active session
//! - Normalization of raw transport responses into one result shape
//! - Dispatch of per-file failures to a registered consumer target,
//!   with an awaitable outcome per file
//!
//! The transport itself is an external collaborator, adapted behind
//! [`engine::UploadEngine`]; see the `engine` module for the contract
//! adapters implement.

pub mod engine;
pub mod queue;

pub use engine::{
    EngineError, EngineEvent, EngineSpawner, EventSink, FileInfo, RawResponse, Totals,
    UploadConfig, UploadEngine,
};
pub use queue::{
    ActionTarget, DEFAULT_ERROR_ACTION, UploadQueue,
    models::{FileHandle, FileRecord, FileState, UploadFailure},
    response::{ResponseBody, UploadResponse, XmlDocument, XmlElement, XmlNode, parse_response},
    session::{Session, SessionState},
};
