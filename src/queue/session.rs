//! Upload session wrapper.
//!
//! One [`Session`] wraps one engine instance for its whole life: it stores
//! the latest totals snapshot the engine reported, materializes per-file
//! records, and settles per-file outcomes. The queue owns registration and
//! release; the session owns everything the engine says about itself.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};
use ulid::Ulid;

use crate::engine::{EngineEvent, EventSink, Totals, UploadEngine};
use crate::queue::models::{FileHandle, UploadFailure};
use crate::queue::response::parse_response;

/// Lifecycle of a session inside its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered and receiving events
    Bound,
    /// The consumer no longer wants it; draining in-flight files
    OrphanPending,
    /// Unbound from its engine and removed from the queue. Terminal.
    Released,
}

/// What `orphan` did with a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OrphanOutcome {
    /// Nothing was in flight; released on the spot
    Released,
    /// In-flight files remain; released once the engine reports completion
    Draining,
    /// Already draining or already released
    Ignored,
}

/// Side effects of applying one engine event, for the queue to act on
/// after the session's own state is settled.
#[derive(Default)]
pub(crate) struct Applied {
    /// File whose failure must be dispatched to the target
    pub failed: Option<FileHandle>,
    /// The engine reported every file finished
    pub complete: bool,
    /// Aggregate progress inputs changed
    pub totals_changed: bool,
}

struct SessionInner {
    engine: Option<Box<dyn UploadEngine>>,
    totals: Totals,
    files: Vec<FileHandle>,
    state: SessionState,
}

pub(crate) struct SessionShared {
    id: Ulid,
    created_at: DateTime<Utc>,
    inner: Mutex<SessionInner>,
}

/// One bound engine plus its tracked files and totals.
///
/// Cloneable handle; the queue and the configuring consumer observe the
/// same underlying session.
#[derive(Clone)]
pub struct Session {
    pub(crate) shared: Arc<SessionShared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("created_at", &self.shared.created_at)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(engine: Box<dyn UploadEngine>) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                id: Ulid::new(),
                created_at: Utc::now(),
                inner: Mutex::new(SessionInner {
                    engine: Some(engine),
                    totals: Totals::default(),
                    files: Vec::new(),
                    state: SessionState::Bound,
                }),
            }),
        }
    }

    pub fn id(&self) -> Ulid {
        self.shared.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.shared.created_at
    }

    /// Latest totals snapshot reported by the engine.
    pub fn totals(&self) -> Totals {
        self.shared.inner.lock().unwrap().totals
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().unwrap().state
    }

    pub fn is_released(&self) -> bool {
        self.state() == SessionState::Released
    }

    /// Handles onto every file the session knows about, in arrival order.
    pub fn files(&self) -> Vec<FileHandle> {
        self.shared.inner.lock().unwrap().files.clone()
    }

    pub fn file(&self, id: &str) -> Option<FileHandle> {
        self.shared
            .inner
            .lock()
            .unwrap()
            .files
            .iter()
            .find(|file| file.id() == id)
            .cloned()
    }

    /// Hand the engine its sink and start it.
    pub(crate) fn bind(&self, sink: EventSink) {
        let mut inner = self.shared.inner.lock().unwrap();
        if let Some(engine) = inner.engine.as_mut() {
            engine.bind(sink);
            engine.start();
        }
    }

    /// Apply one engine event. Events for a released session are dropped:
    /// engine teardown may lag the unbind.
    pub(crate) fn apply(&self, event: EngineEvent) -> Applied {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state == SessionState::Released {
            trace!(id = %self.shared.id, ?event, "event for released session dropped");
            return Applied::default();
        }

        let mut applied = Applied::default();
        match event {
            EngineEvent::FilesAdded(files) => {
                for info in files {
                    if inner.files.iter().any(|file| file.id() == info.id) {
                        continue;
                    }
                    debug!(
                        id = %self.shared.id,
                        file = %info.id,
                        name = %info.name,
                        size = info.size,
                        "file queued"
                    );
                    inner.files.push(FileHandle::new(info));
                }
            }
            EngineEvent::FileProgress { file, percent } => {
                match inner.files.iter().find(|f| f.id() == file) {
                    Some(handle) => handle.set_progress(percent),
                    None => trace!(id = %self.shared.id, file = %file, "progress for unknown file dropped"),
                }
            }
            EngineEvent::TotalsChanged(totals) => {
                trace!(
                    id = %self.shared.id,
                    loaded = totals.loaded,
                    size = totals.size,
                    queued = totals.queued,
                    active = totals.active,
                    "totals updated"
                );
                inner.totals = totals;
                applied.totals_changed = true;
            }
            EngineEvent::FileUploaded { file, response } => {
                match inner.files.iter().find(|f| f.id() == file) {
                    Some(handle) => {
                        handle.resolve(response.as_ref().map(parse_response));
                        debug!(id = %self.shared.id, file = %file, "file uploaded");
                    }
                    None => trace!(id = %self.shared.id, file = %file, "completion for unknown file dropped"),
                }
            }
            EngineEvent::FileFailed { file, message } => {
                // The failure may name a file the engine never announced;
                // materialize a record for it so the target sees real state.
                let known = inner.files.iter().find(|f| f.id() == file.id).cloned();
                let handle = match known {
                    Some(handle) => handle,
                    None => {
                        let handle = FileHandle::new(file.clone());
                        inner.files.push(handle.clone());
                        handle
                    }
                };
                handle.reject(UploadFailure {
                    file: file.id,
                    name: file.name,
                    message,
                });
                applied.failed = Some(handle);
            }
            EngineEvent::Complete => {
                debug!(id = %self.shared.id, "engine reported all files finished");
                applied.complete = true;
            }
        }
        applied
    }

    /// Mark the consumer's intent to release this session.
    pub(crate) fn mark_orphan(&self) -> OrphanOutcome {
        let mut inner = self.shared.inner.lock().unwrap();
        match inner.state {
            SessionState::Released | SessionState::OrphanPending => OrphanOutcome::Ignored,
            SessionState::Bound => {
                if inner.totals.is_drained() {
                    self.release_locked(&mut inner);
                    OrphanOutcome::Released
                } else {
                    inner.state = SessionState::OrphanPending;
                    OrphanOutcome::Draining
                }
            }
        }
    }

    /// Tear down the engine and mark the session released.
    pub(crate) fn release(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        self.release_locked(&mut inner);
    }

    fn release_locked(&self, inner: &mut SessionInner) {
        if inner.state == SessionState::Released {
            return;
        }
        if let Some(mut engine) = inner.engine.take() {
            engine.stop();
            engine.unbind();
        }
        // Settle anything the engine left hanging so no waiter blocks
        // forever on a session that no longer exists.
        for file in &inner.files {
            file.reject_if_unsettled("session released before the upload finished");
        }
        inner.state = SessionState::Released;
        debug!(id = %self.shared.id, "session released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockSpawner;
    use crate::engine::{EngineSpawner, FileInfo, RawResponse, UploadConfig};

    fn mock_session() -> (Session, Arc<MockSpawner>) {
        let spawner = MockSpawner::new();
        let engine = spawner
            .spawn(&UploadConfig::new("https://uploads.example/receive"))
            .unwrap();
        (Session::new(engine), spawner)
    }

    fn file(id: &str, size: u64) -> FileInfo {
        FileInfo {
            id: id.into(),
            name: format!("{id}.bin"),
            size,
        }
    }

    #[test]
    fn totals_are_stored_not_recomputed() {
        let (session, _spawner) = mock_session();
        assert_eq!(session.totals(), Totals::default());

        let totals = Totals {
            size: 9000,
            loaded: 4500,
            queued: 2,
            active: 1,
        };
        let applied = session.apply(EngineEvent::TotalsChanged(totals));
        assert!(applied.totals_changed);
        assert_eq!(session.totals(), totals);
    }

    #[test]
    fn added_files_get_records_and_progress() {
        let (session, _spawner) = mock_session();
        session.apply(EngineEvent::FilesAdded(vec![file("a", 100), file("b", 200)]));
        assert_eq!(session.files().len(), 2);

        session.apply(EngineEvent::FileProgress {
            file: "a".into(),
            percent: 60,
        });
        let handle = session.file("a").unwrap();
        assert_eq!(handle.percent(), 60);

        // Re-announcing a file must not duplicate its record.
        session.apply(EngineEvent::FilesAdded(vec![file("a", 100)]));
        assert_eq!(session.files().len(), 2);
    }

    #[tokio::test]
    async fn uploaded_files_store_the_normalized_response() {
        let (session, _spawner) = mock_session();
        session.apply(EngineEvent::FilesAdded(vec![file("a", 100)]));
        session.apply(EngineEvent::FileUploaded {
            file: "a".into(),
            response: Some(RawResponse {
                status: 201,
                body: "<Receipt>stored</Receipt>".into(),
                headers: "Content-Type: text/xml".into(),
            }),
        });

        let handle = session.file("a").unwrap();
        assert_eq!(handle.outcome().await, Ok("a".to_string()));

        let response = handle.response().expect("response should be stored");
        assert_eq!(response.status, 201);
        let doc = response.body.as_xml().expect("body should be XML");
        assert_eq!(doc.elements_by_tag_name("Receipt")[0].text(), "stored");
    }

    #[test]
    fn stale_events_after_release_are_dropped() {
        let (session, spawner) = mock_session();
        session.apply(EngineEvent::TotalsChanged(Totals {
            size: 1000,
            loaded: 500,
            ..Default::default()
        }));

        session.release();
        assert!(session.is_released());
        assert!(spawner.last().is_stopped());
        assert!(spawner.last().is_unbound());

        let before = session.totals();
        let applied = session.apply(EngineEvent::TotalsChanged(Totals {
            size: 1,
            loaded: 1,
            ..Default::default()
        }));
        assert!(!applied.totals_changed);
        assert_eq!(session.totals(), before, "stale totals must not stick");

        let applied = session.apply(EngineEvent::FilesAdded(vec![file("late", 10)]));
        assert!(applied.failed.is_none());
        assert!(session.files().is_empty(), "stale file must not appear");
    }

    #[tokio::test]
    async fn release_settles_files_the_engine_left_hanging() {
        let (session, _spawner) = mock_session();
        session.apply(EngineEvent::FilesAdded(vec![file("a", 100)]));
        let handle = session.file("a").unwrap();

        session.release();
        let failure = handle.outcome().await.unwrap_err();
        assert_eq!(failure.file, "a");
        assert!(failure.message.contains("released"));
    }

    #[test]
    fn orphan_on_a_drained_session_releases_immediately() {
        let (session, _spawner) = mock_session();
        assert_eq!(session.mark_orphan(), OrphanOutcome::Released);
        assert!(session.is_released());
        assert_eq!(session.mark_orphan(), OrphanOutcome::Ignored);
    }

    #[test]
    fn orphan_with_work_in_flight_drains_first() {
        let (session, _spawner) = mock_session();
        session.apply(EngineEvent::TotalsChanged(Totals {
            queued: 1,
            ..Default::default()
        }));

        assert_eq!(session.mark_orphan(), OrphanOutcome::Draining);
        assert_eq!(session.state(), SessionState::OrphanPending);
        assert_eq!(session.mark_orphan(), OrphanOutcome::Ignored);
    }
}
