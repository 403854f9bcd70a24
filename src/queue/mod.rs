//! Upload queue: session lifecycle, aggregate progress, error dispatch.
//!
//! Consumers obtain sessions with [`UploadQueue::configure`], hand them to
//! whoever drives the transport, and signal with [`UploadQueue::orphan`]
//! when a session is no longer wanted. An orphaned session stays registered
//! until its engine drains, so aggregate progress never loses in-flight
//! bytes. Per-file failures are pushed synchronously to a registered
//! [`ActionTarget`]; retrying is the target's call.

pub mod models;
pub mod response;
pub mod session;

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::engine::{EngineEvent, EngineSpawner, EventSink, Result, UploadConfig};
use models::FileHandle;
use session::{OrphanOutcome, Session, SessionState};

/// Action name used for error dispatch unless overridden with
/// [`UploadQueue::set_error_action`].
pub const DEFAULT_ERROR_ACTION: &str = "uploadError";

/// Consumer-side receiver for queue notifications.
///
/// `send_action` is invoked synchronously from the event turn that observed
/// the failure. The file's `error` field is already set when the call
/// happens; awaiting the file's outcome from the target yields the same
/// failure, which is the hook for consumer-driven retries.
pub trait ActionTarget: Send + Sync {
    fn send_action(&self, action: &str, file: &FileHandle);
}

struct QueueInner {
    sessions: Vec<Session>,
    target: Option<Arc<dyn ActionTarget>>,
    error_action: String,
    progress_tx: watch::Sender<u8>,
}

/// Set of concurrently active upload sessions sharing one progress figure.
#[derive(Clone)]
pub struct UploadQueue {
    spawner: Arc<dyn EngineSpawner>,
    inner: Arc<Mutex<QueueInner>>,
}

impl UploadQueue {
    pub fn new(spawner: Arc<dyn EngineSpawner>) -> Self {
        let (progress_tx, _) = watch::channel(0);
        Self {
            spawner,
            inner: Arc::new(Mutex::new(QueueInner {
                sessions: Vec::new(),
                target: None,
                error_action: DEFAULT_ERROR_ACTION.to_string(),
                progress_tx,
            })),
        }
    }

    /// Register the consumer that receives error dispatches.
    pub fn set_target(&self, target: Arc<dyn ActionTarget>) {
        self.inner.lock().unwrap().target = Some(target);
    }

    /// Override the action name used for error dispatch.
    pub fn set_error_action(&self, action: impl Into<String>) {
        self.inner.lock().unwrap().error_action = action.into();
    }

    /// Number of sessions currently bound or draining.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Construct an engine-backed session and register it.
    ///
    /// Every configured session participates in [`UploadQueue::progress`]
    /// until it is released.
    pub fn configure(&self, config: UploadConfig) -> Result<Session> {
        let engine = self.spawner.spawn(&config)?;
        let session = Session::new(engine);
        session.bind(self.sink_for(&session));

        let mut inner = self.inner.lock().unwrap();
        inner.sessions.push(session.clone());
        info!(
            id = %session.id(),
            url = %config.url,
            sessions = inner.sessions.len(),
            "upload session configured"
        );
        Ok(session)
    }

    /// Signal that `session` is no longer wanted.
    ///
    /// Releases immediately when the engine has nothing queued or in
    /// flight; otherwise the session drains first and is released when the
    /// engine reports completion, regardless of per-file outcomes.
    /// Orphaning a draining or already-released session is a no-op.
    pub fn orphan(&self, session: &Session) {
        let mut inner = self.inner.lock().unwrap();
        match session.mark_orphan() {
            OrphanOutcome::Released => {
                inner
                    .sessions
                    .retain(|s| !Arc::ptr_eq(&s.shared, &session.shared));
                info!(
                    id = %session.id(),
                    sessions = inner.sessions.len(),
                    "idle session released"
                );
            }
            OrphanOutcome::Draining => {
                debug!(id = %session.id(), "session orphaned, draining");
            }
            OrphanOutcome::Ignored => {
                trace!(id = %session.id(), "orphan on inactive session ignored");
            }
        }
    }

    /// Aggregate progress across all bound sessions, rounded to 0–100.
    ///
    /// Computed from the live totals snapshots on every call; 0 while no
    /// session has reported a size.
    pub fn progress(&self) -> u8 {
        let inner = self.inner.lock().unwrap();
        Self::progress_locked(&inner)
    }

    /// Watch channel carrying the aggregate progress, refreshed on every
    /// totals event from any session.
    pub fn progress_watch(&self) -> watch::Receiver<u8> {
        self.inner.lock().unwrap().progress_tx.subscribe()
    }

    fn progress_locked(inner: &QueueInner) -> u8 {
        let (loaded, size) = inner
            .sessions
            .iter()
            .fold((0u64, 0u64), |(loaded, size), session| {
                let totals = session.totals();
                (loaded + totals.loaded, size + totals.size)
            });
        if size == 0 {
            return 0;
        }
        ((loaded as f64 / size as f64) * 100.0).round() as u8
    }

    fn sink_for(&self, session: &Session) -> EventSink {
        let inner = Arc::downgrade(&self.inner);
        let shared = Arc::downgrade(&session.shared);
        Arc::new(move |event| {
            let (Some(inner), Some(shared)) = (inner.upgrade(), shared.upgrade()) else {
                trace!("event after queue teardown dropped");
                return;
            };
            Self::on_engine_event(&inner, &Session { shared }, event);
        })
    }

    /// One engine event, start to finish: the session settles its own
    /// state, then the queue acts on the side effects. The target dispatch
    /// runs after the locks drop but still synchronously, in the same turn.
    fn on_engine_event(inner: &Arc<Mutex<QueueInner>>, session: &Session, event: EngineEvent) {
        let applied = session.apply(event);

        let mut dispatch = None;
        {
            let mut queue = inner.lock().unwrap();
            if applied.complete && session.state() == SessionState::OrphanPending {
                session.release();
                queue
                    .sessions
                    .retain(|s| !Arc::ptr_eq(&s.shared, &session.shared));
                info!(
                    id = %session.id(),
                    sessions = queue.sessions.len(),
                    "drained session released"
                );
            }
            if let Some(file) = applied.failed {
                match queue.target.clone() {
                    Some(target) => {
                        dispatch = Some((target, queue.error_action.clone(), file));
                    }
                    None => warn!(
                        id = %session.id(),
                        file = %file.id(),
                        "file failed with no target registered"
                    ),
                }
            }
            if applied.totals_changed || applied.complete {
                let progress = Self::progress_locked(&queue);
                let _ = queue.progress_tx.send(progress);
            }
        }

        if let Some((target, action, file)) = dispatch {
            target.send_action(&action, &file);
        }
    }
}
