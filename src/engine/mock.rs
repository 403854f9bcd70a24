//! Scripted engine used by the unit tests.
//!
//! [`MockSpawner`] stands in for a real transport adapter: it hands out
//! [`MockEngine`]s and keeps a [`MockControl`] for every engine it
//! produced, so a test can configure a session and then play the
//! transport's part by emitting events through the captured sink.

use std::sync::{Arc, Mutex};

use super::{EngineError, EngineEvent, EngineSpawner, EventSink, Result, UploadConfig, UploadEngine};

#[derive(Default)]
pub(crate) struct MockSpawner {
    spawned: Mutex<Vec<MockControl>>,
    fail_next: Mutex<bool>,
}

impl MockSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Control handle for the most recently spawned engine.
    pub fn last(&self) -> MockControl {
        self.spawned
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no engine spawned yet")
    }

    pub fn spawned_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    /// Make the next `spawn` call fail, as a transport adapter would when
    /// its backend is unavailable.
    pub fn fail_next(&self) {
        *self.fail_next.lock().unwrap() = true;
    }
}

impl EngineSpawner for MockSpawner {
    fn spawn(&self, config: &UploadConfig) -> Result<Box<dyn UploadEngine>> {
        if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
            return Err(EngineError::Construct(format!(
                "no transport reachable at {}",
                config.url
            )));
        }
        let state = Arc::new(Mutex::new(MockState::default()));
        self.spawned
            .lock()
            .unwrap()
            .push(MockControl { state: state.clone() });
        Ok(Box::new(MockEngine { state }))
    }
}

#[derive(Default)]
struct MockState {
    sink: Option<EventSink>,
    started: bool,
    stopped: bool,
    unbound: bool,
}

pub(crate) struct MockEngine {
    state: Arc<Mutex<MockState>>,
}

impl UploadEngine for MockEngine {
    fn bind(&mut self, sink: EventSink) {
        self.state.lock().unwrap().sink = Some(sink);
    }

    fn start(&mut self) {
        self.state.lock().unwrap().started = true;
    }

    fn stop(&mut self) {
        self.state.lock().unwrap().stopped = true;
    }

    // Deliberately keeps the sink: a real transport's teardown is
    // asynchronous and may deliver events after unbind. Tests rely on this
    // to exercise the stale-callback guard.
    fn unbind(&mut self) {
        self.state.lock().unwrap().unbound = true;
    }
}

/// Test-side handle onto one spawned [`MockEngine`].
#[derive(Clone)]
pub(crate) struct MockControl {
    state: Arc<Mutex<MockState>>,
}

impl MockControl {
    /// Deliver an event through the bound sink, as the transport would.
    ///
    /// The sink is cloned out of the lock first: handling the event may
    /// re-enter the engine (release unbinds it) and must not deadlock.
    pub fn emit(&self, event: EngineEvent) {
        let sink = self.state.lock().unwrap().sink.clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().unwrap().started
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }

    pub fn is_unbound(&self) -> bool {
        self.state.lock().unwrap().unbound
    }
}
