//! Minimal asynchronous change engine.
//!
//! Changes are units of work with a do handler, an optional undo handler
//! run when the do handler fails, and an optional cleanup handler that
//! always runs once the change is final. A single worker thread executes
//! handlers outside the engine lock; callers can block until a change is
//! ready. This is deliberately small, just enough scheduling for the
//! external-operation coordinator.

use log::warn;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

pub type HandlerResult = Result<(), String>;
pub type Handler = Arc<dyn Fn(&str) -> HandlerResult + Send + Sync>;

pub struct ChangeHandlers {
    pub run: Handler,
    pub undo: Option<Handler>,
    pub cleanup: Option<Handler>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeStatus {
    Queued,
    Doing,
    Undoing,
    Done,
    Error,
}

impl ChangeStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, ChangeStatus::Done | ChangeStatus::Error)
    }
}

#[derive(Clone, Debug)]
pub struct ChangeInfo {
    pub id: String,
    pub kind: String,
    pub status: ChangeStatus,
    pub err: Option<String>,
}

struct EngineState {
    next_id: u64,
    changes: HashMap<String, ChangeInfo>,
    queue: VecDeque<(String, ChangeHandlers)>,
    stopped: bool,
}

struct Inner {
    state: Mutex<EngineState>,
    cond: Condvar,
}

pub struct ChangeEngine {
    inner: Arc<Inner>,
}

impl ChangeEngine {
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(EngineState {
                next_id: 0,
                changes: HashMap::new(),
                queue: VecDeque::new(),
                stopped: false,
            }),
            cond: Condvar::new(),
        });
        let worker = inner.clone();
        // not joined on drop, the worker may be parked inside a blocking
        // handler; it exits once idle after stop
        thread::Builder::new()
            .name("change-engine".to_string())
            .spawn(move || worker_loop(worker))
            .expect("cannot spawn change engine worker");
        ChangeEngine { inner }
    }

    /// Allocates a change record without scheduling it, so the caller can
    /// finish its own bookkeeping keyed by the identifier first.
    pub fn reserve(&self, kind: &str) -> String {
        let mut state = self.inner.state.lock().expect("engine lock poisoned");
        state.next_id += 1;
        let id = state.next_id.to_string();
        state.changes.insert(
            id.clone(),
            ChangeInfo {
                id: id.clone(),
                kind: kind.to_string(),
                status: ChangeStatus::Queued,
                err: None,
            },
        );
        id
    }

    /// Schedules a reserved change for execution.
    pub fn queue(&self, id: &str, handlers: ChangeHandlers) {
        let mut state = self.inner.state.lock().expect("engine lock poisoned");
        state.queue.push_back((id.to_string(), handlers));
        self.inner.cond.notify_all();
    }

    /// Queues a new change and returns its identifier.
    pub fn ensure(&self, kind: &str, handlers: ChangeHandlers) -> String {
        let id = self.reserve(kind);
        self.queue(&id, handlers);
        id
    }

    /// Blocks until the change is ready and returns its final record.
    pub fn wait_ready(&self, id: &str) -> Option<ChangeInfo> {
        let mut state = self.inner.state.lock().expect("engine lock poisoned");
        loop {
            match state.changes.get(id) {
                None => return None,
                Some(c) if c.status.is_ready() => return Some(c.clone()),
                Some(_) => {
                    state = self
                        .inner
                        .cond
                        .wait(state)
                        .expect("engine lock poisoned");
                }
            }
        }
    }

}

impl Default for ChangeEngine {
    fn default() -> Self {
        ChangeEngine::new()
    }
}

impl Drop for ChangeEngine {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().expect("engine lock poisoned");
        state.stopped = true;
        self.inner.cond.notify_all();
    }
}

fn worker_loop(inner: Arc<Inner>) {
    loop {
        let (id, handlers) = {
            let mut state = inner.state.lock().expect("engine lock poisoned");
            loop {
                if state.stopped {
                    return;
                }
                if let Some(next) = state.queue.pop_front() {
                    break next;
                }
                state = inner.cond.wait(state).expect("engine lock poisoned");
            }
        };

        set_status(&inner, &id, ChangeStatus::Doing, None);
        let outcome = (handlers.run)(&id);
        match outcome {
            Ok(()) => set_status(&inner, &id, ChangeStatus::Done, None),
            Err(err) => {
                set_status(&inner, &id, ChangeStatus::Undoing, None);
                if let Some(undo) = &handlers.undo {
                    if let Err(undo_err) = undo(&id) {
                        warn!("undo of change {id} failed: {undo_err}");
                    }
                }
                set_status(&inner, &id, ChangeStatus::Error, Some(err));
            }
        }
        if let Some(cleanup) = &handlers.cleanup {
            if let Err(err) = cleanup(&id) {
                warn!("cleanup of change {id} failed: {err}");
            }
        }
    }
}

fn set_status(inner: &Inner, id: &str, status: ChangeStatus, err: Option<String>) {
    let mut state = inner.state.lock().expect("engine lock poisoned");
    if let Some(change) = state.changes.get_mut(id) {
        change.status = status;
        if err.is_some() {
            change.err = err;
        }
    }
    inner.cond.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    #[test]
    fn successful_change_runs_do_then_cleanup() {
        let engine = ChangeEngine::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let ran = order.clone();
        let cleaned = order.clone();
        let id = engine.ensure(
            "test",
            ChangeHandlers {
                run: Arc::new(move |_| {
                    ran.lock().unwrap().push("do");
                    Ok(())
                }),
                undo: None,
                cleanup: Some(Arc::new(move |_| {
                    cleaned.lock().unwrap().push("cleanup");
                    Ok(())
                })),
            },
        );
        let info = engine.wait_ready(&id).unwrap();
        assert_eq!(info.status, ChangeStatus::Done);
        assert!(info.err.is_none());
        // cleanup runs after readiness, give the worker a moment
        let deadline = Instant::now() + Duration::from_secs(5);
        while order.lock().unwrap().len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*order.lock().unwrap(), vec!["do", "cleanup"]);
    }

    #[test]
    fn failing_change_runs_undo_and_reports_error() {
        let engine = ChangeEngine::new();
        let undone = Arc::new(AtomicUsize::new(0));
        let counter = undone.clone();
        let id = engine.ensure(
            "test",
            ChangeHandlers {
                run: Arc::new(|_| Err("boom".to_string())),
                undo: Some(Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })),
                cleanup: None,
            },
        );
        let info = engine.wait_ready(&id).unwrap();
        assert_eq!(info.status, ChangeStatus::Error);
        assert_eq!(info.err.as_deref(), Some("boom"));
        assert_eq!(undone.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reserved_change_runs_once_queued() {
        let engine = ChangeEngine::new();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let id = engine.reserve("blocked");
        engine.queue(
            &id,
            ChangeHandlers {
                run: Arc::new(move |_| {
                    let _ = release_rx.lock().unwrap().recv();
                    Ok(())
                }),
                undo: None,
                cleanup: None,
            },
        );
        release_tx.send(()).unwrap();
        let info = engine.wait_ready(&id).unwrap();
        assert_eq!(info.kind, "blocked");
        assert_eq!(info.status, ChangeStatus::Done);
    }
}
