//! Consolidated abort listening.
//!
//! One [`AbortScope`] holds a single registration on a cancellation token
//! and dispatches to any number of handlers when it fires. The whole scope
//! is detached in one step on every exit path (explicitly via
//! [`AbortScope::detach`], or implicitly on drop), so long sessions never
//! accumulate per-operation listeners.

use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Handler = Box<dyn FnOnce() + Send>;

struct ScopeState {
    fired: bool,
    handlers: Vec<Handler>,
}

/// A single listener on a `CancellationToken` fanning out to N handlers.
pub struct AbortScope {
    state: Arc<Mutex<ScopeState>>,
    watcher: Option<JoinHandle<()>>,
}

impl AbortScope {
    /// Attach to `token`. Must be called from within a tokio runtime.
    pub fn new(token: &CancellationToken) -> Self {
        let state = Arc::new(Mutex::new(ScopeState {
            fired: false,
            handlers: Vec::new(),
        }));
        let watch_state = Arc::clone(&state);
        let token = token.clone();
        let watcher = tokio::spawn(async move {
            token.cancelled().await;
            // Mark fired and take the handlers under the same lock so a
            // concurrent `on_abort` either lands in this drain or observes
            // `fired` and runs immediately.
            let handlers = {
                let mut state = watch_state.lock().unwrap();
                state.fired = true;
                std::mem::take(&mut state.handlers)
            };
            for handler in handlers {
                handler();
            }
        });
        Self {
            state,
            watcher: Some(watcher),
        }
    }

    /// Register a handler. If the token already fired, the handler runs
    /// immediately on the calling task.
    pub fn on_abort(&self, handler: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.fired {
                state.handlers.push(Box::new(handler));
                return;
            }
        }
        handler();
    }

    /// Whether the underlying token fired while this scope was attached.
    pub fn fired(&self) -> bool {
        self.state.lock().unwrap().fired
    }

    /// Remove the token registration and drop all pending handlers.
    pub fn detach(mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.state.lock().unwrap().handlers.clear();
    }
}

impl Drop for AbortScope {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}
