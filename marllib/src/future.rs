//! Completion handles for requests to a parameter server.
//!
//! A [`ParameterFuture`] is returned immediately when a request is issued. Its completion can be
//! polled with [`ParameterFuture::done`], its result retrieved once with
//! [`ParameterFuture::result`], and a single callback attached with
//! [`ParameterFuture::add_done_callback`]. The other half, [`Completer`], is owned by whoever
//! serves the request.
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::SyncError;

type Callback<T> = Box<dyn FnOnce(&Result<T, SyncError>) + Send>;

struct State<T> {
    outcome: Option<Result<T, SyncError>>,
    callback: Option<Callback<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the eventual result of a request.
pub struct ParameterFuture<T> {
    shared: Arc<Shared<T>>,
}

/// Resolves the matching [`ParameterFuture`].
///
/// Dropping an unresolved completer resolves the future with a [`SyncError::Transport`] error.
pub struct Completer<T> {
    shared: Option<Arc<Shared<T>>>,
}

/// Create a connected future/completer pair.
pub fn channel<T>() -> (ParameterFuture<T>, Completer<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            outcome: None,
            callback: None,
        }),
        ready: Condvar::new(),
    });
    (
        ParameterFuture {
            shared: shared.clone(),
        },
        Completer {
            shared: Some(shared),
        },
    )
}

impl<T> ParameterFuture<T> {
    /// A future that is already resolved.
    pub fn ready(result: Result<T, SyncError>) -> Self {
        let (future, completer) = channel();
        completer.complete(result);
        future
    }

    /// True once the request has completed, successfully or not.
    pub fn done(&self) -> bool {
        self.shared.lock().outcome.is_some()
    }

    /// Block until the request completes and return its result.
    pub fn result(self) -> Result<T, SyncError> {
        let mut state = self.shared.lock();
        loop {
            if let Some(outcome) = state.outcome.take() {
                return outcome;
            }
            state = self
                .shared
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Run `callback` with the result once the request completes.
    ///
    /// If the request has already completed, the callback runs immediately in the calling thread.
    /// Otherwise it runs in the thread that completes the request, before [`Self::done`] turns
    /// true. Only one callback can be attached; attaching another replaces it.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Result<T, SyncError>) + Send + 'static,
    {
        let mut state = self.shared.lock();
        match &state.outcome {
            Some(outcome) => callback(outcome),
            None => {
                if state.callback.is_some() {
                    log::warn!("Replacing an existing completion callback");
                }
                state.callback = Some(Box::new(callback));
            }
        }
    }
}

impl<T> Completer<T> {
    /// Resolve the future, running its callback if one is attached.
    pub fn complete(mut self, result: Result<T, SyncError>) {
        if let Some(shared) = self.shared.take() {
            Self::resolve(&shared, result);
        }
    }

    fn resolve(shared: &Shared<T>, result: Result<T, SyncError>) {
        let mut state = shared.lock();
        if let Some(callback) = state.callback.take() {
            callback(&result);
        }
        state.outcome = Some(result);
        drop(state);
        shared.ready.notify_all();
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            Self::resolve(
                &shared,
                Err(SyncError::Transport("request dropped".to_string())),
            );
        }
    }
}

impl<T> std::fmt::Debug for ParameterFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ParameterFuture")
            .field("done", &self.done())
            .finish()
    }
}
