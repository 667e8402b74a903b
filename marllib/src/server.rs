//! The parameter server: sole writer of the [`ParameterStore`].
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::store::ParameterStore;
use crate::types::Params;
use crate::SyncError;

/// Number of requests served so far, by kind.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub gets: usize,
    pub sets: usize,
    pub adds: usize,
}

/// Answers get, set and add requests against a [`ParameterStore`].
///
/// Every call is blocking. See [`crate::node::ServerNode`] for the asynchronous variants.
#[derive(Debug, Default)]
pub struct ParameterServer {
    store: RwLock<ParameterStore>,
    gets: AtomicUsize,
    sets: AtomicUsize,
    adds: AtomicUsize,
}

impl ParameterServer {
    pub fn new(params: Params) -> Self {
        Self::from_store(ParameterStore::new(params))
    }

    pub fn from_store(store: ParameterStore) -> Self {
        Self {
            store: RwLock::new(store),
            gets: AtomicUsize::new(0),
            sets: AtomicUsize::new(0),
            adds: AtomicUsize::new(0),
        }
    }

    /// Copies of the requested parameters. Never mutates.
    pub fn get_parameters<S: AsRef<str>>(&self, names: &[S]) -> Result<Params, SyncError> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let store = self.store.read().unwrap_or_else(PoisonError::into_inner);
        store.get(names)
    }

    /// Overwrite existing parameters.
    pub fn set_parameters(&self, params: Params) -> Result<(), SyncError> {
        self.sets.fetch_add(1, Ordering::Relaxed);
        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
        store.set(params)
    }

    /// Add deltas to existing parameters.
    pub fn add_to_parameters(&self, params: Params) -> Result<(), SyncError> {
        self.adds.fetch_add(1, Ordering::Relaxed);
        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
        store.add(params)
    }

    pub fn keys(&self) -> Vec<String> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
    }

    /// Copy of the whole store. Not counted as a request.
    pub fn snapshot(&self) -> Params {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            gets: self.gets.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            adds: self.adds.load(Ordering::Relaxed),
        }
    }
}
