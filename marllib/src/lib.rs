//! # Multi-Agent RL Parameter Synchronization Library
//!
//! Keeps the parameters of many executor and trainer processes approximately in sync with a
//! single authoritative [`server::ParameterServer`].
//!
//! - [`client::ParameterClient`] holds a local replica and talks to the server through a
//!   [`node::Transport`], either synchronously in the same process or through completion
//!   handles ([`future::ParameterFuture`]) when the server runs as a remote node.
//! - [`observing`] contains the executor hooks that feed transitions to the experience sink and
//!   refresh policy weights once per environment step.
//! - [`trainer`] contains the trainer-side hooks that push new weights and step counters.
use std::cell::RefCell;

use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

pub mod client;
pub mod config;
pub mod future;
pub mod node;
pub mod observing;
pub mod sampling;
pub mod server;
pub mod store;
pub mod trainer;
pub mod types;

#[cfg(test)]
mod integration_tests;

thread_local! {
    /// Optional seed for the random number generators created in this thread.
    pub static RANDOM_SEED: RefCell<Option<u64>> = const { RefCell::new(None) };
}

/// Create a random number generator, seeded with [`RANDOM_SEED`] if it's set.
pub fn create_rng() -> StdRng {
    RANDOM_SEED.with_borrow(|seed| match seed {
        Some(seed) => StdRng::seed_from_u64(*seed),
        None => StdRng::from_entropy(),
    })
}

/// Represents the reasons why a parameter operation might fail.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", content = "content")]
pub enum SyncError {
    /// The named parameter doesn't exist where it was expected.
    UnknownKey(String),
    /// A value of one kind was sent for a parameter of another kind.
    TypeMismatch {
        key: String,
        expected: String,
        found: String,
    },
    /// Array shapes cannot be reconciled.
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    /// The parameter kind cannot be merged into a replica.
    UnsupportedType { key: String, kind: String },
    /// A known capability gap.
    NotImplemented(String),
    /// Device placement failed.
    Device(String),
    /// The request could not be delivered or its reply was lost.
    Transport(String),
    /// The experience sink rejected a transition.
    Sink(String),
    /// Network sampling setup is invalid.
    Sampling(String),
    /// Observation hooks were called out of order.
    Episode(String),
    /// Invalid configuration.
    Config(String),
}

impl std::error::Error for SyncError {}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SyncError::UnknownKey(key) => write!(f, "Unknown parameter: {}", key),
            SyncError::TypeMismatch {
                key,
                expected,
                found,
            } => write!(
                f,
                "Type mismatch for '{}': expected {}, found {}",
                key, expected, found
            ),
            SyncError::ShapeMismatch {
                key,
                expected,
                found,
            } => write!(
                f,
                "Shape mismatch for '{}': expected {:?}, found {:?}",
                key, expected, found
            ),
            SyncError::UnsupportedType { key, kind } => write!(
                f,
                "Parameter type {} of '{}' not implemented. Please use a mergeable type for '{}'.",
                kind, key, key
            ),
            SyncError::NotImplemented(what) => write!(f, "Not implemented: {}", what),
            SyncError::Device(reason) => write!(f, "Device placement failed: {}", reason),
            SyncError::Transport(reason) => write!(f, "Transport failure: {}", reason),
            SyncError::Sink(reason) => write!(f, "Experience sink failure: {}", reason),
            SyncError::Sampling(reason) => write!(f, "Network sampling failure: {}", reason),
            SyncError::Episode(reason) => write!(f, "Episode error: {}", reason),
            SyncError::Config(reason) => write!(f, "Bad configuration: {}", reason),
        }
    }
}
