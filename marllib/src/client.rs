//! Parameter client used by executors and trainers.
//!
//! A [`ParameterClient`] keeps a [`Replica`] of a subset of the server parameters and refreshes
//! it periodically. Every `*_async` method is safe to call once per step: real round trips
//! happen at most once per `update_period` calls, at most one request of each kind is in flight
//! at any time, and the caller never blocks on the network.
use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use itertools::Itertools;

use crate::config::ClientConfig;
use crate::future::ParameterFuture;
use crate::node::Transport;
use crate::sampling::sort_str_num;
use crate::types::{ParamValue, Params};
use crate::SyncError;

mod replica;
pub use self::replica::*;


/// Which request kinds a client currently has in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingRequests {
    pub get: bool,
    pub set: bool,
    pub set_and_get: bool,
    pub add: bool,
}

/// Advance a periodic call counter and report whether the period has been reached.
fn tick(counter: &mut usize, period: usize) -> bool {
    if *counter < period {
        *counter += 1;
    }
    *counter >= period
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct AddState {
    in_flight: bool,
    /// Deltas received while an add was in flight. Flushed as one add when it completes.
    buffer: Params,
    /// Failure of an add issued from a completion callback.
    error: Option<SyncError>,
}

/// Issues adds one at a time, summing the deltas that arrive in between.
struct AddPipeline {
    transport: Transport,
    state: Mutex<AddState>,
    idle: Condvar,
}

impl AddPipeline {
    /// Send or buffer `params`.
    ///
    /// Local adds run right away and return their own result. Remote adds report the failure of
    /// an earlier deferred add, after `params` have been sent or buffered.
    fn submit(self: &Arc<Self>, params: Params) -> Result<(), SyncError> {
        let Transport::Remote(_) = &self.transport else {
            return self.transport.add_and_wait(params);
        };
        let mut state = lock(&self.state);
        let earlier = state.error.take();
        if state.in_flight {
            // The producer is going faster than the server can absorb. Sum the deltas up and
            // send them together once the current request completes.
            if let Err(error) = ParamValue::accumulate(&mut state.buffer, params) {
                // Nothing was buffered; the earlier failure is still owed to a later call.
                state.error = earlier;
                return Err(error);
            }
            log::trace!(
                "Buffered add for {}",
                state.buffer.keys().join(", ")
            );
        } else {
            state.in_flight = true;
            drop(state);
            self.issue(params);
        }
        match earlier {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn issue(self: &Arc<Self>, params: Params) {
        let future = self.transport.add(params);
        let pipeline = Arc::clone(self);
        future.add_done_callback(move |result| pipeline.on_complete(result));
    }

    fn on_complete(self: &Arc<Self>, result: &Result<(), SyncError>) {
        let mut state = lock(&self.state);
        if let Err(error) = result {
            log::error!("Add request failed: {error}");
            state.error = Some(error.clone());
        }
        if state.buffer.is_empty() {
            state.in_flight = false;
            drop(state);
            self.idle.notify_all();
            return;
        }
        let buffered = std::mem::take(&mut state.buffer);
        drop(state);
        log::debug!("Flushing buffered add for {}", buffered.keys().join(", "));
        self.issue(buffered);
    }

    fn take_error(&self) -> Option<SyncError> {
        lock(&self.state).error.take()
    }

    fn in_flight(&self) -> bool {
        lock(&self.state).in_flight
    }

    fn wait_idle(&self) -> Result<(), SyncError> {
        let mut state = lock(&self.state);
        while state.in_flight {
            state = self
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match state.error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Client side of the parameter exchange protocol.
pub struct ParameterClient {
    transport: Transport,
    replica: Arc<Mutex<Replica>>,
    all_keys: Vec<String>,
    get_keys: Vec<String>,
    set_keys: Vec<String>,
    update_period: usize,

    get_call_counter: usize,
    set_call_counter: usize,
    set_get_call_counter: usize,

    get_future: Option<ParameterFuture<Params>>,
    set_future: Option<ParameterFuture<()>>,
    set_get_future: Option<(ParameterFuture<()>, ParameterFuture<Params>)>,
    adds: Arc<AddPipeline>,
    /// Merge failure raised inside the set-and-get completion callback.
    callback_error: Arc<Mutex<Option<SyncError>>>,
}

impl ParameterClient {
    /// Create a client tracking `parameters`, using the host placer for device placement.
    pub fn new(
        config: ClientConfig,
        parameters: Params,
        transport: Transport,
    ) -> Result<Self, SyncError> {
        Self::with_placer(config, parameters, transport, Box::new(HostPlacer))
    }

    /// Create a client that materializes replica arrays with `placer` when devices are
    /// configured.
    pub fn with_placer(
        config: ClientConfig,
        parameters: Params,
        transport: Transport,
        placer: Box<dyn DevicePlacer>,
    ) -> Result<Self, SyncError> {
        let ClientConfig {
            get_keys,
            set_keys,
            update_period,
            multi_process,
            devices,
            default_device,
            slice_leading_axis,
        } = config;

        if update_period == 0 {
            return Err(SyncError::Config(
                "update_period must be at least 1".to_string(),
            ));
        }
        if multi_process != transport.is_remote() {
            return Err(SyncError::Config(format!(
                "multi_process is {multi_process} but the transport is {transport:?}"
            )));
        }
        let unknown = get_keys
            .iter()
            .chain(set_keys.iter())
            .filter(|key| !parameters.contains_key(*key))
            .unique()
            .join(", ");
        if !unknown.is_empty() {
            return Err(SyncError::UnknownKey(unknown));
        }

        let all_keys = sort_str_num(parameters.keys().cloned());
        let devices = if devices.is_empty() {
            None
        } else {
            Some(DeviceMap::new(devices, default_device, placer))
        };
        let replica = Replica::new(parameters, devices, slice_leading_axis);

        Ok(Self {
            adds: Arc::new(AddPipeline {
                transport: transport.clone(),
                state: Mutex::new(AddState::default()),
                idle: Condvar::new(),
            }),
            transport,
            replica: Arc::new(Mutex::new(replica)),
            all_keys,
            get_keys,
            set_keys,
            update_period,
            get_call_counter: 0,
            set_call_counter: 0,
            set_get_call_counter: 0,
            get_future: None,
            set_future: None,
            set_get_future: None,
            callback_error: Arc::new(Mutex::new(None)),
        })
    }

    /// All tracked parameter names, in alpha-numeric order.
    pub fn all_keys(&self) -> &[String] {
        &self.all_keys
    }

    pub fn get_keys(&self) -> &[String] {
        &self.get_keys
    }

    pub fn set_keys(&self) -> &[String] {
        &self.set_keys
    }

    pub fn update_period(&self) -> usize {
        self.update_period
    }

    /// The replica slot of a parameter. It shares storage with the replica, so later merges are
    /// visible through it.
    pub fn parameter(&self, name: &str) -> Option<Param> {
        lock(&self.replica).get(name).cloned()
    }

    /// Detached copy of a replica parameter.
    pub fn value(&self, name: &str) -> Option<ParamValue> {
        lock(&self.replica).get(name).map(Param::to_value)
    }

    pub fn pending(&self) -> PendingRequests {
        PendingRequests {
            get: self.get_future.is_some(),
            set: self.set_future.is_some(),
            set_and_get: self.set_get_future.is_some(),
            add: self.adds.in_flight(),
        }
    }

    fn copy(&self, new_parameters: Params) -> Result<(), SyncError> {
        lock(&self.replica).copy(new_parameters)
    }

    fn set_values(&self) -> Result<Params, SyncError> {
        lock(&self.replica).values(&self.set_keys)
    }

    /// Periodically refresh the get parameters from the server without blocking.
    ///
    /// The response is merged into the replica on the first call after it arrives.
    pub fn get_async(&mut self) -> Result<(), SyncError> {
        let period_reached = tick(&mut self.get_call_counter, self.update_period);
        if period_reached && self.get_future.is_none() {
            log::trace!("Requesting {} parameters", self.get_keys.len());
            self.get_future = Some(self.transport.get(self.get_keys.clone()));
            self.get_call_counter = 0;
        }

        if self.get_future.as_ref().is_some_and(ParameterFuture::done) {
            if let Some(future) = self.get_future.take() {
                self.copy(future.result()?)?;
            }
        }
        Ok(())
    }

    /// Periodically push parameters to the server without blocking.
    ///
    /// Pushes `params` if given, otherwise the replica values of the set keys. The echo of the
    /// server is discarded. A request that is already complete, as local ones are, is cleared in
    /// the same call.
    pub fn set_async(&mut self, params: Option<Params>) -> Result<(), SyncError> {
        let period_reached = tick(&mut self.set_call_counter, self.update_period);
        if period_reached && self.set_future.is_none() {
            let params = match params {
                Some(params) => params,
                None => self.set_values()?,
            };
            self.set_future = Some(self.transport.set(params));
            self.set_call_counter = 0;
        }

        if self.set_future.as_ref().is_some_and(ParameterFuture::done) {
            if let Some(future) = self.set_future.take() {
                future.result()?;
            }
        }
        Ok(())
    }

    /// Periodically push the set parameters, then fetch the get parameters that were not just
    /// pushed.
    ///
    /// The fetched values are merged into the replica as soon as they arrive. Requests that are
    /// already complete, as local ones are, are cleared in the same call.
    pub fn set_and_get_async(&mut self) -> Result<(), SyncError> {
        let period_reached = tick(&mut self.set_get_call_counter, self.update_period);
        if period_reached && self.set_get_future.is_none() {
            let set_future = self.transport.set(self.set_values()?);

            let pushed: HashSet<&String> = self.set_keys.iter().collect();
            let get_keys = self
                .get_keys
                .iter()
                .filter(|key| !pushed.contains(key))
                .cloned()
                .collect();
            let get_future = self.transport.get(get_keys);

            let replica = Arc::clone(&self.replica);
            let callback_error = Arc::clone(&self.callback_error);
            get_future.add_done_callback(move |result| {
                if let Ok(params) = result {
                    if let Err(error) = lock(&replica).copy(params.clone()) {
                        log::error!("Cannot merge fetched parameters: {error}");
                        *lock(&callback_error) = Some(error);
                    }
                }
            });

            self.set_get_future = Some((set_future, get_future));
            self.set_get_call_counter = 0;
        }

        let both_done = self
            .set_get_future
            .as_ref()
            .is_some_and(|(set, get)| set.done() && get.done());
        if both_done {
            if let Some((set, get)) = self.set_get_future.take() {
                set.result()?;
                get.result()?;
            }
            if let Some(error) = lock(&self.callback_error).take() {
                return Err(error);
            }
        }
        Ok(())
    }

    /// Add deltas to server parameters without blocking.
    ///
    /// Not periodic: the add is issued right away unless one is already in flight, in which
    /// case the deltas are summed into a buffer that is sent as a single add when the in-flight
    /// one completes. A failure of such a deferred add is returned by the next call, after that
    /// call's deltas have been sent or buffered. Local adds return their own result.
    pub fn add_async(&mut self, params: Params) -> Result<(), SyncError> {
        self.adds.submit(params)
    }

    /// Block until no add is in flight and the buffer is flushed.
    pub fn wait_for_adds(&self) -> Result<(), SyncError> {
        self.adds.wait_idle()
    }

    /// Add deltas to server parameters and wait for completion.
    ///
    /// Returns the failure of an earlier deferred add first, if there was one.
    pub fn add_and_wait(&mut self, params: Params) -> Result<(), SyncError> {
        if let Some(error) = self.adds.take_error() {
            return Err(error);
        }
        self.transport.add_and_wait(params)
    }

    /// Fetch the get parameters and wait for them to be merged.
    pub fn get_and_wait(&mut self) -> Result<(), SyncError> {
        let params = self.transport.get_and_wait(self.get_keys.clone())?;
        self.copy(params)
    }

    /// Fetch every tracked parameter and wait for them to be merged.
    pub fn get_all_and_wait(&mut self) -> Result<(), SyncError> {
        let params = self.transport.get_and_wait(self.all_keys.clone())?;
        self.copy(params)
    }

    /// Push `params`, or the set parameters if `None`, and wait for completion.
    pub fn set_and_wait(&mut self, params: Option<Params>) -> Result<(), SyncError> {
        let params = match params {
            Some(params) => params,
            None => self.set_values()?,
        };
        self.transport.set_and_wait(params)
    }
}

impl std::fmt::Debug for ParameterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ParameterClient")
            .field("transport", &self.transport)
            .field("get_keys", &self.get_keys)
            .field("set_keys", &self.set_keys)
            .field("update_period", &self.update_period)
            .field("pending", &self.pending())
            .finish()
    }
}
