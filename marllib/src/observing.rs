//! Executor hooks that forward transitions to the experience sink and refresh policy weights.
use std::collections::BTreeMap;

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::client::ParameterClient;
use crate::create_rng;
use crate::sampling::{sample_new_agent_keys, sort_str_num, AgentNetKeys, NetworkIntKeys};
use crate::types::{Array, ParamValue};
use crate::SyncError;

#[cfg(test)]
mod tests;

/// Position of a timestep in its episode.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepType {
    #[default]
    First,
    Mid,
    Last,
}

/// Per-agent environment output for one step.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TimeStep {
    pub step_type: StepType,
    pub observations: BTreeMap<String, Array>,
    pub rewards: BTreeMap<String, f32>,
    pub discounts: BTreeMap<String, f32>,
}

impl TimeStep {
    pub fn is_last(&self) -> bool {
        self.step_type == StepType::Last
    }
}

/// Auxiliary data stored next to each transition.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Extras {
    /// Integer ids of the networks acting for each agent in this episode.
    pub network_int_keys: NetworkIntKeys,
    /// Anything else the executor wants to record, e.g. recurrent core states.
    pub values: BTreeMap<String, ParamValue>,
}

/// What is recorded for the action an agent took.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AdderAction {
    pub actions_info: ParamValue,
}

/// Sink for experience. Receives `add_first` once per episode, then `add` for every step.
pub trait Adder {
    fn add_first(&mut self, timestep: &TimeStep, extras: &Extras) -> Result<(), SyncError>;

    fn add(
        &mut self,
        actions: &BTreeMap<String, AdderAction>,
        next_timestep: &TimeStep,
        next_extras: &Extras,
    ) -> Result<(), SyncError>;
}

/// Episode progress as seen by the observation hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpisodePhase {
    #[default]
    Idle,
    /// The first observation was recorded.
    Started,
    /// At least one transition was recorded.
    Observing,
}

/// State shared by the executor components.
///
/// The executor writes the timesteps and actions before calling the hooks.
pub struct ExecutorStore {
    pub adder: Option<Box<dyn Adder + Send>>,
    pub parameter_client: Option<ParameterClient>,

    /// Network key per agent, fixed for the duration of an episode.
    pub agent_net_keys: AgentNetKeys,
    /// Groups of network keys that can be sampled for an episode.
    pub network_sampling_setup: Vec<Vec<String>>,
    pub net_keys_to_ids: BTreeMap<String, i64>,
    /// Network ids chosen at the start of the current episode.
    pub network_int_keys_extras: NetworkIntKeys,

    pub timestep: TimeStep,
    pub extras: Extras,
    pub next_timestep: TimeStep,
    pub next_extras: Extras,
    pub actions_info: BTreeMap<String, ParamValue>,

    pub phase: EpisodePhase,
    pub rng: StdRng,
}

impl ExecutorStore {
    /// A store where every agent starts on the first network of the sampling setup.
    pub fn new(
        agents: &[String],
        network_sampling_setup: Vec<Vec<String>>,
        net_keys_to_ids: BTreeMap<String, i64>,
    ) -> Result<Self, SyncError> {
        let first = network_sampling_setup
            .first()
            .and_then(|entry| entry.first())
            .cloned()
            .ok_or_else(|| SyncError::Sampling("empty network sampling setup".to_string()))?;
        let agent_net_keys = agents
            .iter()
            .map(|agent| (agent.clone(), first.clone()))
            .collect();
        Ok(Self {
            adder: None,
            parameter_client: None,
            agent_net_keys,
            network_sampling_setup,
            net_keys_to_ids,
            network_int_keys_extras: NetworkIntKeys::new(),
            timestep: TimeStep::default(),
            extras: Extras::default(),
            next_timestep: TimeStep::default(),
            next_extras: Extras::default(),
            actions_info: BTreeMap::new(),
            phase: EpisodePhase::Idle,
            rng: create_rng(),
        })
    }

    pub fn with_adder(mut self, adder: Box<dyn Adder + Send>) -> Self {
        self.adder = Some(adder);
        self
    }

    pub fn with_parameter_client(mut self, client: ParameterClient) -> Self {
        self.parameter_client = Some(client);
        self
    }
}

/// Executor component hooks. Every hook does nothing by default.
pub trait ExecutorHooks {
    fn on_execution_observe_first(&mut self, _store: &mut ExecutorStore) -> Result<(), SyncError> {
        Ok(())
    }

    fn on_execution_observe(&mut self, _store: &mut ExecutorStore) -> Result<(), SyncError> {
        Ok(())
    }

    fn on_execution_update(&mut self, _store: &mut ExecutorStore) -> Result<(), SyncError> {
        Ok(())
    }

    fn on_execution_force_update(&mut self, _store: &mut ExecutorStore) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Observation handling for a feedforward executor.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecutorObserve;

impl ExecutorHooks for ExecutorObserve {
    /// Pick the networks for the new episode and hand the first observation to the adder.
    fn on_execution_observe_first(&mut self, store: &mut ExecutorStore) -> Result<(), SyncError> {
        let Some(adder) = store.adder.as_mut() else {
            return Ok(());
        };

        let agents = sort_str_num(store.agent_net_keys.keys().cloned());
        let (network_int_keys, agent_net_keys) = sample_new_agent_keys(
            &agents,
            &store.network_sampling_setup,
            &store.net_keys_to_ids,
            &mut store.rng,
        )?;
        store.network_int_keys_extras = network_int_keys;
        store.agent_net_keys = agent_net_keys;
        store.extras.network_int_keys = store.network_int_keys_extras.clone();

        adder.add_first(&store.timestep, &store.extras)?;
        store.phase = EpisodePhase::Started;
        Ok(())
    }

    /// Hand the actions and the next timestep to the adder.
    fn on_execution_observe(&mut self, store: &mut ExecutorStore) -> Result<(), SyncError> {
        let Some(adder) = store.adder.as_mut() else {
            return Ok(());
        };
        if store.phase == EpisodePhase::Idle {
            return Err(SyncError::Episode(
                "observe called before observe_first".to_string(),
            ));
        }

        let adder_actions: BTreeMap<String, AdderAction> = store
            .actions_info
            .iter()
            .map(|(agent, info)| {
                (
                    agent.clone(),
                    AdderAction {
                        actions_info: info.clone(),
                    },
                )
            })
            .collect();
        store.next_extras.network_int_keys = store.network_int_keys_extras.clone();

        adder.add(&adder_actions, &store.next_timestep, &store.next_extras)?;
        store.phase = if store.next_timestep.is_last() {
            EpisodePhase::Idle
        } else {
            EpisodePhase::Observing
        };
        Ok(())
    }

    fn on_execution_update(&mut self, store: &mut ExecutorStore) -> Result<(), SyncError> {
        match store.parameter_client.as_mut() {
            Some(client) => client.get_async(),
            None => Ok(()),
        }
    }

    fn on_execution_force_update(&mut self, store: &mut ExecutorStore) -> Result<(), SyncError> {
        match store.parameter_client.as_mut() {
            Some(client) => client.get_and_wait(),
            None => Ok(()),
        }
    }
}

/// An executor made of components that react to its hooks, in order.
pub struct Executor {
    pub store: ExecutorStore,
    components: Vec<Box<dyn ExecutorHooks + Send>>,
}

impl Executor {
    pub fn new(store: ExecutorStore, components: Vec<Box<dyn ExecutorHooks + Send>>) -> Self {
        Self { store, components }
    }

    fn run_hooks<F>(&mut self, mut hook: F) -> Result<(), SyncError>
    where
        F: FnMut(&mut dyn ExecutorHooks, &mut ExecutorStore) -> Result<(), SyncError>,
    {
        for component in self.components.iter_mut() {
            hook(component.as_mut(), &mut self.store)?;
        }
        Ok(())
    }

    /// Record the first timestep of an episode.
    pub fn observe_first(&mut self, timestep: TimeStep, extras: Extras) -> Result<(), SyncError> {
        self.store.timestep = timestep;
        self.store.extras = extras;
        self.run_hooks(|c, store| c.on_execution_observe_first(store))
    }

    /// Record the actions taken and the resulting timestep.
    pub fn observe(
        &mut self,
        actions_info: BTreeMap<String, ParamValue>,
        next_timestep: TimeStep,
        next_extras: Extras,
    ) -> Result<(), SyncError> {
        self.store.actions_info = actions_info;
        self.store.next_timestep = next_timestep;
        self.store.next_extras = next_extras;
        self.run_hooks(|c, store| c.on_execution_observe(store))
    }

    /// Refresh the policy parameters. With `wait`, block until the freshest values are merged.
    pub fn update(&mut self, wait: bool) -> Result<(), SyncError> {
        if wait {
            self.run_hooks(|c, store| c.on_execution_force_update(store))
        } else {
            self.run_hooks(|c, store| c.on_execution_update(store))
        }
    }
}
