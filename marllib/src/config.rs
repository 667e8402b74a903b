//! YAML configuration for clients and servers.
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use ndarray::ArrayD;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::node::NodeSettings;
use crate::types::{Device, ParamValue, Params, Placement};
use crate::SyncError;


/// Read and parse a YAML file.
pub fn read_yaml_file<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T, SyncError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| SyncError::Config(format!("Cannot read {}: {}", path.display(), e)))?;
    serde_yaml::from_str(&content)
        .map_err(|e| SyncError::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

fn default_update_period() -> usize {
    1
}

fn default_true() -> bool {
    true
}

/// Settings of a [`crate::client::ParameterClient`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Parameters fetched from the server.
    #[serde(default)]
    pub get_keys: Vec<String>,
    /// Parameters pushed to the server.
    #[serde(default)]
    pub set_keys: Vec<String>,
    /// Number of calls between two round trips of the same request kind.
    #[serde(default = "default_update_period")]
    pub update_period: usize,
    /// Whether the server is a remote node. Must agree with the transport given to the client.
    #[serde(default)]
    pub multi_process: bool,
    /// Device placement of replica parameters. Empty means in-place host updates.
    #[serde(default)]
    pub devices: HashMap<String, Placement>,
    /// Device for parameters missing from `devices`.
    #[serde(default)]
    pub default_device: Device,
    /// When a response array has one extra leading axis (e.g. one slice per trainer replica),
    /// apply its first slice. When false, such responses are rejected.
    #[serde(default = "default_true")]
    pub slice_leading_axis: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            get_keys: Vec::new(),
            set_keys: Vec::new(),
            update_period: default_update_period(),
            multi_process: false,
            devices: HashMap::new(),
            default_device: Device::Cpu,
            slice_leading_axis: true,
        }
    }
}

/// Description of an initial parameter value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamInit {
    /// Scalar counter.
    Counter {
        #[serde(default)]
        value: f64,
    },
    /// Array of the given shape filled with one value.
    Array {
        shape: Vec<usize>,
        #[serde(default)]
        fill: f32,
    },
    /// One array per shape, e.g. per-layer weights.
    Sequence {
        shapes: Vec<Vec<usize>>,
        #[serde(default)]
        fill: f32,
    },
    /// Zeroed statistics for every agent.
    Stats {
        agents: Vec<String>,
        stats: Vec<String>,
    },
    /// Flat mapping of scalars.
    Mapping { entries: BTreeMap<String, f64> },
}

impl ParamInit {
    pub fn build(&self) -> ParamValue {
        match self {
            ParamInit::Counter { value } => ParamValue::Scalar(*value),
            ParamInit::Array { shape, fill } => {
                ParamValue::Array(ArrayD::from_elem(shape.clone(), *fill))
            }
            ParamInit::Sequence { shapes, fill } => ParamValue::Sequence(
                shapes
                    .iter()
                    .map(|shape| ArrayD::from_elem(shape.clone(), *fill))
                    .collect(),
            ),
            ParamInit::Stats { agents, stats } => ParamValue::Mapping(
                agents
                    .iter()
                    .map(|agent| {
                        let inner = stats
                            .iter()
                            .map(|stat| (stat.clone(), ParamValue::Scalar(0.0)))
                            .collect();
                        (agent.clone(), ParamValue::Mapping(inner))
                    })
                    .collect(),
            ),
            ParamInit::Mapping { entries } => ParamValue::Mapping(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), ParamValue::Scalar(*v)))
                    .collect(),
            ),
        }
    }
}

fn default_address() -> String {
    "127.0.0.1:8050".to_string()
}

/// Settings of a parameter server process.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP node listens on.
    #[serde(default = "default_address")]
    pub address: String,
    /// Initial parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamInit>,
    #[serde(default)]
    pub node: NodeSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            parameters: BTreeMap::new(),
            node: NodeSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Initial parameter values.
    pub fn initial_parameters(&self) -> Params {
        self.parameters
            .iter()
            .map(|(name, spec)| (name.clone(), spec.build()))
            .collect()
    }
}

fn default_one() -> usize {
    1
}

fn default_steps() -> usize {
    100
}

fn default_episode_length() -> usize {
    10
}

fn default_agents() -> Vec<String> {
    vec!["agent_0".to_string(), "agent_1".to_string()]
}

fn default_sampling_setup() -> Vec<Vec<String>> {
    vec![vec!["network_agent".to_string()]]
}

fn default_policy_shape() -> Vec<usize> {
    vec![4]
}

/// Settings of a simulated training run: executors and trainers sharing one server node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SimulationConfig {
    #[serde(default = "default_one")]
    pub executors: usize,
    #[serde(default = "default_one")]
    pub trainers: usize,
    /// Environment steps per executor, and training steps per trainer.
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_episode_length")]
    pub episode_length: usize,
    #[serde(default = "default_one")]
    pub update_period: usize,
    #[serde(default)]
    pub node: NodeSettings,
    #[serde(default = "default_agents")]
    pub agents: Vec<String>,
    #[serde(default = "default_sampling_setup")]
    pub network_sampling_setup: Vec<Vec<String>>,
    /// Shape of every network's weights.
    #[serde(default = "default_policy_shape")]
    pub policy_shape: Vec<usize>,
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            executors: 1,
            trainers: 1,
            steps: default_steps(),
            episode_length: default_episode_length(),
            update_period: 1,
            node: NodeSettings::default(),
            agents: default_agents(),
            network_sampling_setup: default_sampling_setup(),
            policy_shape: default_policy_shape(),
            seed: None,
        }
    }
}

impl SimulationConfig {
    /// Distinct network keys of the sampling setup, in alpha-numeric order.
    pub fn network_keys(&self) -> Vec<String> {
        let keys: std::collections::BTreeSet<String> = self
            .network_sampling_setup
            .iter()
            .flatten()
            .cloned()
            .collect();
        crate::sampling::sort_str_num(keys)
    }

    /// Integer id of every network key.
    pub fn net_keys_to_ids(&self) -> BTreeMap<String, i64> {
        self.network_keys()
            .into_iter()
            .zip(0..)
            .collect()
    }

    /// Zeroed weights for every network, plus the step counters.
    pub fn initial_parameters(&self) -> Params {
        let mut params: Params = self
            .network_keys()
            .into_iter()
            .map(|key| {
                let weights = ArrayD::zeros(self.policy_shape.clone());
                (key, ParamValue::Array(weights))
            })
            .collect();
        params.insert("trainer_steps".to_string(), ParamValue::Scalar(0.0));
        params.insert("executor_steps".to_string(), ParamValue::Scalar(0.0));
        params
    }
}
