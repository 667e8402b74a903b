use super::*;
use std::sync::{Arc, Mutex};

use ndarray::arr1;

use crate::config::ClientConfig;
use crate::node::Transport;
use crate::server::ParameterServer;
use crate::types::Params;
use crate::RANDOM_SEED;

#[derive(Debug, Clone, PartialEq)]
enum Record {
    First(Extras),
    Step(Vec<String>, StepType, Extras),
}

/// Adder that records what it receives, failing on demand.
#[derive(Default, Clone)]
struct RecordingAdder {
    records: Arc<Mutex<Vec<Record>>>,
    fail: bool,
}

impl Adder for RecordingAdder {
    fn add_first(&mut self, _timestep: &TimeStep, extras: &Extras) -> Result<(), SyncError> {
        if self.fail {
            return Err(SyncError::Sink("table is full".to_string()));
        }
        self.records.lock().unwrap().push(Record::First(extras.clone()));
        Ok(())
    }

    fn add(
        &mut self,
        actions: &BTreeMap<String, AdderAction>,
        next_timestep: &TimeStep,
        next_extras: &Extras,
    ) -> Result<(), SyncError> {
        if self.fail {
            return Err(SyncError::Sink("table is full".to_string()));
        }
        self.records.lock().unwrap().push(Record::Step(
            actions.keys().cloned().collect(),
            next_timestep.step_type,
            next_extras.clone(),
        ));
        Ok(())
    }
}

fn agents() -> Vec<String> {
    vec!["agent_0".to_string(), "agent_1".to_string(), "agent_2".to_string()]
}

fn store() -> ExecutorStore {
    RANDOM_SEED.with_borrow_mut(|seed| *seed = Some(11));
    ExecutorStore::new(
        &agents(),
        vec![
            vec!["net_a".to_string()],
            vec!["net_b".to_string(), "net_c".to_string()],
        ],
        BTreeMap::from([
            ("net_a".to_string(), 0),
            ("net_b".to_string(), 1),
            ("net_c".to_string(), 2),
        ]),
    )
    .unwrap()
}

fn executor(adder: Option<RecordingAdder>) -> Executor {
    let mut store = store();
    if let Some(adder) = adder {
        store = store.with_adder(Box::new(adder));
    }
    Executor::new(store, vec![Box::new(ExecutorObserve)])
}

fn step(step_type: StepType) -> TimeStep {
    TimeStep {
        step_type,
        rewards: agents().into_iter().map(|a| (a, 1.0)).collect(),
        ..Default::default()
    }
}

fn actions() -> BTreeMap<String, ParamValue> {
    agents()
        .into_iter()
        .map(|a| (a, ParamValue::Scalar(1.0)))
        .collect()
}

#[test]
fn networks_fixed_for_the_episode() {
    let adder = RecordingAdder::default();
    let mut executor = executor(Some(adder.clone()));

    executor
        .observe_first(step(StepType::First), Extras::default())
        .unwrap();
    assert_eq!(executor.store.phase, EpisodePhase::Started);
    let chosen = executor.store.network_int_keys_extras.clone();
    assert_eq!(chosen.len(), 3);
    for (agent, id) in chosen.iter() {
        let net_key = &executor.store.agent_net_keys[agent];
        assert_eq!(executor.store.net_keys_to_ids[net_key], *id);
    }

    for _ in 0..4 {
        executor
            .observe(actions(), step(StepType::Mid), Extras::default())
            .unwrap();
    }
    assert_eq!(executor.store.phase, EpisodePhase::Observing);
    executor
        .observe(actions(), step(StepType::Last), Extras::default())
        .unwrap();
    assert_eq!(executor.store.phase, EpisodePhase::Idle);

    let records = adder.records.lock().unwrap();
    assert_eq!(records.len(), 6);
    assert_eq!(records[0], Record::First(Extras {
        network_int_keys: chosen.clone(),
        values: BTreeMap::new(),
    }));
    for record in records[1..].iter() {
        match record {
            Record::Step(agents_seen, _, extras) => {
                assert_eq!(agents_seen, &agents());
                assert_eq!(extras.network_int_keys, chosen);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }
}

#[test]
fn extras_values_are_forwarded() {
    let adder = RecordingAdder::default();
    let mut executor = executor(Some(adder.clone()));
    let extras = Extras {
        values: BTreeMap::from([(
            "core_state".to_string(),
            ParamValue::Array(arr1(&[0.5f32, 0.25]).into_dyn()),
        )]),
        ..Default::default()
    };
    executor
        .observe_first(step(StepType::First), extras.clone())
        .unwrap();
    let records = adder.records.lock().unwrap();
    let Record::First(recorded) = &records[0] else {
        panic!("expected the first record");
    };
    assert_eq!(recorded.values, extras.values);
}

#[test]
fn without_adder_nothing_happens() {
    let mut executor = executor(None);
    let before = executor.store.agent_net_keys.clone();

    executor
        .observe(actions(), step(StepType::Mid), Extras::default())
        .unwrap();
    executor
        .observe_first(step(StepType::First), Extras::default())
        .unwrap();

    assert_eq!(executor.store.agent_net_keys, before);
    assert!(executor.store.network_int_keys_extras.is_empty());
    assert_eq!(executor.store.phase, EpisodePhase::Idle);
}

#[test]
fn sink_errors_propagate() {
    let adder = RecordingAdder {
        fail: true,
        ..Default::default()
    };
    let mut executor = executor(Some(adder));
    let result = executor.observe_first(step(StepType::First), Extras::default());
    assert!(matches!(result, Err(SyncError::Sink(_))));
    assert_eq!(executor.store.phase, EpisodePhase::Idle);
}

#[test]
fn observe_requires_observe_first() {
    let mut executor = executor(Some(RecordingAdder::default()));
    let result = executor.observe(actions(), step(StepType::Mid), Extras::default());
    assert!(matches!(result, Err(SyncError::Episode(_))));
}

#[test]
fn empty_sampling_setup() {
    let result = ExecutorStore::new(&agents(), vec![], BTreeMap::new());
    assert!(matches!(result, Err(SyncError::Sampling(_))));
}

fn client_for(server: &Arc<ParameterServer>, update_period: usize) -> ParameterClient {
    let initial: Params = BTreeMap::from([(
        "policy".to_string(),
        ParamValue::Array(arr1(&[0.0f32, 0.0]).into_dyn()),
    )]);
    ParameterClient::new(
        ClientConfig {
            get_keys: vec!["policy".to_string()],
            update_period,
            ..Default::default()
        },
        initial,
        Transport::Local(server.clone()),
    )
    .unwrap()
}

#[test]
fn update_refreshes_policy() {
    let server = Arc::new(ParameterServer::new(BTreeMap::from([(
        "policy".to_string(),
        ParamValue::Array(arr1(&[1.0f32, 2.0]).into_dyn()),
    )])));
    let store = store().with_parameter_client(client_for(&server, 2));
    let mut executor = Executor::new(store, vec![Box::new(ExecutorObserve)]);
    fn executor_value(executor: &Executor) -> Option<ParamValue> {
        executor
            .store
            .parameter_client
            .as_ref()
            .and_then(|client| client.value("policy"))
    }
    let zeros = Some(ParamValue::Array(arr1(&[0.0f32, 0.0]).into_dyn()));
    let fresh = Some(ParamValue::Array(arr1(&[1.0f32, 2.0]).into_dyn()));

    assert_eq!(executor_value(&executor), zeros);
    executor.update(false).unwrap();
    assert_eq!(executor_value(&executor), zeros);
    executor.update(false).unwrap();
    assert_eq!(executor_value(&executor), fresh);

    server
        .set_parameters(BTreeMap::from([(
            "policy".to_string(),
            ParamValue::Array(arr1(&[3.0f32, 4.0]).into_dyn()),
        )]))
        .unwrap();
    executor.update(true).unwrap();
    assert_eq!(
        executor_value(&executor),
        Some(ParamValue::Array(arr1(&[3.0f32, 4.0]).into_dyn()))
    );
}

/// Counts hook calls and records their order.
struct Probe {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl ExecutorHooks for Probe {
    fn on_execution_observe_first(&mut self, _store: &mut ExecutorStore) -> Result<(), SyncError> {
        self.log.lock().unwrap().push(format!("{}:first", self.name));
        Ok(())
    }
}

#[test]
fn components_run_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut executor = Executor::new(
        store(),
        vec![
            Box::new(Probe {
                name: "a",
                log: log.clone(),
            }),
            Box::new(ExecutorObserve),
            Box::new(Probe {
                name: "b",
                log: log.clone(),
            }),
        ],
    );
    executor
        .observe_first(step(StepType::First), Extras::default())
        .unwrap();
    executor
        .observe(actions(), step(StepType::Mid), Extras::default())
        .unwrap();
    executor.update(false).unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["a:first", "b:first"]);
}
