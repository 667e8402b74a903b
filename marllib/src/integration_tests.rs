use std::collections::BTreeMap;
use std::thread;

use ndarray::arr1;

use crate::client::ParameterClient;
use crate::config::ClientConfig;
use crate::node::{NodeSettings, RemoteParameterServer, ServerNode};
use crate::observing::{Executor, ExecutorObserve, ExecutorStore};
use crate::server::ParameterServer;
use crate::trainer::{Trainer, TrainerParameterSync, TrainerStore};
use crate::types::{ParamValue, Params};
use crate::SyncError;

fn array(values: &[f32]) -> ParamValue {
    ParamValue::Array(arr1(values).into_dyn())
}

fn initial() -> Params {
    BTreeMap::from([
        ("policy".to_string(), array(&[0.0, 0.0, 0.0])),
        ("trainer_steps".to_string(), ParamValue::Scalar(0.0)),
    ])
}

fn start_node(latency_ms: u64) -> ServerNode {
    let _ = env_logger::builder().is_test(true).try_init();
    ServerNode::start(
        ParameterServer::new(initial()),
        &NodeSettings {
            worker_threads: 2,
            latency_ms,
        },
    )
    .unwrap()
}

fn remote_config(get: &[&str], set: &[&str]) -> ClientConfig {
    ClientConfig {
        get_keys: get.iter().map(|s| s.to_string()).collect(),
        set_keys: set.iter().map(|s| s.to_string()).collect(),
        multi_process: true,
        ..Default::default()
    }
}

#[test]
fn concurrent_adds_are_not_lost() {
    let node = start_node(5);
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let transport = node.transport();
            thread::spawn(move || {
                let mut client =
                    ParameterClient::new(remote_config(&[], &[]), initial(), transport).unwrap();
                client
                    .add_async(BTreeMap::from([(
                        "trainer_steps".to_string(),
                        ParamValue::Scalar(1.0),
                    )]))
                    .unwrap();
                client.wait_for_adds().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(
        node.server().snapshot()["trainer_steps"],
        ParamValue::Scalar(3.0)
    );
    node.shutdown();
}

#[test]
fn buffered_adds_reach_the_node() {
    let node = start_node(2);
    let mut client =
        ParameterClient::new(remote_config(&[], &[]), initial(), node.transport()).unwrap();
    for _ in 0..50 {
        client
            .add_async(BTreeMap::from([(
                "trainer_steps".to_string(),
                ParamValue::Scalar(1.0),
            )]))
            .unwrap();
    }
    client.wait_for_adds().unwrap();
    assert_eq!(
        node.server().snapshot()["trainer_steps"],
        ParamValue::Scalar(50.0)
    );
    // The node saw far fewer requests than there were calls.
    assert!(node.server().stats().adds < 50);
}

#[test]
fn executor_sees_trainer_weights() {
    let node = start_node(1);

    let trainer_client =
        ParameterClient::new(remote_config(&[], &["policy"]), initial(), node.transport())
            .unwrap();
    let mut trainer = Trainer::new(
        TrainerStore::default().with_parameter_client(trainer_client),
        vec![Box::new(TrainerParameterSync::new(BTreeMap::from([(
            "trainer_steps".to_string(),
            ParamValue::Scalar(1.0),
        )])))],
    )
    .unwrap();
    trainer
        .step(|store| {
            store.weights = BTreeMap::from([("policy".to_string(), array(&[1.0, 2.0, 3.0]))]);
            Ok(())
        })
        .unwrap();
    trainer.finish().unwrap();
    // Settle the set.
    trainer
        .store
        .parameter_client
        .as_mut()
        .unwrap()
        .set_and_wait(Some(BTreeMap::from([(
            "policy".to_string(),
            array(&[1.0, 2.0, 3.0]),
        )])))
        .unwrap();

    let executor_client = ParameterClient::new(
        remote_config(&["policy", "trainer_steps"], &[]),
        initial(),
        node.transport(),
    )
    .unwrap();
    let store = ExecutorStore::new(
        &["agent_0".to_string()],
        vec![vec!["network_agent".to_string()]],
        BTreeMap::from([("network_agent".to_string(), 0)]),
    )
    .unwrap()
    .with_parameter_client(executor_client);
    let mut executor = Executor::new(store, vec![Box::new(ExecutorObserve)]);

    executor.update(true).unwrap();
    let client = executor.store.parameter_client.as_ref().unwrap();
    assert_eq!(client.value("policy"), Some(array(&[1.0, 2.0, 3.0])));
    assert_eq!(client.value("trainer_steps"), Some(ParamValue::Scalar(1.0)));
}

#[test]
fn async_get_eventually_merges() {
    let node = start_node(1);
    node.server()
        .set_parameters(BTreeMap::from([(
            "policy".to_string(),
            array(&[4.0, 4.0, 4.0]),
        )]))
        .unwrap();
    let mut client =
        ParameterClient::new(remote_config(&["policy"], &[]), initial(), node.transport())
            .unwrap();

    client.get_async().unwrap();
    while client.pending().get {
        thread::sleep(std::time::Duration::from_millis(1));
        client.get_async().unwrap();
    }
    assert_eq!(client.value("policy"), Some(array(&[4.0, 4.0, 4.0])));
}

#[test]
fn stopped_node_fails_requests() {
    let node = start_node(0);
    let futures = node.futures();
    node.shutdown();
    let result = futures.get_parameters(vec!["policy".to_string()]).result();
    assert!(matches!(result, Err(SyncError::Transport(_))));
}

#[test]
fn node_errors_reach_the_caller() {
    let node = start_node(0);
    let futures = node.futures();
    let result = futures.get_parameters(vec!["missing".to_string()]).result();
    assert_eq!(result, Err(SyncError::UnknownKey("missing".to_string())));
}
