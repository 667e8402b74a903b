use super::*;
use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::arr1;

use crate::config::ClientConfig;
use crate::node::Transport;
use crate::server::ParameterServer;
use crate::types::ParamValue;

fn array(values: &[f32]) -> ParamValue {
    ParamValue::Array(arr1(values).into_dyn())
}

fn initial() -> Params {
    BTreeMap::from([
        ("policy".to_string(), array(&[0.0, 0.0])),
        ("trainer_steps".to_string(), ParamValue::Scalar(0.0)),
    ])
}

fn trainer(server: &Arc<ParameterServer>, update_period: usize) -> Trainer {
    let client = ParameterClient::new(
        ClientConfig {
            set_keys: vec!["policy".to_string()],
            update_period,
            ..Default::default()
        },
        initial(),
        Transport::Local(server.clone()),
    )
    .unwrap();
    let sync = TrainerParameterSync::new(BTreeMap::from([(
        "trainer_steps".to_string(),
        ParamValue::Scalar(1.0),
    )]));
    Trainer::new(
        TrainerStore::default().with_parameter_client(client),
        vec![Box::new(sync)],
    )
    .unwrap()
}

#[test]
fn step_publishes_weights_and_counters() {
    let server = Arc::new(ParameterServer::new(initial()));
    let mut trainer = trainer(&server, 1);

    for i in 1..=4 {
        trainer
            .step(|store| {
                store.weights =
                    BTreeMap::from([("policy".to_string(), array(&[i as f32, 0.0]))]);
                Ok(())
            })
            .unwrap();
    }
    trainer.finish().unwrap();

    // Local sets complete right away, so every step is pushed.
    let snapshot = server.snapshot();
    assert_eq!(snapshot["trainer_steps"], ParamValue::Scalar(4.0));
    assert_eq!(snapshot["policy"], array(&[4.0, 0.0]));
    assert_eq!(trainer.store.steps, 4);
}

#[test]
fn weights_follow_update_period() {
    let server = Arc::new(ParameterServer::new(initial()));
    let mut trainer = trainer(&server, 3);

    for i in 1..=4 {
        trainer
            .step(|store| {
                store.weights =
                    BTreeMap::from([("policy".to_string(), array(&[i as f32, i as f32]))]);
                Ok(())
            })
            .unwrap();
    }
    trainer.finish().unwrap();

    // Weights are pushed every third step, counters every step.
    let snapshot = server.snapshot();
    assert_eq!(snapshot["policy"], array(&[3.0, 3.0]));
    assert_eq!(snapshot["trainer_steps"], ParamValue::Scalar(4.0));
}

#[test]
fn init_pulls_server_values() {
    let server = Arc::new(ParameterServer::new(BTreeMap::from([
        ("policy".to_string(), array(&[5.0, 6.0])),
        ("trainer_steps".to_string(), ParamValue::Scalar(10.0)),
    ])));
    let trainer = trainer(&server, 1);
    let client = trainer.store.parameter_client.as_ref().unwrap();
    assert_eq!(client.value("policy"), Some(array(&[5.0, 6.0])));
    assert_eq!(client.value("trainer_steps"), Some(ParamValue::Scalar(10.0)));
}

#[test]
fn update_errors_stop_the_step() {
    let server = Arc::new(ParameterServer::new(initial()));
    let mut trainer = trainer(&server, 1);
    let result = trainer.step(|_| Err(SyncError::Config("diverged".to_string())));
    assert!(result.is_err());
    assert_eq!(trainer.store.steps, 0);
    assert_eq!(server.snapshot()["trainer_steps"], ParamValue::Scalar(0.0));
}

#[test]
fn without_client_nothing_happens() {
    let mut trainer = Trainer::new(
        TrainerStore::default(),
        vec![Box::new(TrainerParameterSync::default())],
    )
    .unwrap();
    trainer.step(|_| Ok(())).unwrap();
    trainer.finish().unwrap();
    assert_eq!(trainer.store.steps, 1);
}
