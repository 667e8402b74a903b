use super::*;
use std::collections::BTreeMap;

use marllib::server::ServerStats;
use marllib::types::ParamValue;

fn server() -> Arc<ParameterServer> {
    Arc::new(ParameterServer::new(BTreeMap::from([
        ("trainer_steps".to_string(), ParamValue::Scalar(1.0)),
        (
            "policy".to_string(),
            ParamValue::Array(ndarray::arr1(&[1.0f32, 2.0]).into_dyn()),
        ),
    ])))
}

#[tokio::test]
async fn get_returns_requested_parameters() {
    let api = api(server());
    let response = warp::test::request()
        .method("POST")
        .path("/get")
        .json(&vec!["trainer_steps"])
        .reply(&api)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let params: Params = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(params.len(), 1);
    assert_eq!(params["trainer_steps"], ParamValue::Scalar(1.0));
}

#[tokio::test]
async fn unknown_key_is_rejected() {
    let api = api(server());
    let response = warp::test::request()
        .method("POST")
        .path("/get")
        .json(&vec!["missing"])
        .reply(&api)
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error: SyncError = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(error, SyncError::UnknownKey("missing".to_string()));
}

#[tokio::test]
async fn add_then_stats() {
    let server = server();
    let api = api(server.clone());
    let delta: Params = BTreeMap::from([("trainer_steps".to_string(), ParamValue::Scalar(2.0))]);
    let response = warp::test::request()
        .method("POST")
        .path("/add")
        .json(&delta)
        .reply(&api)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(server.snapshot()["trainer_steps"], ParamValue::Scalar(3.0));

    let response = warp::test::request()
        .method("GET")
        .path("/stats")
        .reply(&api)
        .await;
    let stats: ServerStats = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(stats.adds, 1);
}

#[tokio::test]
async fn bad_set_is_rejected() {
    let server = server();
    let api = api(server.clone());
    let params: Params = BTreeMap::from([
        ("trainer_steps".to_string(), ParamValue::Scalar(5.0)),
        ("policy".to_string(), ParamValue::Scalar(0.0)),
    ]);
    let response = warp::test::request()
        .method("POST")
        .path("/set")
        .json(&params)
        .reply(&api)
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    // Nothing was written.
    assert_eq!(server.snapshot()["trainer_steps"], ParamValue::Scalar(1.0));
}

#[tokio::test]
async fn keys_are_listed() {
    let api = api(server());
    let response = warp::test::request()
        .method("GET")
        .path("/keys")
        .reply(&api)
        .await;
    let keys: Vec<String> = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(keys, vec!["policy".to_string(), "trainer_steps".to_string()]);
}
