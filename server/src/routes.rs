use std::sync::Arc;

use log::warn;
use marllib::server::ParameterServer;
use marllib::types::Params;
use marllib::SyncError;
use serde::Serialize;
use warp::{filters::BoxedFilter, Filter, Reply};
use warp::{http::StatusCode, reply};

/// Largest accepted request body. Parameter sets carry whole weight tensors.
const BODY_LIMIT: u64 = 256 * 1024 * 1024;

#[cfg(test)]
mod tests;

/// HTTP status for a failed request.
fn status_of(error: &SyncError) -> StatusCode {
    match error {
        SyncError::UnknownKey(_)
        | SyncError::TypeMismatch { .. }
        | SyncError::ShapeMismatch { .. }
        | SyncError::UnsupportedType { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond<T: Serialize>(
    route: &str,
    result: Result<T, SyncError>,
) -> reply::WithStatus<reply::Json> {
    match result {
        Ok(value) => reply::with_status(reply::json(&value), StatusCode::OK),
        Err(error) => {
            warn!("Request to /{route} failed: {error}");
            let status = status_of(&error);
            reply::with_status(reply::json(&error), status)
        }
    }
}

fn with_server(
    server: Arc<ParameterServer>,
) -> impl Filter<Extract = (Arc<ParameterServer>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || server.clone())
}

/// Every route of a parameter server node.
pub fn api(server: Arc<ParameterServer>) -> BoxedFilter<(impl Reply,)> {
    let get = warp::path!("get")
        .and(warp::post())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::json())
        .and(with_server(server.clone()))
        .map(|names: Vec<String>, server: Arc<ParameterServer>| {
            respond("get", server.get_parameters(&names))
        });
    let set = warp::path!("set")
        .and(warp::post())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::json())
        .and(with_server(server.clone()))
        .map(|params: Params, server: Arc<ParameterServer>| {
            respond("set", server.set_parameters(params))
        });
    let add = warp::path!("add")
        .and(warp::post())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::json())
        .and(with_server(server.clone()))
        .map(|params: Params, server: Arc<ParameterServer>| {
            respond("add", server.add_to_parameters(params))
        });
    let keys = warp::path!("keys")
        .and(warp::get())
        .and(with_server(server.clone()))
        .map(|server: Arc<ParameterServer>| {
            reply::with_status(reply::json(&server.keys()), StatusCode::OK)
        });
    let stats = warp::path!("stats")
        .and(warp::get())
        .and(with_server(server))
        .map(|server: Arc<ParameterServer>| {
            reply::with_status(reply::json(&server.stats()), StatusCode::OK)
        });
    get.or(set).or(add).or(keys).or(stats).boxed()
}
