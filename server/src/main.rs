use std::net::SocketAddr;
use std::sync::Arc;

use marllib::config::{read_yaml_file, ServerConfig};
use marllib::server::ParameterServer;
use server::routes;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config: ServerConfig = match std::env::args().nth(1) {
        Some(path) => match read_yaml_file(&path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("{e}");
                return;
            }
        },
        None => {
            log::info!("No configuration given, serving an empty store");
            ServerConfig::default()
        }
    };

    let addr: SocketAddr = match config.address.parse() {
        Ok(addr) => addr,
        Err(e) => {
            log::error!("Cannot parse the address {}: {e}", config.address);
            return;
        }
    };
    let server = Arc::new(ParameterServer::new(config.initial_parameters()));
    log::info!(
        "Serving {} parameters on {addr}: {}",
        server.keys().len(),
        server.keys().join(", ")
    );

    let api = routes::api(server);
    warp::serve(api).run(addr).await;
}
