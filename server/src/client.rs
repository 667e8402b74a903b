//! Client side of the HTTP node.
use marllib::future::{channel, ParameterFuture};
use marllib::node::RemoteParameterServer;
use marllib::server::ServerStats;
use marllib::types::Params;
use marllib::SyncError;
use serde::{de::DeserializeOwned, Serialize};
use tokio::runtime::{Builder, Runtime};

fn transport_error(error: reqwest::Error) -> SyncError {
    SyncError::Transport(error.to_string())
}

async fn send<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T, SyncError> {
    let response = request.send().await.map_err(transport_error)?;
    if response.status().is_success() {
        response.json::<T>().await.map_err(transport_error)
    } else {
        // Failed requests carry the server-side error as their body.
        Err(response.json::<SyncError>().await.map_err(transport_error)?)
    }
}

/// A parameter server node reached over HTTP.
///
/// Requests run on a private runtime, so this can be used from plain threads.
pub struct HttpParameterServer {
    base_url: String,
    client: reqwest::Client,
    runtime: Option<Runtime>,
}

impl HttpParameterServer {
    /// `address` is `host:port`, optionally prefixed with a scheme.
    pub fn connect(address: &str) -> Result<Self, SyncError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("parameter-client")
            .enable_all()
            .build()
            .map_err(|e| SyncError::Transport(format!("Failed to create runtime: {e}")))?;
        let client = {
            let _guard = runtime.enter();
            reqwest::Client::builder().build().map_err(transport_error)?
        };
        let base_url = if address.contains("://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{address}")
        };
        log::debug!("Using parameter server at {base_url}");
        Ok(Self {
            base_url,
            client,
            runtime: Some(runtime),
        })
    }

    fn url(&self, route: &str) -> String {
        format!("{}/{}", self.base_url, route)
    }

    fn post<B, T>(&self, route: &str, body: &B) -> ParameterFuture<T>
    where
        B: Serialize,
        T: DeserializeOwned + Send + 'static,
    {
        let (future, reply) = channel();
        let request = self.client.post(self.url(route)).json(body);
        match self.runtime.as_ref() {
            Some(runtime) => {
                runtime.spawn(async move { reply.complete(send(request).await) });
            }
            None => reply.complete(Err(SyncError::Transport("client is closed".to_string()))),
        }
        future
    }

    fn get_blocking<T: DeserializeOwned>(&self, route: &str) -> Result<T, SyncError> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| SyncError::Transport("client is closed".to_string()))?;
        runtime.block_on(send(self.client.get(self.url(route))))
    }

    /// Names of all parameters on the node.
    pub fn keys(&self) -> Result<Vec<String>, SyncError> {
        self.get_blocking("keys")
    }

    pub fn stats(&self) -> Result<ServerStats, SyncError> {
        self.get_blocking("stats")
    }
}

impl RemoteParameterServer for HttpParameterServer {
    fn get_parameters(&self, names: Vec<String>) -> ParameterFuture<Params> {
        self.post("get", &names)
    }

    fn set_parameters(&self, params: Params) -> ParameterFuture<()> {
        self.post("set", &params)
    }

    fn add_to_parameters(&self, params: Params) -> ParameterFuture<()> {
        self.post("add", &params)
    }
}

impl Drop for HttpParameterServer {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
