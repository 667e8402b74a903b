//! Running a [`ParameterServer`] as a remotely addressable node, and the transports clients use
//! to reach it.
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;

use crate::future::{channel, Completer, ParameterFuture};
use crate::server::ParameterServer;
use crate::types::Params;
use crate::SyncError;

/// Non-blocking facade of a parameter server node.
///
/// Every call returns immediately with a handle that resolves once the server has processed the
/// request.
pub trait RemoteParameterServer: Send + Sync {
    fn get_parameters(&self, names: Vec<String>) -> ParameterFuture<Params>;
    fn set_parameters(&self, params: Params) -> ParameterFuture<()>;
    fn add_to_parameters(&self, params: Params) -> ParameterFuture<()>;
}

/// How a client reaches the parameter server. Chosen once, when the client is built.
#[derive(Clone)]
pub enum Transport {
    /// The server lives in this process; every request executes synchronously and returns an
    /// already completed handle.
    Local(Arc<ParameterServer>),
    /// The server is a node; requests complete asynchronously.
    Remote(Arc<dyn RemoteParameterServer>),
}

impl Transport {
    pub fn is_remote(&self) -> bool {
        matches!(self, Transport::Remote(_))
    }

    pub fn get(&self, names: Vec<String>) -> ParameterFuture<Params> {
        match self {
            Transport::Local(server) => ParameterFuture::ready(server.get_parameters(&names)),
            Transport::Remote(node) => node.get_parameters(names),
        }
    }

    pub fn set(&self, params: Params) -> ParameterFuture<()> {
        match self {
            Transport::Local(server) => ParameterFuture::ready(server.set_parameters(params)),
            Transport::Remote(node) => node.set_parameters(params),
        }
    }

    pub fn add(&self, params: Params) -> ParameterFuture<()> {
        match self {
            Transport::Local(server) => ParameterFuture::ready(server.add_to_parameters(params)),
            Transport::Remote(node) => node.add_to_parameters(params),
        }
    }

    pub fn get_and_wait(&self, names: Vec<String>) -> Result<Params, SyncError> {
        match self {
            Transport::Local(server) => server.get_parameters(&names),
            Transport::Remote(node) => node.get_parameters(names).result(),
        }
    }

    pub fn set_and_wait(&self, params: Params) -> Result<(), SyncError> {
        match self {
            Transport::Local(server) => server.set_parameters(params),
            Transport::Remote(node) => node.set_parameters(params).result(),
        }
    }

    pub fn add_and_wait(&self, params: Params) -> Result<(), SyncError> {
        match self {
            Transport::Local(server) => server.add_to_parameters(params),
            Transport::Remote(node) => node.add_to_parameters(params).result(),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Transport::Local(_) => write!(f, "Transport::Local"),
            Transport::Remote(_) => write!(f, "Transport::Remote"),
        }
    }
}

/// Settings for [`ServerNode`].
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeSettings {
    /// Number of runtime worker threads.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Artificial delay before each request is served, in milliseconds.
    #[serde(default)]
    pub latency_ms: u64,
}

fn default_worker_threads() -> usize {
    2
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            latency_ms: 0,
        }
    }
}

enum Request {
    Get {
        names: Vec<String>,
        reply: Completer<Params>,
    },
    Set {
        params: Params,
        reply: Completer<()>,
    },
    Add {
        params: Params,
        reply: Completer<()>,
    },
}

impl Request {
    fn serve(self, server: &ParameterServer) {
        match self {
            Request::Get { names, reply } => reply.complete(server.get_parameters(&names)),
            Request::Set { params, reply } => reply.complete(server.set_parameters(params)),
            Request::Add { params, reply } => reply.complete(server.add_to_parameters(params)),
        }
    }
}

/// Cloneable `.futures` facade of a [`ServerNode`].
#[derive(Clone)]
pub struct NodeFutures {
    sender: mpsc::UnboundedSender<Request>,
}

impl NodeFutures {
    fn send(&self, request: Request) {
        if let Err(mpsc::error::SendError(request)) = self.sender.send(request) {
            // Dropping the request drops its completer, which fails the future.
            log::warn!("Parameter server node is not running");
            drop(request);
        }
    }
}

impl RemoteParameterServer for NodeFutures {
    fn get_parameters(&self, names: Vec<String>) -> ParameterFuture<Params> {
        let (future, reply) = channel();
        self.send(Request::Get { names, reply });
        future
    }

    fn set_parameters(&self, params: Params) -> ParameterFuture<()> {
        let (future, reply) = channel();
        self.send(Request::Set { params, reply });
        future
    }

    fn add_to_parameters(&self, params: Params) -> ParameterFuture<()> {
        let (future, reply) = channel();
        self.send(Request::Add { params, reply });
        future
    }
}

/// A [`ParameterServer`] served from its own tokio runtime.
///
/// Requests are received over a channel and each one is served on a runtime worker, so callers
/// never block on the server lock.
pub struct ServerNode {
    server: Arc<ParameterServer>,
    futures: NodeFutures,
    runtime: Option<Runtime>,
}

impl ServerNode {
    pub fn start(server: ParameterServer, settings: &NodeSettings) -> Result<Self, SyncError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(settings.worker_threads.max(1))
            .thread_name("parameter-server")
            .enable_all()
            .build()
            .map_err(|e| SyncError::Transport(format!("Failed to create runtime: {e}")))?;

        let server = Arc::new(server);
        let (sender, mut receiver) = mpsc::unbounded_channel::<Request>();
        let latency = Duration::from_millis(settings.latency_ms);

        let dispatcher_server = server.clone();
        runtime.spawn(async move {
            while let Some(request) = receiver.recv().await {
                let server = dispatcher_server.clone();
                tokio::spawn(async move {
                    if !latency.is_zero() {
                        tokio::time::sleep(latency).await;
                    }
                    request.serve(&server);
                });
            }
            log::debug!("Parameter server dispatcher stopped");
        });
        log::info!(
            "Started parameter server node with {} parameters",
            server.keys().len()
        );

        Ok(Self {
            server,
            futures: NodeFutures { sender },
            runtime: Some(runtime),
        })
    }

    /// The non-blocking facade of this node.
    pub fn futures(&self) -> NodeFutures {
        self.futures.clone()
    }

    /// A transport for clients of this node.
    pub fn transport(&self) -> Transport {
        Transport::Remote(Arc::new(self.futures()))
    }

    /// The served server, for blocking use in the same process.
    pub fn server(&self) -> &Arc<ParameterServer> {
        &self.server
    }

    /// Stop serving. Requests still in flight are abandoned and fail their futures.
    pub fn shutdown(mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
        log::info!("Parameter server node stopped");
    }
}

impl Drop for ServerNode {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
