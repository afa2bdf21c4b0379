//! Harness: one `run` contract over three execution topologies.
//!
//! - in-process: the engine runs on the caller's runtime with every handler.
//! - worker: the engine runs on a dedicated thread without the proxied
//!   handlers; `proxy` events come back here and run through a local
//!   `ProxyReceiver` that owns the session's secrets.
//! - remote: the engine runs here without the proxied handlers; `proxy`
//!   events are sent to a proxy server over HTTP.
//!
//! All three yield the same event vocabulary and suspend on `input` and
//! `secret` until the caller replies.

mod relay;
pub mod remote;
mod worker;

use std::sync::Arc;

use futures::stream::{self, Stream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use wireboard_core::config::{AppConfig, HarnessConfig, RunConfig, Topology};
use wireboard_core::error::{Result, WireboardError};
use wireboard_core::event::RunEvent;
use wireboard_core::traits::GraphLoader;
use wireboard_core::types::{GraphDescriptor, InputValues};
use wireboard_kits::KitRegistry;

use crate::engine::Engine;
use crate::loader::DefaultGraphLoader;
use crate::proxy::{ProxyReceiver, SecretTunnel};
use crate::run_result::RunResult;

pub use remote::RemoteProxyClient;

const EVENT_BUFFER: usize = 64;

/// Façade selecting where the engine runs.
pub struct Harness {
    kits: KitRegistry,
    run: RunConfig,
    harness: HarnessConfig,
    loader: Arc<dyn GraphLoader>,
}

impl Harness {
    pub fn new(kits: KitRegistry) -> Self {
        Self {
            kits,
            run: RunConfig::default(),
            harness: HarnessConfig::default(),
            loader: Arc::new(DefaultGraphLoader::new()),
        }
    }

    pub fn from_config(kits: KitRegistry, config: &AppConfig) -> Self {
        Self::new(kits)
            .with_run_config(config.run.clone())
            .with_harness_config(config.harness.clone())
    }

    pub fn with_run_config(mut self, run: RunConfig) -> Self {
        self.run = run;
        self
    }

    pub fn with_harness_config(mut self, harness: HarnessConfig) -> Self {
        self.harness = harness;
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn GraphLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn topology(&self) -> Topology {
        self.harness.topology
    }

    pub fn kits(&self) -> &KitRegistry {
        &self.kits
    }

    /// Load the board at `url` and run it.
    pub async fn run(&self, url: &str, inputs: InputValues) -> Result<HarnessRun> {
        let graph = self.loader.load(url).await?;
        self.run_graph(graph, inputs)
    }

    /// Run an already-loaded board. Must be called within a Tokio runtime.
    pub fn run_graph(&self, graph: GraphDescriptor, inputs: InputValues) -> Result<HarnessRun> {
        graph.validate()?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let all = self.kits.handlers();
        let proxy_nodes = self.harness.proxy_nodes.clone();

        info!(run_id = %run_id, topology = %self.harness.topology, "Starting run");

        let engine = |handlers| {
            Engine::new(graph, Arc::new(handlers))
                .with_config(self.run.clone())
                .with_inputs(inputs)
                .with_cancel(cancel.clone())
                .with_run_id(run_id.clone())
        };

        match self.harness.topology {
            Topology::InProcess => {
                if !proxy_nodes.is_empty() {
                    warn!("proxy_nodes ignored for the in-process topology");
                }
                tokio::spawn(engine(all.clone()).run(tx));
            }
            Topology::Worker => {
                let tunnels = SecretTunnel::compile_all(&self.harness.tunnels)?;
                let (inner_tx, inner_rx) = mpsc::channel(EVENT_BUFFER);
                let engine = engine(all.without(&proxy_nodes)).with_proxy_nodes(proxy_nodes.clone());
                worker::spawn(engine, inner_tx)?;
                let receiver = ProxyReceiver::new(Arc::new(all.only(&proxy_nodes)), proxy_nodes)
                    .with_resolver(Arc::new(relay::CallerSecrets::new(tx.clone())))
                    .with_tunnels(tunnels)
                    .with_timeout(self.run.node_timeout_secs);
                tokio::spawn(relay::relay(inner_rx, tx, Arc::new(receiver)));
            }
            Topology::Remote => {
                let url = self.harness.remote_url.clone().ok_or_else(|| {
                    WireboardError::Config("harness.remote_url is required for the remote topology".into())
                })?;
                let client = RemoteProxyClient::new(
                    url,
                    self.harness.remote_token.clone(),
                    run_id.clone(),
                    self.harness.request_timeout_secs,
                )?;
                let (inner_tx, inner_rx) = mpsc::channel(EVENT_BUFFER);
                let engine = engine(all.without(&proxy_nodes)).with_proxy_nodes(proxy_nodes);
                tokio::spawn(engine.run(inner_tx));
                tokio::spawn(relay::relay(inner_rx, tx, Arc::new(client)));
            }
        }

        Ok(HarnessRun {
            events: rx,
            cancel,
            run_id,
            finished: false,
        })
    }
}

/// The caller's view of one run.
pub struct HarnessRun {
    events: mpsc::Receiver<RunResult>,
    cancel: CancellationToken,
    run_id: String,
    finished: bool,
}

impl HarnessRun {
    /// Next result, or `None` once the terminal event has been yielded.
    ///
    /// If the run dies without a terminal event, a synthetic `error` is
    /// yielded so the stream still ends with exactly one of `end`/`error`.
    pub async fn next(&mut self) -> Option<RunResult> {
        if self.finished {
            return None;
        }
        match self.events.recv().await {
            Some(result) => {
                if result.event().is_terminal() {
                    self.finished = true;
                }
                Some(result)
            }
            None => {
                self.finished = true;
                Some(RunResult::new(RunEvent::error(
                    "Run ended without a terminal event",
                )))
            }
        }
    }

    /// Stop scheduling new work; the stream then ends with `end`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn into_stream(self) -> impl Stream<Item = RunResult> {
        stream::unfold(self, |mut run| async move {
            let next = run.next().await?;
            Some((next, run))
        })
    }
}
