use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::debug;

use wireboard_core::error::{Result, WireboardError};
use wireboard_core::event::{RunEvent, SecretRequest};
use wireboard_core::protocol::ProxyRequest;

use crate::proxy::{ProxyEndpoint, SecretResolver};
use crate::run_result::RunResult;

/// Forward an engine's stream to the caller, answering `proxy` events on
/// the trusted side.
///
/// Each proxy request runs in its own task, so only the branch that asked
/// waits for the reply. Outstanding requests are aborted once the run ends.
pub(crate) async fn relay(
    mut inner: mpsc::Receiver<RunResult>,
    outer: mpsc::Sender<RunResult>,
    endpoint: Arc<dyn ProxyEndpoint>,
) {
    let mut requests = JoinSet::new();
    while let Some(result) = inner.recv().await {
        let terminal = result.event().is_terminal();
        match result.into_parts() {
            (RunEvent::Proxy(data), Some(reply)) => {
                let endpoint = endpoint.clone();
                requests.spawn(async move {
                    debug!(node_id = %data.node.id, node_type = %data.node.node_type, "Relaying proxy request");
                    let outcome = endpoint
                        .handle(ProxyRequest {
                            node: data.node,
                            inputs: data.inputs,
                        })
                        .await
                        .map(|resp| resp.value);
                    let _ = reply.send(outcome);
                });
            }
            (event, reply) => {
                if outer.send(RunResult::from_parts(event, reply)).await.is_err() {
                    debug!("Caller dropped the run stream");
                    break;
                }
            }
        }
        if terminal {
            break;
        }
    }
    requests.abort_all();
}

/// Resolves secrets by asking the harness caller with a `secret` event.
pub(crate) struct CallerSecrets {
    outer: mpsc::Sender<RunResult>,
}

impl CallerSecrets {
    pub(crate) fn new(outer: mpsc::Sender<RunResult>) -> Self {
        Self { outer }
    }
}

impl SecretResolver for CallerSecrets {
    fn resolve(&self, names: Vec<String>) -> BoxFuture<'_, Result<HashMap<String, String>>> {
        Box::pin(async move {
            let (result, reply) = RunResult::suspended(RunEvent::Secret(SecretRequest {
                keys: names.clone(),
                node: None,
            }));
            self.outer
                .send(result)
                .await
                .map_err(|_| WireboardError::Cancelled)?;
            let values = reply
                .await
                .map_err(|_| WireboardError::InputNotSupplied("secrets".into()))??;
            names
                .into_iter()
                .map(|name| match values.get(&name) {
                    Some(Value::String(s)) => Ok((name, s.clone())),
                    Some(other) => Ok((name, other.to_string())),
                    None => Err(WireboardError::MissingSecret(name)),
                })
                .collect()
        })
    }
}
