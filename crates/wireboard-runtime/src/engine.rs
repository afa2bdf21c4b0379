use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use wireboard_core::config::{RunConfig, StrandedPolicy};
use wireboard_core::error::{Result, WireboardError};
use wireboard_core::event::*;
use wireboard_core::traits::NodeHandlerContext;
use wireboard_core::types::*;
use wireboard_kits::NodeHandlers;

use crate::pending::{Completed, FiringId, PendingOutputs};
use crate::proxy::secret_names;
use crate::run_result::RunResult;
use crate::traversal::{Firing, TraversalMachine};

/// How a firing resolves.
enum Dispatch {
    /// Outputs known without waiting.
    Done(OutputValues),
    /// Outputs arrive later: a handler invocation or a suspension.
    Pending(BoxFuture<'static, Result<OutputValues>>),
}

/// Drives one run of a board to completion.
///
/// Ready opportunities fire concurrently up to `max_concurrency`; outputs
/// are wired in completion order. Every run ends with exactly one `end` or
/// `error` event.
pub struct Engine {
    graph: GraphDescriptor,
    handlers: Arc<NodeHandlers>,
    config: RunConfig,
    proxy_nodes: Vec<String>,
    presets: InputValues,
    cancel: CancellationToken,
    run_id: String,
}

impl Engine {
    pub fn new(graph: GraphDescriptor, handlers: Arc<NodeHandlers>) -> Self {
        Self {
            graph,
            handlers,
            config: RunConfig::default(),
            proxy_nodes: vec![],
            presets: InputValues::new(),
            cancel: CancellationToken::new(),
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    /// Node types to hand to the trusted side as `proxy` events.
    pub fn with_proxy_nodes(mut self, proxy_nodes: Vec<String>) -> Self {
        self.proxy_nodes = proxy_nodes;
        self
    }

    /// Values that satisfy `input` nodes without suspending.
    pub fn with_inputs(mut self, presets: InputValues) -> Self {
        self.presets = presets;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Spawn the run on the current runtime and return its event stream.
    pub fn start(self, buffer: usize) -> mpsc::Receiver<RunResult> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        tokio::spawn(self.run(tx));
        rx
    }

    /// Run to completion, sending every event to `events`.
    pub async fn run(self, events: mpsc::Sender<RunResult>) {
        let run_id = self.run_id.clone();
        let terminal = match self.drive(&events).await {
            Ok(firings) => {
                info!(run_id = %run_id, firings, "Run finished");
                RunEvent::end()
            }
            Err(WireboardError::Cancelled) if events.is_closed() => {
                debug!(run_id = %run_id, "Run stream dropped by consumer");
                return;
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Run failed");
                RunEvent::error(e.to_string())
            }
        };
        let _ = events.send(RunResult::new(terminal)).await;
    }

    async fn drive(&self, events: &mpsc::Sender<RunResult>) -> Result<u64> {
        let mut machine = TraversalMachine::new(&self.graph)?;
        let mut pending = PendingOutputs::new();
        let mut firings: u64 = 0;
        let concurrency = self.config.concurrency();

        info!(run_id = %self.run_id, nodes = self.graph.nodes.len(), "Run started");
        self.diagnostic(
            events,
            RunEvent::GraphStart(GraphStartData {
                url: self.graph.url.clone(),
                timestamp: Utc::now(),
            }),
        )
        .await?;

        loop {
            if self.cancel.is_cancelled() {
                let drained = pending.drain().await;
                info!(run_id = %self.run_id, drained, "Run cancelled");
                return Ok(firings);
            }

            while pending.len() < concurrency && !self.cancel.is_cancelled() {
                let Some(firing) = machine.next_firing() else {
                    break;
                };
                if !firing.is_ready() {
                    continue;
                }
                if firings >= self.config.max_firings as u64 {
                    warn!(run_id = %self.run_id, limit = self.config.max_firings, "Firing limit reached");
                    return Err(WireboardError::FiringLimitExceeded(self.config.max_firings));
                }
                firings += 1;
                let id = FiringId(firings);

                debug!(node_id = %firing.node_id(), node_type = %firing.descriptor.node_type, firing = %id, "Firing node");
                self.diagnostic(
                    events,
                    RunEvent::NodeStart(NodeStartData {
                        node: firing.descriptor.clone(),
                        inputs: firing.inputs.clone(),
                        firing: id.0,
                        timestamp: Utc::now(),
                    }),
                )
                .await?;

                match self.dispatch(&firing, events).await? {
                    Dispatch::Done(outputs) => {
                        self.finish(&mut machine, events, id, firing.descriptor, firing.inputs, outputs)
                            .await?;
                    }
                    Dispatch::Pending(invocation) => {
                        pending.insert(id, firing.descriptor, firing.inputs, invocation);
                    }
                }
            }

            if pending.is_empty() {
                if self.cancel.is_cancelled() || machine.has_opportunities() {
                    continue;
                }
                self.check_stranded(&machine)?;
                self.diagnostic(
                    events,
                    RunEvent::GraphEnd(GraphEndData {
                        firings,
                        timestamp: Utc::now(),
                    }),
                )
                .await?;
                return Ok(firings);
            }

            let completed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => continue,
                next = pending.next() => match next {
                    Some(completed) => completed,
                    None => continue,
                },
            };
            self.settle(&mut machine, events, completed).await?;
        }
    }

    /// Decide how `firing` produces its outputs.
    async fn dispatch(
        &self,
        firing: &Firing,
        events: &mpsc::Sender<RunResult>,
    ) -> Result<Dispatch> {
        let node = &firing.descriptor;
        let inputs = &firing.inputs;
        let node_type = node.node_type.as_str();

        if node_type == reserved::OUTPUT {
            emit(
                events,
                RunEvent::Output(OutputData {
                    node: node.clone(),
                    outputs: inputs.clone(),
                }),
            )
            .await?;
            return Ok(Dispatch::Done(OutputValues::new()));
        }

        if node_type == reserved::INPUT {
            if let Some(values) = self.preset_for(inputs) {
                debug!(node_id = %node.id, "Input satisfied by presets");
                return Ok(Dispatch::Done(values));
            }
            let event = RunEvent::Input(InputRequest {
                node: node.clone(),
                input_arguments: InputArguments {
                    schema: inputs.get("schema").cloned(),
                },
            });
            return Ok(Dispatch::Pending(self.suspend(events, event, &node.id)));
        }

        if self.proxy_nodes.iter().any(|t| t == node_type) {
            let event = RunEvent::Proxy(ProxyEventData {
                node: node.clone(),
                inputs: inputs.clone(),
            });
            return Ok(Dispatch::Pending(self.suspend(events, event, &node.id)));
        }

        if node_type == reserved::SECRETS {
            let event = RunEvent::Secret(SecretRequest {
                keys: secret_names(inputs),
                node: Some(node.clone()),
            });
            return Ok(Dispatch::Pending(self.suspend(events, event, &node.id)));
        }

        if !self.handlers.contains(node_type) {
            return Err(WireboardError::NoHandler(node_type.to_string()));
        }

        let handlers = self.handlers.clone();
        let inputs = inputs.clone();
        let ctx = NodeHandlerContext {
            descriptor: node.clone(),
            base: self.graph.url.clone(),
            run_id: self.run_id.clone(),
            cancel: self.cancel.clone(),
        };
        let timeout_secs = self.config.node_timeout_secs;
        Ok(Dispatch::Pending(Box::pin(async move {
            handlers.invoke(inputs, ctx, timeout_secs).await
        })))
    }

    /// Emit a suspension and wait for its reply.
    fn suspend(
        &self,
        events: &mpsc::Sender<RunResult>,
        event: RunEvent,
        node_id: &str,
    ) -> BoxFuture<'static, Result<OutputValues>> {
        let events = events.clone();
        let cancel = self.cancel.clone();
        let node_id = node_id.to_string();
        Box::pin(async move {
            let (result, reply) = RunResult::suspended(event);
            events
                .send(result)
                .await
                .map_err(|_| WireboardError::Cancelled)?;
            tokio::select! {
                outcome = reply => match outcome {
                    Ok(outcome) => outcome,
                    Err(_) => Err(WireboardError::InputNotSupplied(node_id)),
                },
                _ = cancel.cancelled() => Err(WireboardError::Cancelled),
            }
        })
    }

    /// Preset values for an `input` node, if they cover its schema.
    fn preset_for(&self, inputs: &InputValues) -> Option<OutputValues> {
        if self.presets.is_empty() {
            return None;
        }
        let properties = inputs
            .get("schema")
            .and_then(|s| s.get("properties"))
            .and_then(Value::as_object);
        match properties {
            Some(props) if !props.is_empty() => {
                let mut values = OutputValues::new();
                for key in props.keys() {
                    values.insert(key.clone(), self.presets.get(key)?.clone());
                }
                Some(values)
            }
            _ => Some(self.presets.clone()),
        }
    }

    async fn settle(
        &self,
        machine: &mut TraversalMachine,
        events: &mpsc::Sender<RunResult>,
        completed: Completed,
    ) -> Result<()> {
        let Completed {
            firing,
            node,
            inputs,
            outcome,
        } = completed;

        let outputs = match outcome {
            Ok(outputs) => outputs,
            // Abandoned suspension; the loop drains and ends the run.
            Err(WireboardError::Cancelled) if self.cancel.is_cancelled() => return Ok(()),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) if machine.routes_errors(&node.id) => {
                warn!(node_id = %node.id, node_type = %node.node_type, error = %e, "Routing handler failure to $error");
                error_outputs(&e)
            }
            Err(e) => return Err(e),
        };
        self.finish(machine, events, firing, node, inputs, outputs).await
    }

    async fn finish(
        &self,
        machine: &mut TraversalMachine,
        events: &mpsc::Sender<RunResult>,
        firing: FiringId,
        node: NodeDescriptor,
        inputs: InputValues,
        outputs: OutputValues,
    ) -> Result<()> {
        let new_opportunities = machine.complete(&node.id, &outputs);
        debug!(node_id = %node.id, firing = %firing, new = new_opportunities.len(), "Wired outputs");
        self.diagnostic(
            events,
            RunEvent::NodeEnd(NodeEndData {
                node,
                inputs,
                outputs,
                firing: firing.0,
                timestamp: Utc::now(),
            }),
        )
        .await
    }

    fn check_stranded(&self, machine: &TraversalMachine) -> Result<()> {
        let stranded = machine.stranded();
        if stranded.is_empty() {
            return Ok(());
        }
        match self.config.stranded {
            StrandedPolicy::End => {
                for node_id in &stranded {
                    warn!(node_id = %node_id, "Node never received its required inputs");
                }
                Ok(())
            }
            StrandedPolicy::Error => Err(WireboardError::UnsatisfiedInputs { nodes: stranded }),
        }
    }

    async fn diagnostic(&self, events: &mpsc::Sender<RunResult>, event: RunEvent) -> Result<()> {
        if self.config.diagnostics {
            emit(events, event).await
        } else {
            Ok(())
        }
    }
}

async fn emit(events: &mpsc::Sender<RunResult>, event: RunEvent) -> Result<()> {
    events
        .send(RunResult::new(event))
        .await
        .map_err(|_| WireboardError::Cancelled)
}

/// Outputs carrying a routed failure on the `$error` port.
fn error_outputs(err: &WireboardError) -> OutputValues {
    let mut outputs = OutputValues::new();
    outputs.insert(
        ERROR_PORT.to_string(),
        json!({ "kind": "error", "error": err.to_string() }),
    );
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wireboard_test_utils::{
        doubling_graph, values, FailingHandler, MultiplyHandler, RecordingHandler, SlowHandler,
        StaticHandler,
    };

    fn handlers_with(
        node_type: &str,
        handler: impl wireboard_core::traits::NodeHandler,
    ) -> Arc<NodeHandlers> {
        let mut map = NodeHandlers::new();
        map.insert(node_type, handler);
        Arc::new(map)
    }

    fn no_handlers() -> Arc<NodeHandlers> {
        Arc::new(NodeHandlers::new())
    }

    async fn collect(mut rx: mpsc::Receiver<RunResult>) -> Vec<RunEvent> {
        let mut out = vec![];
        while let Some(result) = rx.recv().await {
            out.push(result.into_event());
        }
        out
    }

    fn kinds(events: &[RunEvent]) -> Vec<&'static str> {
        events.iter().map(RunEvent::kind).collect()
    }

    #[tokio::test]
    async fn doubling_with_presets() {
        let engine = Engine::new(
            doubling_graph(),
            handlers_with("runJavascript", MultiplyHandler::doubling()),
        )
        .with_inputs(values(json!({ "x": 5 })));
        let events = collect(engine.start(16)).await;
        assert_eq!(kinds(&events), vec!["output", "end"]);
        match &events[0] {
            RunEvent::Output(data) => assert_eq!(data.outputs, values(json!({ "y": 10 }))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn diagnostics_bracket_the_run() {
        let config = RunConfig {
            diagnostics: true,
            ..RunConfig::default()
        };
        let engine = Engine::new(
            doubling_graph(),
            handlers_with("runJavascript", MultiplyHandler::doubling()),
        )
        .with_config(config)
        .with_inputs(values(json!({ "x": 1 })));
        let events = collect(engine.start(64)).await;
        let k = kinds(&events);
        assert_eq!(k.first(), Some(&"graphstart"));
        assert_eq!(&k[k.len() - 2..], &["graphend", "end"]);
        assert_eq!(k.iter().filter(|k| **k == "nodestart").count(), 3);
        assert_eq!(k.iter().filter(|k| **k == "nodeend").count(), 3);
    }

    #[tokio::test]
    async fn input_suspends_until_reply() {
        let engine = Engine::new(
            doubling_graph(),
            handlers_with("runJavascript", MultiplyHandler::doubling()),
        );
        let mut rx = engine.start(16);
        let mut first = rx.recv().await.unwrap();
        assert_eq!(first.kind(), "input");
        assert!(first.is_suspended());

        // Nothing moves while the reply is outstanding.
        let stalled = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(stalled.is_err());

        first.reply(values(json!({ "x": 21 })));
        let events = collect(rx).await;
        assert_eq!(kinds(&events), vec!["output", "end"]);
        match &events[0] {
            RunEvent::Output(data) => assert_eq!(data.outputs["y"], 42),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn dropped_reply_is_input_not_supplied() {
        let engine = Engine::new(doubling_graph(), no_handlers());
        let mut rx = engine.start(16);
        let first = rx.recv().await.unwrap();
        drop(first);
        let events = collect(rx).await;
        assert_eq!(kinds(&events), vec!["error"]);
        match &events[0] {
            RunEvent::Error(data) => assert!(data.error.contains("input")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_type_is_fatal() {
        let graph = GraphDescriptor::new(vec![NodeDescriptor::new("m", "mystery")], vec![]);
        let events = collect(Engine::new(graph, no_handlers()).start(4)).await;
        assert_eq!(kinds(&events), vec!["error"]);
        match &events[0] {
            RunEvent::Error(data) => assert!(data.error.contains("mystery")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn unrouted_failure_ends_with_error() {
        let graph = GraphDescriptor::new(
            vec![NodeDescriptor::new("bad", "fail"), NodeDescriptor::new("out", "output")],
            vec![Edge::star("bad", "out")],
        );
        let events = collect(
            Engine::new(graph, handlers_with("fail", FailingHandler::new("kaput"))).start(4),
        )
        .await;
        assert_eq!(kinds(&events), vec!["error"]);
        match &events[0] {
            RunEvent::Error(data) => {
                assert!(data.error.contains("\"fail\""));
                assert!(data.error.ends_with("kaput"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn error_port_routes_failure() {
        let graph = GraphDescriptor::new(
            vec![NodeDescriptor::new("bad", "fail"), NodeDescriptor::new("out", "output")],
            vec![Edge::wire("bad", ERROR_PORT, "out", "problem")],
        );
        let events = collect(
            Engine::new(graph, handlers_with("fail", FailingHandler::new("kaput"))).start(4),
        )
        .await;
        assert_eq!(kinds(&events), vec!["output", "end"]);
        match &events[0] {
            RunEvent::Output(data) => {
                assert_eq!(data.outputs["problem"]["kind"], "error");
                assert!(data.outputs["problem"]["error"].as_str().unwrap().ends_with("kaput"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn independent_branches_run_concurrently() {
        let slow = SlowHandler::new(Duration::from_millis(50));
        let graph = GraphDescriptor::new(
            (0..4).map(|i| NodeDescriptor::new(format!("s{}", i), "slow")).collect(),
            vec![],
        );
        let events = collect(
            Engine::new(graph, handlers_with("slow", slow.clone())).start(8),
        )
        .await;
        assert_eq!(kinds(&events), vec!["end"]);
        assert_eq!(slow.peak(), 4);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let slow = SlowHandler::new(Duration::from_millis(20));
        let graph = GraphDescriptor::new(
            (0..6).map(|i| NodeDescriptor::new(format!("s{}", i), "slow")).collect(),
            vec![],
        );
        let config = RunConfig {
            max_concurrency: 2,
            ..RunConfig::default()
        };
        let events = collect(
            Engine::new(graph, handlers_with("slow", slow.clone()))
                .with_config(config)
                .start(8),
        )
        .await;
        assert_eq!(kinds(&events), vec!["end"]);
        assert_eq!(slow.peak(), 2);
    }

    #[tokio::test]
    async fn firing_limit_stops_loops() {
        let graph = GraphDescriptor::new(
            vec![
                NodeDescriptor::new("seed", "pass").with_config("n", json!(1)),
                NodeDescriptor::new("spin", "pass"),
            ],
            vec![Edge::wire("seed", "n", "spin", "n"), Edge::wire("spin", "n", "spin", "n")],
        );
        let config = RunConfig {
            max_firings: 25,
            ..RunConfig::default()
        };
        let events = collect(
            Engine::new(graph, handlers_with("pass", RecordingHandler::new()))
                .with_config(config)
                .start(4),
        )
        .await;
        assert_eq!(kinds(&events), vec!["error"]);
        match &events[0] {
            RunEvent::Error(data) => assert!(data.error.contains("25")),
            other => panic!("unexpected {:?}", other),
        }
    }

    fn stranded_graph() -> GraphDescriptor {
        GraphDescriptor::new(
            vec![
                NodeDescriptor::new("a", "pass").with_config("v", json!(1)),
                NodeDescriptor::new("never", "pass"),
                NodeDescriptor::new("join", "pass"),
            ],
            vec![
                Edge::wire("a", "v", "join", "left"),
                Edge::wire("never", "nothing", "join", "right"),
            ],
        )
    }

    #[tokio::test]
    async fn stranded_nodes_end_by_default() {
        let events = collect(
            Engine::new(stranded_graph(), handlers_with("pass", RecordingHandler::new()))
                .start(4),
        )
        .await;
        assert_eq!(kinds(&events), vec!["end"]);
    }

    #[tokio::test]
    async fn stranded_nodes_can_fail_the_run() {
        let config = RunConfig {
            stranded: StrandedPolicy::Error,
            ..RunConfig::default()
        };
        let events = collect(
            Engine::new(stranded_graph(), handlers_with("pass", RecordingHandler::new()))
                .with_config(config)
                .start(4),
        )
        .await;
        assert_eq!(kinds(&events), vec!["error"]);
        match &events[0] {
            RunEvent::Error(data) => assert!(data.error.contains("join")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn fan_in_from_one_producer_is_not_stranded() {
        let graph = GraphDescriptor::new(
            vec![NodeDescriptor::new("a", "produce"), NodeDescriptor::new("sink", "output")],
            vec![
                Edge::wire("a", "x", "sink", "left"),
                Edge::wire("a", "y", "sink", "right"),
            ],
        );
        let config = RunConfig {
            stranded: StrandedPolicy::Error,
            ..RunConfig::default()
        };
        let producer = StaticHandler::new(json!({ "x": 1, "y": 2 }));
        let events = collect(
            Engine::new(graph, handlers_with("produce", producer))
                .with_config(config)
                .start(4),
        )
        .await;
        assert_eq!(kinds(&events), vec!["output", "end"]);
        match &events[0] {
            RunEvent::Output(data) => {
                assert_eq!(data.outputs, values(json!({ "left": 1, "right": 2 })))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancel_abandons_suspensions_and_ends() {
        let cancel = CancellationToken::new();
        let engine = Engine::new(doubling_graph(), no_handlers()).with_cancel(cancel.clone());
        let mut rx = engine.start(4);
        let pending_input = rx.recv().await.unwrap();
        assert_eq!(pending_input.kind(), "input");
        cancel.cancel();
        let events = collect(rx).await;
        assert_eq!(kinds(&events), vec!["end"]);
        drop(pending_input);
    }

    #[tokio::test]
    async fn proxied_types_become_proxy_events() {
        let graph = GraphDescriptor::new(
            vec![NodeDescriptor::new("f", "fetch"), NodeDescriptor::new("out", "output")],
            vec![Edge::star("f", "out")],
        );
        let engine = Engine::new(graph, no_handlers()).with_proxy_nodes(vec!["fetch".into()]);
        let mut rx = engine.start(4);
        let mut proxy = rx.recv().await.unwrap();
        assert_eq!(proxy.kind(), "proxy");
        assert!(proxy.is_suspended());

        // The proxied branch waits for the reply.
        let stalled = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(stalled.is_err());

        proxy.reply(values(json!({ "response": "ok" })));
        let events = collect(rx).await;
        assert_eq!(kinds(&events), vec!["output", "end"]);
    }

    #[tokio::test]
    async fn secrets_node_asks_the_caller() {
        let graph = GraphDescriptor::new(
            vec![
                NodeDescriptor::new("keys", "secrets").with_config("keys", json!(["TOKEN"])),
                NodeDescriptor::new("out", "output"),
            ],
            vec![Edge::wire("keys", "TOKEN", "out", "token")],
        );
        let mut rx = Engine::new(graph, no_handlers()).start(4);
        let mut secret = rx.recv().await.unwrap();
        match secret.event() {
            RunEvent::Secret(req) => assert_eq!(req.keys, vec!["TOKEN".to_string()]),
            other => panic!("unexpected {:?}", other),
        }
        secret.reply(values(json!({ "TOKEN": "abc" })));
        let events = collect(rx).await;
        match &events[0] {
            RunEvent::Output(data) => assert_eq!(data.outputs["token"], "abc"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
