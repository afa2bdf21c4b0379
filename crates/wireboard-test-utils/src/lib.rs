//! Mock handlers and board fixtures shared by Wireboard tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use wireboard_core::error::{Result, WireboardError};
use wireboard_core::traits::{NodeHandler, NodeHandlerContext};
use wireboard_core::types::*;

/// Turn a JSON object literal into a value bundle.
///
/// Panics if `value` is not an object.
pub fn values(value: Value) -> InputValues {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

// ── Mock handlers ───────────────────────────────────────────────

/// Stand-in for a `runJavascript` node computing `x => x * factor`.
///
/// Reads numeric input `x` and produces `result`.
pub struct MultiplyHandler {
    pub factor: f64,
}

impl MultiplyHandler {
    pub fn doubling() -> Self {
        Self { factor: 2.0 }
    }
}

impl NodeHandler for MultiplyHandler {
    fn invoke(
        &self,
        inputs: InputValues,
        ctx: NodeHandlerContext,
    ) -> BoxFuture<'_, Result<OutputValues>> {
        Box::pin(async move {
            let x = inputs.get("x").and_then(Value::as_f64).ok_or_else(|| {
                WireboardError::Handler(format!("node {} needs a numeric x", ctx.descriptor.id))
            })?;
            let product = x * self.factor;
            // Keep integers integral so assertions can compare against json!(10).
            let result = if product.fract() == 0.0 && product.abs() < i64::MAX as f64 {
                json!(product as i64)
            } else {
                json!(product)
            };
            Ok(values(json!({ "result": result })))
        })
    }
}

/// Returns its inputs unchanged and records every invocation.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    calls: Arc<Mutex<Vec<InputValues>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the inputs seen so far, in call order.
    pub fn calls(&self) -> Vec<InputValues> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl NodeHandler for RecordingHandler {
    fn invoke(
        &self,
        inputs: InputValues,
        _ctx: NodeHandlerContext,
    ) -> BoxFuture<'_, Result<OutputValues>> {
        self.calls.lock().unwrap().push(inputs.clone());
        Box::pin(async move { Ok(inputs) })
    }
}

/// Always produces the same outputs.
pub struct StaticHandler {
    pub outputs: OutputValues,
}

impl StaticHandler {
    pub fn new(outputs: Value) -> Self {
        Self {
            outputs: values(outputs),
        }
    }
}

impl NodeHandler for StaticHandler {
    fn invoke(
        &self,
        _inputs: InputValues,
        _ctx: NodeHandlerContext,
    ) -> BoxFuture<'_, Result<OutputValues>> {
        let outputs = self.outputs.clone();
        Box::pin(async move { Ok(outputs) })
    }
}

/// Fails every invocation with a fixed message.
pub struct FailingHandler {
    pub message: String,
}

impl FailingHandler {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl NodeHandler for FailingHandler {
    fn invoke(
        &self,
        _inputs: InputValues,
        _ctx: NodeHandlerContext,
    ) -> BoxFuture<'_, Result<OutputValues>> {
        let message = self.message.clone();
        Box::pin(async move { Err(WireboardError::Handler(message)) })
    }
}

/// Sleeps before echoing its inputs, tracking peak concurrency.
#[derive(Clone)]
pub struct SlowHandler {
    pub delay: Duration,
    timeout_secs: Option<u64>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            timeout_secs: None,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Highest number of invocations observed running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl NodeHandler for SlowHandler {
    fn invoke(
        &self,
        inputs: InputValues,
        _ctx: NodeHandlerContext,
    ) -> BoxFuture<'_, Result<OutputValues>> {
        Box::pin(async move {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(inputs)
        })
    }

    fn timeout_secs(&self) -> Option<u64> {
        self.timeout_secs
    }
}

// ── Board fixtures ──────────────────────────────────────────────

/// `input --x:x--> double(runJavascript) --result:y--> output`.
pub fn doubling_graph() -> GraphDescriptor {
    GraphDescriptor::new(
        vec![
            NodeDescriptor::new("input", "input").with_config(
                "schema",
                json!({
                    "type": "object",
                    "properties": { "x": { "type": "number" } }
                }),
            ),
            NodeDescriptor::new("double", "runJavascript").with_config("code", json!("x=>x*2")),
            NodeDescriptor::new("output", "output"),
        ],
        vec![
            Edge::wire("input", "x", "double", "x"),
            Edge::wire("double", "result", "output", "y"),
        ],
    )
}

/// `keys(secrets) --API_KEY:key--> fetcher(fetch) --*--> output`, for proxy tests.
pub fn fetch_graph() -> GraphDescriptor {
    GraphDescriptor::new(
        vec![
            NodeDescriptor::new("keys", "secrets").with_config("keys", json!(["API_KEY"])),
            NodeDescriptor::new("fetcher", "fetch")
                .with_config("url", json!("https://example.invalid/")),
            NodeDescriptor::new("output", "output"),
        ],
        vec![
            Edge::wire("keys", "API_KEY", "fetcher", "key"),
            Edge::star("fetcher", "output"),
        ],
    )
}

/// A config file in a temp dir. Keep the `TempDir` alive while using the path.
pub fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wireboard.toml");
    std::fs::write(&path, content).unwrap();
    (dir, path)
}

/// A board JSON file in a temp dir.
pub fn write_board(graph: &GraphDescriptor) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("board.json");
    std::fs::write(&path, serde_json::to_string_pretty(graph).unwrap()).unwrap();
    (dir, path)
}
