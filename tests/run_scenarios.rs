use serde_json::json;

use wireboard_core::config::{HarnessConfig, RunConfig, Topology};
use wireboard_core::event::RunEvent;
use wireboard_core::types::GraphDescriptor;
use wireboard_kits::{Kit, KitRegistry};
use wireboard_runtime::{Harness, HarnessRun};
use wireboard_test_utils::{doubling_graph, values, write_board, MultiplyHandler};

const GREETING_BOARD: &str = r#"{
  "title": "Greeting",
  "nodes": [
    { "id": "ask", "type": "input",
      "configuration": { "schema": { "type": "object", "properties": { "name": { "type": "string" } } } } },
    { "id": "greet", "type": "promptTemplate",
      "configuration": { "template": "Hello, {{name}}!" } },
    { "id": "show", "type": "output" }
  ],
  "edges": [
    { "from": "ask", "to": "greet", "out": "name", "in": "name" },
    { "from": "greet", "to": "show", "out": "prompt", "in": "text" }
  ]
}"#;

async fn collect(mut run: HarnessRun) -> Vec<RunEvent> {
    let mut events = vec![];
    while let Some(result) = run.next().await {
        events.push(result.into_event());
    }
    events
}

fn outputs(events: &[RunEvent]) -> Vec<serde_json::Value> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Output(data) => Some(serde_json::Value::Object(data.outputs.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn doubling_board_yields_output_then_end() {
    let kits = KitRegistry::with_builtins();
    let mut kits_with_js = KitRegistry::new(vec![
        Kit::new("test:js").with_handler("runJavascript", MultiplyHandler::doubling())
    ]);
    for kit in kits.kits() {
        kits_with_js.register_kit(kit.clone());
    }

    let run = Harness::new(kits_with_js)
        .run_graph(doubling_graph(), values(json!({ "x": 5 })))
        .unwrap();
    let events = collect(run).await;

    let kinds: Vec<_> = events.iter().map(RunEvent::kind).collect();
    assert_eq!(kinds, vec!["output", "end"]);
    assert_eq!(outputs(&events), vec![json!({ "y": 10 })]);
}

#[tokio::test]
async fn greeting_board_runs_in_every_local_topology() {
    let graph = GraphDescriptor::from_json(GREETING_BOARD).unwrap();

    for (topology, proxied) in [
        (Topology::InProcess, vec![]),
        (Topology::Worker, vec![]),
        (Topology::Worker, vec!["promptTemplate".to_string()]),
    ] {
        let harness = Harness::new(KitRegistry::with_builtins()).with_harness_config(HarnessConfig {
            topology,
            proxy_nodes: proxied.clone(),
            ..HarnessConfig::default()
        });
        let run = harness
            .run_graph(graph.clone(), values(json!({ "name": "Ada" })))
            .unwrap();
        let events = collect(run).await;
        assert_eq!(
            outputs(&events),
            vec![json!({ "text": "Hello, Ada!" })],
            "topology {} proxying {:?}",
            topology,
            proxied
        );
        assert_eq!(events.last().map(RunEvent::kind), Some("end"));
    }
}

#[tokio::test]
async fn board_file_runs_with_diagnostics() {
    let graph = GraphDescriptor::from_json(GREETING_BOARD).unwrap();
    let (_dir, path) = write_board(&graph);

    let harness = Harness::new(KitRegistry::with_builtins()).with_run_config(RunConfig {
        diagnostics: true,
        ..RunConfig::default()
    });
    let run = harness
        .run(path.to_str().unwrap(), values(json!({ "name": "Grace" })))
        .await
        .unwrap();
    let events = collect(run).await;

    let kinds: Vec<_> = events.iter().map(RunEvent::kind).collect();
    assert_eq!(kinds.first(), Some(&"graphstart"));
    assert_eq!(kinds[kinds.len() - 2..], ["graphend", "end"]);
    assert_eq!(kinds.iter().filter(|k| **k == "nodestart").count(), 3);
    assert_eq!(outputs(&events), vec![json!({ "text": "Hello, Grace!" })]);
}

#[tokio::test]
async fn missing_template_parameter_fails_the_run() {
    let graph = GraphDescriptor::from_json(GREETING_BOARD).unwrap();
    let run = Harness::new(KitRegistry::with_builtins())
        .run_graph(graph, values(json!({ "name": "Ada", "other": 1 })))
        .unwrap();

    // Presets cover the schema, so the template sees `name` and succeeds.
    let events = collect(run).await;
    assert_eq!(events.last().map(RunEvent::kind), Some("end"));

    let broken = GraphDescriptor::from_json(
        &GREETING_BOARD.replace("Hello, {{name}}!", "Hello, {{name}} from {{place}}!"),
    )
    .unwrap();
    let run = Harness::new(KitRegistry::with_builtins())
        .run_graph(broken, values(json!({ "name": "Ada" })))
        .unwrap();
    let events = collect(run).await;
    match events.last() {
        Some(RunEvent::Error(data)) => {
            assert!(data.error.contains("place"), "{}", data.error);
        }
        other => panic!("expected error, got {:?}", other),
    }
    assert!(outputs(&events).is_empty());
}
