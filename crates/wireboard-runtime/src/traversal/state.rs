use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use wireboard_core::types::*;

/// Port name to FIFO of values waiting on that port.
pub type NodeValuesQueues = BTreeMap<String, VecDeque<NodeValue>>;

/// Node id to its port queues.
pub type NodeValuesQueuesMap = BTreeMap<NodeId, NodeValuesQueues>;

/// Values in flight between nodes for one run.
///
/// Ordinary edges feed `state`, where each firing consumes the oldest value
/// per port. Constant edges feed `constants`, which holds the latest value
/// per port and is never consumed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueuedValueState {
    state: NodeValuesQueuesMap,
    constants: BTreeMap<NodeId, InputValues>,
}

impl QueuedValueState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `outputs` along each edge in `opportunities`.
    ///
    /// Control edges carry nothing. `out: "*"` forwards every output key
    /// under its own name. Otherwise `outputs[out]` lands on port `in`.
    pub fn wire_outputs(&mut self, opportunities: &[Edge], outputs: &OutputValues) {
        for edge in opportunities {
            let Some(out) = edge.out.as_deref() else {
                continue;
            };
            if out == STAR_PORT {
                for (key, value) in outputs {
                    self.push(edge, key, value.clone());
                }
                continue;
            }
            let Some(port) = edge.in_port.as_deref().filter(|p| !p.is_empty()) else {
                continue;
            };
            if let Some(value) = outputs.get(out) {
                self.push(edge, port, value.clone());
            }
        }
    }

    fn push(&mut self, edge: &Edge, port: &str, value: NodeValue) {
        if edge.constant {
            self.constants
                .entry(edge.to.clone())
                .or_default()
                .insert(port.to_string(), value);
        } else {
            self.state
                .entry(edge.to.clone())
                .or_default()
                .entry(port.to_string())
                .or_default()
                .push_back(value);
        }
    }

    /// Preview the values a firing of `node_id` would receive.
    ///
    /// Constants first, then the oldest queued value of each ordinary port
    /// on top. Nothing is removed.
    pub fn get_available_inputs(&self, node_id: &str) -> InputValues {
        let mut inputs = self.constants.get(node_id).cloned().unwrap_or_default();
        if let Some(queues) = self.state.get(node_id) {
            for (port, queue) in queues {
                if let Some(front) = queue.front() {
                    inputs.insert(port.clone(), front.clone());
                }
            }
        }
        inputs
    }

    /// Consume the oldest queued value of every ordinary port named in
    /// `inputs`. Constants are left in place.
    pub fn use_inputs(&mut self, node_id: &str, inputs: &InputValues) {
        let Some(queues) = self.state.get_mut(node_id) else {
            return;
        };
        for port in inputs.keys() {
            if let Some(queue) = queues.get_mut(port) {
                queue.pop_front();
                if queue.is_empty() {
                    queues.remove(port);
                }
            }
        }
        if queues.is_empty() {
            self.state.remove(node_id);
        }
    }

    /// Number of ordinary values waiting on `node_id`'s port.
    pub fn queued(&self, node_id: &str, port: &str) -> usize {
        self.state
            .get(node_id)
            .and_then(|q| q.get(port))
            .map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty() && self.constants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wireboard_test_utils::values;

    #[test]
    fn fan_in_is_fifo() {
        let mut state = QueuedValueState::new();
        let edges = [
            Edge::wire("a", "v", "sink", "in"),
            Edge::wire("b", "v", "sink", "in"),
            Edge::wire("c", "v", "sink", "in"),
        ];
        for (edge, n) in edges.iter().zip([1, 2, 3]) {
            state.wire_outputs(std::slice::from_ref(edge), &values(json!({ "v": n })));
        }
        assert_eq!(state.queued("sink", "in"), 3);

        let mut seen = vec![];
        while state.queued("sink", "in") > 0 {
            let inputs = state.get_available_inputs("sink");
            seen.push(inputs["in"].clone());
            state.use_inputs("sink", &inputs);
        }
        assert_eq!(seen, vec![json!(1), json!(2), json!(3)]);
        assert!(state.is_empty());
    }

    #[test]
    fn constants_survive_use_until_overwritten() {
        let mut state = QueuedValueState::new();
        let edge = Edge::wire("cfg", "k", "n", "key").constant();
        state.wire_outputs(std::slice::from_ref(&edge), &values(json!({ "k": "first" })));

        for _ in 0..3 {
            let inputs = state.get_available_inputs("n");
            assert_eq!(inputs["key"], "first");
            state.use_inputs("n", &inputs);
        }

        state.wire_outputs(std::slice::from_ref(&edge), &values(json!({ "k": "second" })));
        assert_eq!(state.get_available_inputs("n")["key"], "second");
    }

    #[test]
    fn queued_value_overrides_constant_on_same_port() {
        let mut state = QueuedValueState::new();
        state.wire_outputs(
            &[Edge::wire("a", "x", "n", "p").constant()],
            &values(json!({ "x": "const" })),
        );
        state.wire_outputs(&[Edge::wire("b", "x", "n", "p")], &values(json!({ "x": "fresh" })));

        let inputs = state.get_available_inputs("n");
        assert_eq!(inputs["p"], "fresh");
        state.use_inputs("n", &inputs);
        assert_eq!(state.get_available_inputs("n")["p"], "const");
    }

    #[test]
    fn star_forwards_every_key() {
        let mut state = QueuedValueState::new();
        state.wire_outputs(
            &[Edge::star("src", "dst")],
            &values(json!({ "a": 1, "b": "two", "c": [3] })),
        );
        let inputs = state.get_available_inputs("dst");
        assert_eq!(inputs, values(json!({ "a": 1, "b": "two", "c": [3] })));
    }

    #[test]
    fn control_edges_and_absent_outputs_carry_nothing() {
        let mut state = QueuedValueState::new();
        state.wire_outputs(
            &[Edge::control("a", "b"), Edge::wire("a", "missing", "b", "p")],
            &values(json!({ "present": 1 })),
        );
        assert!(state.is_empty());
    }

    #[test]
    fn preview_does_not_consume() {
        let mut state = QueuedValueState::new();
        state.wire_outputs(&[Edge::wire("a", "x", "b", "x")], &values(json!({ "x": 1 })));
        let _ = state.get_available_inputs("b");
        let _ = state.get_available_inputs("b");
        assert_eq!(state.queued("b", "x"), 1);
    }
}
