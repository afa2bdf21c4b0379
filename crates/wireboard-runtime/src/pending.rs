use std::fmt;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};

use wireboard_core::error::Result;
use wireboard_core::types::{InputValues, NodeDescriptor, OutputValues};

/// Identity of one firing. A node that fires twice gets two ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiringId(pub u64);

impl fmt::Display for FiringId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A finished firing.
pub struct Completed {
    pub firing: FiringId,
    pub node: NodeDescriptor,
    pub inputs: InputValues,
    pub outcome: Result<OutputValues>,
}

/// Invocations in flight, resolved in completion order.
#[derive(Default)]
pub struct PendingOutputs {
    in_flight: FuturesUnordered<BoxFuture<'static, Completed>>,
}

impl PendingOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        firing: FiringId,
        node: NodeDescriptor,
        inputs: InputValues,
        invocation: BoxFuture<'static, Result<OutputValues>>,
    ) {
        self.in_flight.push(Box::pin(async move {
            let outcome = invocation.await;
            Completed {
                firing,
                node,
                inputs,
                outcome,
            }
        }));
    }

    /// Wait for whichever invocation finishes first.
    pub async fn next(&mut self) -> Option<Completed> {
        self.in_flight.next().await
    }

    /// Await everything still in flight, discarding results.
    pub async fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.in_flight.next().await.is_some() {
            drained += 1;
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn delayed(ms: u64, tag: &str) -> BoxFuture<'static, Result<OutputValues>> {
        let tag = tag.to_string();
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            let mut out = OutputValues::new();
            out.insert("tag".into(), tag.into());
            Ok(out)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_in_completion_order() {
        let mut pending = PendingOutputs::new();
        let node = NodeDescriptor::new("n", "slow");
        pending.insert(FiringId(1), node.clone(), InputValues::new(), delayed(30, "late"));
        pending.insert(FiringId(2), node.clone(), InputValues::new(), delayed(10, "early"));
        assert_eq!(pending.len(), 2);

        let first = pending.next().await.unwrap();
        assert_eq!(first.firing, FiringId(2));
        let second = pending.next().await.unwrap();
        assert_eq!(second.firing, FiringId(1));
        assert_eq!(second.outcome.unwrap()["tag"], "late");
        assert!(pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn same_node_fires_twice_under_distinct_ids() {
        let mut pending = PendingOutputs::new();
        let node = NodeDescriptor::new("loop", "slow");
        pending.insert(FiringId(7), node.clone(), InputValues::new(), delayed(5, "a"));
        pending.insert(FiringId(8), node, InputValues::new(), delayed(5, "b"));
        let mut ids = vec![
            pending.next().await.unwrap().firing,
            pending.next().await.unwrap().firing,
        ];
        ids.sort();
        assert_eq!(ids, vec![FiringId(7), FiringId(8)]);
        assert_eq!(pending.drain().await, 0);
    }
}
