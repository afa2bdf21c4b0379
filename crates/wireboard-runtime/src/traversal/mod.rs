//! Board traversal.
//!
//! `QueuedValueState` holds the values travelling along edges.
//! `TraversalMachine` decides which node fires next and wires its outputs
//! onward. Both are synchronous; the async engine drives them.

pub mod machine;
pub mod state;

pub use machine::{Firing, TraversalMachine, TraversalResult};
pub use state::QueuedValueState;
