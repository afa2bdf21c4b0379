pub mod builtin;
pub mod kit;

pub use kit::{handlers_from_kits, Kit, KitRegistry, NodeHandlers};
