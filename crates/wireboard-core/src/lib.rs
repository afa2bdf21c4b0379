pub mod config;
pub mod error;
pub mod event;
pub mod protocol;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, WireboardError};
pub use event::RunEvent;
pub use types::*;
