pub mod engine;
pub mod harness;
pub mod loader;
pub mod pending;
pub mod proxy;
pub mod run_result;
pub mod secrets;
pub mod traversal;

pub use engine::Engine;
pub use harness::{Harness, HarnessRun, RemoteProxyClient};
pub use loader::DefaultGraphLoader;
pub use proxy::{
    AllowedFn, ProxyEndpoint, ProxyReceiver, SecretResolver, SecretTunnel, StaticSecrets,
};
pub use run_result::RunResult;
pub use secrets::SecretKeeper;
pub use traversal::{QueuedValueState, TraversalMachine, TraversalResult};
