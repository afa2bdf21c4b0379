use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::error;

use wireboard_core::error::Result;
use wireboard_core::event::RunEvent;

use crate::engine::Engine;
use crate::run_result::RunResult;

/// Run `engine` on its own OS thread with a single-threaded runtime.
///
/// The thread owns the traversal state outright; the only way in or out is
/// the event channel and the replies it carries.
pub(crate) fn spawn(engine: Engine, events: mpsc::Sender<RunResult>) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("wireboard-worker".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(error = %e, "Failed to start worker runtime");
                    let _ = events.blocking_send(RunResult::new(RunEvent::error(format!(
                        "Failed to start worker runtime: {}",
                        e
                    ))));
                    return;
                }
            };
            runtime.block_on(engine.run(events));
        })?;
    Ok(handle)
}
