use tokio::sync::oneshot;

use wireboard_core::error::Result;
use wireboard_core::event::RunEvent;
use wireboard_core::types::InputValues;

/// Sender half of a suspension. The engine branch waits on the receiver.
pub type ReplySender = oneshot::Sender<Result<InputValues>>;

/// One item of a run stream: an event plus, at suspension points, the
/// means to resume the waiting branch.
#[derive(Debug)]
pub struct RunResult {
    event: RunEvent,
    reply: Option<ReplySender>,
}

impl RunResult {
    /// A result that needs no reply.
    pub fn new(event: RunEvent) -> Self {
        Self { event, reply: None }
    }

    /// A suspension point, with the receiver the suspended branch awaits.
    pub fn suspended(event: RunEvent) -> (Self, oneshot::Receiver<Result<InputValues>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                event,
                reply: Some(tx),
            },
            rx,
        )
    }

    pub fn from_parts(event: RunEvent, reply: Option<ReplySender>) -> Self {
        Self { event, reply }
    }

    pub fn into_parts(self) -> (RunEvent, Option<ReplySender>) {
        (self.event, self.reply)
    }

    pub fn event(&self) -> &RunEvent {
        &self.event
    }

    pub fn into_event(self) -> RunEvent {
        self.event
    }

    pub fn kind(&self) -> &'static str {
        self.event.kind()
    }

    /// Whether a reply is still owed.
    pub fn is_suspended(&self) -> bool {
        self.reply.is_some()
    }

    /// Resume the suspended branch with `values`.
    ///
    /// Returns false, and does nothing, if this result is not a suspension
    /// point or was already answered.
    pub fn reply(&mut self, values: InputValues) -> bool {
        self.send(Ok(values))
    }

    /// Fail the suspended branch instead of resuming it.
    pub fn reply_error(&mut self, err: wireboard_core::WireboardError) -> bool {
        self.send(Err(err))
    }

    fn send(&mut self, outcome: Result<InputValues>) -> bool {
        match self.reply.take() {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }
}
