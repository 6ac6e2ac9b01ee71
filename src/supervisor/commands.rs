//! Messages sent from `Supervisor` handles to the actor

use crate::error::Result;
use tokio::sync::oneshot;

pub(super) type Responder = oneshot::Sender<Result<()>>;

pub(super) enum Command {
    /// Start every handle that is not already running
    StartAll { resp: Responder },
    /// Stop everything, wait for every handle to be terminal, then halt
    StopAll { resp: Responder },
    Start { id: String, resp: Responder },
    /// Resolves once every matched handle is terminal
    Stop { id: String, resp: Responder },
    /// Resolves once every matched handle has been started again
    Restart { id: String, resp: Responder },
}

impl Command {
    pub(super) fn name(&self) -> &'static str {
        match self {
            Command::StartAll { .. } => "start_all",
            Command::StopAll { .. } => "stop_all",
            Command::Start { .. } => "start",
            Command::Stop { .. } => "stop",
            Command::Restart { .. } => "restart",
        }
    }
}
