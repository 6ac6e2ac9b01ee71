// Process module - per-instance lifecycle, restart policy and resource sampling

pub mod handle;
pub mod monitor;
pub mod restart;
pub mod spawner;
mod types;

#[cfg(test)]
pub(crate) mod fake;

pub use handle::{ExitOutcome, HandleEvent, ProcessHandle};
pub use monitor::{MemoryProbe, ResourceMonitor, SampleOutcome, SysinfoProbe, Violation};
pub use restart::{DoNotRestartReason, RestartDecision, RestartPolicy, RestartTracker};
pub use spawner::{Child, OsSpawner, SpawnRequest, Spawner};
pub use types::{ExitCause, ExitInfo, ProcessState, StopIntent, StopSignal};
