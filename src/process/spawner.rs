use crate::config::ProcessSpec;
use crate::error::{Result, VigilError};
use crate::logs::{LogOrigin, LogSink, LogStream};
use crate::process::types::{ExitInfo, StopSignal};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Everything needed to create one OS process for an instance
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub instance_id: String,
    pub instance_index: usize,
    pub spec: Arc<ProcessSpec>,
    /// Variables set on top of the supervisor's inherited environment
    pub env: HashMap<String, String>,
}

impl SpawnRequest {
    pub fn origin(&self) -> LogOrigin {
        LogOrigin {
            spec_name: self.spec.name.clone(),
            instance_id: self.instance_id.clone(),
            instance_index: self.instance_index,
        }
    }
}

/// Layer supervisor-injected variables under the spec's own `env`: user config wins
pub fn overlay_env(
    injected: &HashMap<String, String>,
    spec_env: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = injected.clone();
    env.extend(spec_env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// Capability to create OS processes
#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn Child>>;
}

/// A live child process, owned by its watcher task
#[async_trait]
pub trait Child: Send {
    fn pid(&self) -> u32;

    /// Deliver a stop signal; a process that is already gone is not an error
    fn signal(&mut self, signal: StopSignal) -> Result<()>;

    /// Wait for the process to exit. Must be cancel safe.
    async fn wait(&mut self) -> Result<ExitInfo>;
}

/// Spawner backed by `tokio::process`, forwarding output to an optional log sink
#[derive(Clone, Default)]
pub struct OsSpawner {
    log_sink: Option<Arc<dyn LogSink>>,
}

impl OsSpawner {
    pub fn new() -> Self {
        Self { log_sink: None }
    }

    pub fn with_log_sink(log_sink: Arc<dyn LogSink>) -> Self {
        Self {
            log_sink: Some(log_sink),
        }
    }
}

#[async_trait]
impl Spawner for OsSpawner {
    async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn Child>> {
        let spec = &request.spec;

        // Bare names are resolved through PATH by the OS; only explicit paths are checked here
        let resolved = match spec.cwd {
            Some(ref cwd) if spec.executable.is_relative() => cwd.join(&spec.executable),
            _ => spec.executable.clone(),
        };
        if spec.executable.components().count() > 1 && !resolved.exists() {
            return Err(VigilError::Spawn(
                request.instance_id.clone(),
                format!("executable does not exist: {}", spec.executable.display()),
            ));
        }

        #[cfg(unix)]
        let stop_signal = parse_signal(&spec.stop_signal)?;

        let mut command = Command::new(&spec.executable);
        command.args(&spec.args);
        command.envs(&request.env);

        if let Some(ref cwd) = spec.cwd {
            command.current_dir(cwd);
        }

        command.stdin(Stdio::null());
        if self.log_sink.is_some() {
            command.stdout(Stdio::piped());
            command.stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::null());
            command.stderr(Stdio::null());
        }
        command.kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| VigilError::Spawn(request.instance_id.clone(), e.to_string()))?;

        let pid = child.id().ok_or_else(|| {
            VigilError::Spawn(
                request.instance_id.clone(),
                "process exited before its PID could be read".to_string(),
            )
        })?;

        if let Some(ref sink) = self.log_sink {
            let origin = request.origin();
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(forward_lines(
                    stdout,
                    origin.clone(),
                    LogStream::Stdout,
                    Arc::clone(sink),
                ));
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(forward_lines(
                    stderr,
                    origin,
                    LogStream::Stderr,
                    Arc::clone(sink),
                ));
            }
        }

        debug!("Spawned {} (PID: {})", request.instance_id, pid);

        Ok(Box::new(OsChild {
            child,
            pid,
            #[cfg(unix)]
            stop_signal,
        }))
    }
}

/// Drain a child pipe until EOF, handing each line to the sink.
///
/// Lines are split on raw bytes and decoded lossily, so output that is not
/// UTF-8 never stops the drain. Closing the read end early would kill the
/// child with SIGPIPE on its next write.
async fn forward_lines<R>(reader: R, origin: LogOrigin, stream: LogStream, sink: Arc<dyn LogSink>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                if let Err(e) = sink.write_line(&origin, stream, line).await {
                    warn!("Dropping log line from {}: {}", origin.instance_id, e);
                }
            }
            Err(e) => {
                warn!("Error reading {:?} of {}: {}", stream, origin.instance_id, e);
            }
        }
    }

    debug!("{:?} of {} closed", stream, origin.instance_id);
}

struct OsChild {
    child: tokio::process::Child,
    pid: u32,
    #[cfg(unix)]
    stop_signal: Signal,
}

#[async_trait]
impl Child for OsChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn signal(&mut self, stop: StopSignal) -> Result<()> {
        match stop {
            #[cfg(unix)]
            StopSignal::Graceful => {
                match signal::kill(Pid::from_raw(self.pid as i32), self.stop_signal) {
                    Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
                    Err(e) => Err(VigilError::Signal(format!(
                        "Failed to send {} to PID {}: {}",
                        self.stop_signal, self.pid, e
                    ))),
                }
            }
            #[cfg(not(unix))]
            StopSignal::Graceful => self.force(),
            StopSignal::Kill => self.force(),
        }
    }

    async fn wait(&mut self) -> Result<ExitInfo> {
        let status = self.child.wait().await?;

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            Ok(ExitInfo::Exited {
                code: status.code(),
                signal: status.signal(),
            })
        }

        #[cfg(not(unix))]
        Ok(ExitInfo::Exited {
            code: status.code(),
            signal: None,
        })
    }
}

impl OsChild {
    fn force(&mut self) -> Result<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already reaped
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(VigilError::Signal(format!(
                "Failed to kill PID {}: {}",
                self.pid, e
            ))),
        }
    }
}

/// Map a configured signal name to a nix signal
#[cfg(unix)]
pub fn parse_signal(signal_name: &str) -> Result<Signal> {
    match signal_name {
        "SIGTERM" => Ok(Signal::SIGTERM),
        "SIGINT" => Ok(Signal::SIGINT),
        "SIGQUIT" => Ok(Signal::SIGQUIT),
        "SIGHUP" => Ok(Signal::SIGHUP),
        "SIGUSR1" => Ok(Signal::SIGUSR1),
        "SIGUSR2" => Ok(Signal::SIGUSR2),
        _ => Err(VigilError::Signal(format!(
            "Invalid signal name: {}",
            signal_name
        ))),
    }
}
