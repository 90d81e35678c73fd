use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use flotilla_core::agents::{AgentRecord, SpawnConfig};
use flotilla_core::ids::{AgentId, MailboxId};

use crate::error::EngineError;

/// Everything a worker is started with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchSpec {
    pub agent_id: AgentId,
    pub mailbox_id: MailboxId,
    pub task: String,
    pub timeout_ms: u64,
    pub config: SpawnConfig,
}

impl From<&AgentRecord> for LaunchSpec {
    fn from(record: &AgentRecord) -> Self {
        Self {
            agent_id: record.id.clone(),
            mailbox_id: record.mailbox_id.clone(),
            task: record.task.clone(),
            timeout_ms: record.config.timeout_ms,
            config: record.config.clone(),
        }
    }
}

impl LaunchSpec {
    pub fn args(&self) -> Vec<String> {
        vec![
            "--agent-id".into(),
            self.agent_id.to_string(),
            "--mailbox-id".into(),
            self.mailbox_id.to_string(),
            "--task".into(),
            self.task.clone(),
            "--timeout-ms".into(),
            self.timeout_ms.to_string(),
        ]
    }

    pub fn env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("FLOTILLA_AGENT_ID", self.agent_id.to_string()),
            ("FLOTILLA_MAILBOX_ID", self.mailbox_id.to_string()),
            ("FLOTILLA_TASK", self.task.clone()),
            ("FLOTILLA_TIMEOUT_MS", self.timeout_ms.to_string()),
        ]
    }
}

/// How a worker ended. `code` is `None` when it was killed by a signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Control over one running worker.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Ask the worker to stop, forcing it once `grace` has passed.
    async fn terminate(&self, grace: Duration) -> Result<(), EngineError>;
}

pub struct LaunchedWorker {
    pub handle: Arc<dyn WorkerHandle>,
    /// Flips to `Some` once the worker has exited.
    pub exit: watch::Receiver<Option<WorkerExit>>,
}

/// Starts worker processes for the supervisor.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedWorker, EngineError>;
}

/// Runs each worker as a child process of the coordinator.
pub struct ProcessLauncher {
    command: Vec<String>,
}

impl ProcessLauncher {
    /// `command` is the program followed by its fixed leading arguments.
    pub fn new(command: Vec<String>) -> Result<Self, EngineError> {
        match command.first() {
            Some(program) if !program.trim().is_empty() => Ok(Self { command }),
            _ => Err(EngineError::Validation(flotilla_core::ValidationError::empty("worker_command"))),
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedWorker, EngineError> {
        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| EngineError::Spawn("empty worker command".into()))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(leading)
            .args(spec.args())
            .envs(&spec.config.env)
            .envs(spec.env())
            .stdin(Stdio::null())
            .kill_on_drop(false);
        if let Some(dir) = &spec.config.working_directory {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::Spawn(format!("{program}: {e}")))?;
        let pid = child.id();
        info!(agent_id = %spec.agent_id, pid, "worker process started");

        let (tx, rx) = watch::channel(None);
        let agent_id = spec.agent_id.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "failed to wait on worker");
                    None
                }
            };
            debug!(agent_id = %agent_id, ?code, "worker process exited");
            let _ = tx.send(Some(WorkerExit { code }));
        });

        Ok(LaunchedWorker {
            handle: Arc::new(ProcessHandle { pid, exit: rx.clone() }),
            exit: rx,
        })
    }
}

struct ProcessHandle {
    pid: Option<u32>,
    exit: watch::Receiver<Option<WorkerExit>>,
}

impl ProcessHandle {
    async fn wait_exit(&self, within: Duration) -> bool {
        let mut exit = self.exit.clone();
        let exited = matches!(
            tokio::time::timeout(within, exit.wait_for(Option::is_some)).await,
            Ok(Ok(_))
        );
        exited
    }
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn terminate(&self, grace: Duration) -> Result<(), EngineError> {
        if self.exit.borrow().is_some() {
            return Ok(());
        }
        let pid = self
            .pid
            .ok_or_else(|| EngineError::Internal("worker has no pid".into()))?;

        send_signal(pid, Signal::Term)?;
        if self.wait_exit(grace).await {
            return Ok(());
        }
        warn!(pid, ?grace, "worker ignored SIGTERM, killing");
        send_signal(pid, Signal::Kill)?;
        if self.wait_exit(grace).await {
            Ok(())
        } else {
            Err(EngineError::Timeout {
                operation: "terminate",
                after: grace * 2,
            })
        }
    }
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn send_signal(pid: u32, signal: Signal) -> Result<(), EngineError> {
    let raw = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pid = i32::try_from(pid).map_err(|_| EngineError::Internal(format!("pid {pid} out of range")))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(pid, raw) } != 0 {
        let err = std::io::Error::last_os_error();
        // Already gone.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(EngineError::Internal(format!("signal {raw} to {pid}: {err}")));
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _signal: Signal) -> Result<(), EngineError> {
    Err(EngineError::Internal(format!("cannot signal worker {pid} on this platform")))
}
