use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use flotilla_core::agents::{AgentRecord, AgentStatus, ResourceSample};
use flotilla_core::clock::elapsed_ms;

use super::launcher::{LaunchedWorker, WorkerExit};
use super::Shared;
use crate::error::EngineError;

pub(crate) type Reply = oneshot::Sender<Result<AgentRecord, EngineError>>;

pub(crate) enum AgentCommand {
    Heartbeat {
        sample: Option<ResourceSample>,
        reply: Reply,
    },
    CheckHealth {
        reply: Reply,
    },
    Terminate {
        reason: String,
        reply: Reply,
    },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Owns one agent's state machine for as long as the agent is live.
pub(crate) struct AgentActor {
    shared: Arc<Shared>,
    record: AgentRecord,
    worker: LaunchedWorker,
    worker_exited: bool,
    commands: mpsc::Receiver<AgentCommand>,
}

impl AgentActor {
    pub(crate) fn new(
        shared: Arc<Shared>,
        record: AgentRecord,
        worker: LaunchedWorker,
        commands: mpsc::Receiver<AgentCommand>,
    ) -> Self {
        Self {
            shared,
            record,
            worker,
            worker_exited: false,
            commands,
        }
    }

    // Boxed: recovery starts a new actor from inside this one.
    pub(crate) fn run(mut self) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let cancel = self.shared.cancel.clone();
            loop {
                let flow = tokio::select! {
                    () = cancel.cancelled() => Flow::Stop,
                    command = self.commands.recv() => match command {
                        Some(command) => self.handle(command).await,
                        None => Flow::Stop,
                    },
                    changed = self.worker.exit.changed(), if !self.worker_exited => {
                        let exit = match changed {
                            Ok(()) => *self.worker.exit.borrow(),
                            Err(_) => Some(WorkerExit { code: None }),
                        };
                        match exit {
                            Some(exit) => self.on_exit(exit).await,
                            None => Flow::Continue,
                        }
                    }
                };
                if flow == Flow::Stop {
                    break;
                }
            }
            self.detach();
            debug!(agent_id = %self.record.id, status = %self.record.status, "agent actor stopped");
        })
    }

    fn detach(&self) {
        self.shared.actors.remove(&self.record.id);
    }

    async fn handle(&mut self, command: AgentCommand) -> Flow {
        let (result, flow, reply) = match command {
            AgentCommand::Heartbeat { sample, reply } => (self.heartbeat(sample), Flow::Continue, reply),
            AgentCommand::CheckHealth { reply } => {
                let (result, flow) = self.check_health().await;
                (result, flow, reply)
            }
            AgentCommand::Terminate { reason, reply } => {
                let result = self.terminate(&reason).await;
                (result, Flow::Stop, reply)
            }
        };
        // Leave the actor table before answering so callers never see a
        // retired agent as supervised.
        if flow == Flow::Stop {
            self.detach();
        }
        let _ = reply.send(result);
        flow
    }

    fn heartbeat(&mut self, sample: Option<ResourceSample>) -> Result<AgentRecord, EngineError> {
        let now = self.shared.clock.now();
        let previous = self.record.status;
        let mut next = self.record.clone();
        next.last_heartbeat_at = Some(now);
        if matches!(previous, AgentStatus::Spawning | AgentStatus::Unhealthy) {
            next.status = AgentStatus::Running;
        }
        self.record = self.shared.save(&next)?;

        if let Some(sample) = sample {
            self.shared
                .agents
                .record_sample(&self.record.id, &sample, self.shared.config.sample_capacity)?;
        }
        if previous != self.record.status {
            info!(agent_id = %self.record.id, from = %previous, "agent running");
            self.shared.emit(&self.record, None);
        }
        Ok(self.record.clone())
    }

    async fn check_health(&mut self) -> (Result<AgentRecord, EngineError>, Flow) {
        let now = self.shared.clock.now();
        if matches!(self.record.status, AgentStatus::Spawning | AgentStatus::Running) {
            let since = self.record.last_heartbeat_at.unwrap_or(self.record.created_at);
            let silent_ms = elapsed_ms(since, now);
            let timeout_ms = duration_ms(self.shared.config.heartbeat_timeout);
            if silent_ms > timeout_ms {
                let detail = format!("no heartbeat for {silent_ms} ms");
                if let Err(e) = self.transition(AgentStatus::Unhealthy, Some(detail)) {
                    return (Err(e), Flow::Continue);
                }
            }
        }
        if self.record.status == AgentStatus::Unhealthy {
            return self.try_recover().await;
        }
        (Ok(self.record.clone()), Flow::Continue)
    }

    async fn on_exit(&mut self, exit: WorkerExit) -> Flow {
        self.worker_exited = true;
        if self.record.status.is_terminal() {
            return Flow::Stop;
        }
        if exit.success() {
            info!(agent_id = %self.record.id, "worker finished");
            return match self.transition(AgentStatus::Terminated, Some("worker exited cleanly".into())) {
                Ok(()) => {
                    self.shared.release_locks(&self.record.id);
                    Flow::Stop
                }
                Err(e) => {
                    warn!(agent_id = %self.record.id, error = %e, "could not record worker exit");
                    Flow::Continue
                }
            };
        }

        let detail = match exit.code {
            Some(code) => format!("worker exited with code {code}"),
            None => "worker exited on a signal".to_string(),
        };
        warn!(agent_id = %self.record.id, %detail, "worker died");
        if let Err(e) = self.transition(AgentStatus::Unhealthy, Some(detail)) {
            warn!(agent_id = %self.record.id, error = %e, "could not mark agent unhealthy");
            return Flow::Continue;
        }
        match self.try_recover().await {
            (Err(e), flow) => {
                warn!(agent_id = %self.record.id, error = %e, "recovery failed");
                flow
            }
            (Ok(_), flow) => flow,
        }
    }

    /// Replace an unhealthy agent with a fresh one, or retire it once its
    /// recovery budget is spent. Waits out the cooldown between attempts.
    async fn try_recover(&mut self) -> (Result<AgentRecord, EngineError>, Flow) {
        let max_attempts = self.shared.config.max_recovery_attempts;
        let cooldown_ms = duration_ms(self.shared.config.cooldown);
        let now = self.shared.clock.now();
        let attempts = self.record.recovery_attempts;

        if attempts >= max_attempts {
            warn!(agent_id = %self.record.id, attempts, "recovery attempts exhausted");
            self.stop_worker().await;
            let exhausted = EngineError::RecoveryExhausted {
                agent_id: self.record.id.clone(),
                attempts,
            };
            if let Err(e) = self.transition(AgentStatus::Failed, Some(exhausted.to_string())) {
                return (Err(e), Flow::Continue);
            }
            self.shared.release_locks(&self.record.id);
            return (Ok(self.record.clone()), Flow::Stop);
        }

        // The record's creation time is when the previous attempt respawned it.
        if attempts > 0 && elapsed_ms(self.record.created_at, now) < cooldown_ms {
            debug!(agent_id = %self.record.id, "recovery cooling down");
            return (Ok(self.record.clone()), Flow::Continue);
        }

        if let Err(e) = self.transition(AgentStatus::Recovering, None) {
            return (Err(e), Flow::Continue);
        }
        self.stop_worker().await;

        let replacement = match self.shared.create_record(
            &self.record.agent_type,
            &self.record.task,
            self.record.mailbox_id.clone(),
            self.record.config.clone(),
            Some((&self.record.id, attempts + 1)),
        ) {
            Ok(record) => record,
            Err(e) => {
                // Nothing was started; try again on the next check.
                let _ = self.transition(AgentStatus::Unhealthy, Some(e.to_string()));
                return (Err(e), Flow::Continue);
            }
        };

        let mut retired = self.record.clone();
        retired.status = AgentStatus::Terminated;
        retired.replaced_by = Some(replacement.id.clone());
        match self.shared.save(&retired) {
            Ok(saved) => self.record = saved,
            Err(e) => return (Err(e), Flow::Stop),
        }
        self.shared.release_locks(&self.record.id);
        self.shared
            .emit(&self.record, Some(format!("replaced by {}", replacement.id)));
        info!(
            agent_id = %self.record.id,
            replacement = %replacement.id,
            attempt = attempts + 1,
            "agent respawned"
        );

        // A failed launch leaves the replacement `failed`; this agent is
        // retired either way.
        if let Err(e) = self.shared.start(replacement).await {
            warn!(agent_id = %self.record.id, error = %e, "replacement did not start");
        }
        (Ok(self.record.clone()), Flow::Stop)
    }

    async fn terminate(&mut self, reason: &str) -> Result<AgentRecord, EngineError> {
        self.stop_worker().await;
        if !self.record.status.is_terminal() {
            self.transition(AgentStatus::Terminated, Some(reason.to_string()))?;
        }
        self.shared.release_locks(&self.record.id);
        Ok(self.record.clone())
    }

    async fn stop_worker(&mut self) {
        if self.worker_exited || self.worker.exit.borrow().is_some() {
            self.worker_exited = true;
            return;
        }
        if let Err(e) = self.worker.handle.terminate(self.shared.config.terminate_grace).await {
            warn!(agent_id = %self.record.id, error = %e, "worker did not stop cleanly");
        }
        self.worker_exited = true;
    }

    /// Persist a status change and announce it on the agent's mailbox.
    fn transition(&mut self, status: AgentStatus, detail: Option<String>) -> Result<(), EngineError> {
        let mut next = self.record.clone();
        next.status = status;
        if matches!(status, AgentStatus::Unhealthy | AgentStatus::Failed) {
            next.last_error = detail.clone();
        }
        self.record = self.shared.save(&next)?;
        self.shared.emit(&self.record, detail);
        Ok(())
    }
}

fn duration_ms(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
