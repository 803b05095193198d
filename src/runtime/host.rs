//! Async host for one executor
//!
//! Moves an [`ActivityExecutor`] onto a tokio task. The task re-runs the
//! dispatch loop whenever a command arrives or a token signals the completion
//! inbox, so external completions and bookmark resumptions are processed
//! without the caller polling.

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::async_op::CompletionInbox;
use super::bookmark::{BookmarkScope, ResumeResult};
use super::error::ExecutorResult;
use super::executor::{ActivityExecutor, Outcome, RunStatus};
use super::snapshot::TreeSnapshot;

const COMMAND_BUFFER: usize = 64;

enum Command {
    ResumeBookmark {
        name: String,
        scope: BookmarkScope,
        payload: Value,
        reply: oneshot::Sender<ResumeResult>,
    },
    Cancel {
        reply: oneshot::Sender<ExecutorResult<()>>,
    },
    Abort {
        reason: String,
        reply: oneshot::Sender<ExecutorResult<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<TreeSnapshot>,
    },
}

/// A running host task
pub struct WorkflowHost {
    handle: HostHandle,
    task: JoinHandle<ActivityExecutor>,
}

impl WorkflowHost {
    /// Spawn `executor` onto the current tokio runtime
    ///
    /// The executor should already be started; the host drives it until the
    /// root finishes or it can make no further progress.
    pub fn spawn(executor: ActivityExecutor) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let (outcome_tx, outcome) = watch::channel(None);
        let inbox = executor.completion_inbox();

        let task = tokio::spawn(drive(executor, rx, outcome_tx, inbox));
        Self {
            handle: HostHandle { commands, outcome },
            task,
        }
    }

    /// A cloneable handle for talking to the host
    pub fn handle(&self) -> HostHandle {
        self.handle.clone()
    }

    /// Wait for the host task to stop and take back the executor
    pub async fn join(self) -> Result<ActivityExecutor> {
        drop(self.handle);
        self.task.await.context("host task failed")
    }
}

async fn drive(
    mut executor: ActivityExecutor,
    mut commands: mpsc::Receiver<Command>,
    outcome: watch::Sender<Option<Outcome>>,
    inbox: Arc<CompletionInbox>,
) -> ActivityExecutor {
    let workflow = executor.workflow_id();
    tracing::info!(%workflow, "host started");
    let mut commands_open = true;

    loop {
        match executor.run_to_idle() {
            RunStatus::Completed(result) => {
                let _ = outcome.send(Some(result));
                break;
            }
            RunStatus::Yielded => {
                tokio::task::yield_now().await;
                continue;
            }
            RunStatus::Idle => {}
        }

        if !commands_open && executor.pending_operation_count() == 0 {
            tracing::warn!(%workflow, "host stalled: no handles left and no operations pending");
            break;
        }

        tokio::select! {
            command = commands.recv(), if commands_open => match command {
                Some(command) => apply(&mut executor, command),
                None => commands_open = false,
            },
            _ = inbox.notified() => {}
        }
    }

    tracing::info!(%workflow, "host stopped");
    executor
}

fn apply(executor: &mut ActivityExecutor, command: Command) {
    match command {
        Command::ResumeBookmark {
            name,
            scope,
            payload,
            reply,
        } => {
            let _ = reply.send(executor.resume_bookmark(&name, &scope, payload));
        }
        Command::Cancel { reply } => {
            let _ = reply.send(executor.cancel());
        }
        Command::Abort { reason, reply } => {
            let _ = reply.send(executor.abort(reason));
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(executor.snapshot());
        }
    }
}

/// Cloneable client for a [`WorkflowHost`]
#[derive(Clone)]
pub struct HostHandle {
    commands: mpsc::Sender<Command>,
    outcome: watch::Receiver<Option<Outcome>>,
}

impl HostHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| anyhow!("workflow host has stopped"))?;
        rx.await.context("workflow host dropped the request")
    }

    /// Resume a bookmark
    pub async fn resume_bookmark(
        &self,
        name: impl Into<String>,
        scope: BookmarkScope,
        payload: Value,
    ) -> Result<ResumeResult> {
        let name = name.into();
        self.request(|reply| Command::ResumeBookmark {
            name,
            scope,
            payload,
            reply,
        })
        .await
    }

    /// Cooperatively cancel the workflow
    pub async fn cancel(&self) -> Result<()> {
        self.request(|reply| Command::Cancel { reply }).await??;
        Ok(())
    }

    /// Abort the workflow
    pub async fn abort(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.request(|reply| Command::Abort { reason, reply }).await??;
        Ok(())
    }

    /// Snapshot the tree as it stands between dispatch passes
    pub async fn snapshot(&self) -> Result<TreeSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Outcome, if the workflow already finished
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome.borrow().clone()
    }

    /// Wait until the workflow finishes
    pub async fn wait_for_outcome(&self) -> Result<Outcome> {
        let mut rx = self.outcome.clone();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| anyhow!("workflow host stopped before the workflow finished"))?;
        outcome
            .clone()
            .ok_or_else(|| anyhow!("workflow host reported no outcome"))
    }
}
