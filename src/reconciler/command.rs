// src/reconciler/command.rs

//! Shell-command reconciler used by the `resctl` binary.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::ReconcileContext;
use crate::reconciler::{ReconcileResult, Reconciler};
use crate::types::{BoxFuture, ResourceName};

/// Resource kind handled by [`CommandReconciler`].
pub const COMMAND_KIND: &str = "command";

/// Spec of a `command` resource.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CommandSpec {
    pub cmd: String,
    #[serde(default)]
    pub refresh_every_ms: Option<u64>,
}

/// State recorded after each run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandState {
    pub exit_code: i32,
    pub duration_ms: u64,
    pub finished_on: chrono::DateTime<Utc>,
}

/// Runs the resource's `cmd` through the shell on every reconcile. A
/// non-zero exit fails the reconcile; cancellation kills the process.
#[derive(Debug, Default, Clone)]
pub struct CommandReconciler;

impl CommandReconciler {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, ctx: ReconcileContext, name: ResourceName) -> ReconcileResult {
        let resource = match ctx.get(&name).await {
            Ok(r) => r,
            Err(e) => return ReconcileResult::failed(e),
        };
        // Nothing to tear down for a shell command.
        if resource.is_deleted() {
            debug!(resource = %name, "resource deleted; nothing to do");
            return ReconcileResult::ok();
        }

        let spec: CommandSpec = match serde_json::from_value(resource.spec.clone()) {
            Ok(spec) => spec,
            Err(e) => {
                return ReconcileResult::failed(
                    anyhow!(e).context(format!("invalid spec for resource {name}")),
                );
            }
        };

        let started = Instant::now();
        let exit_code = match run_command(&ctx, &name, &spec.cmd).await {
            Ok(Some(code)) => code,
            Ok(None) => return ReconcileResult::cancelled(),
            Err(e) => return ReconcileResult::failed(e),
        };

        let state = CommandState {
            exit_code,
            duration_ms: started.elapsed().as_millis() as u64,
            finished_on: Utc::now(),
        };
        match serde_json::to_value(&state) {
            Ok(v) => {
                if let Err(e) = ctx.update_state(v).await {
                    warn!(resource = %name, error = %e, "failed to record command state");
                }
            }
            Err(e) => warn!(resource = %name, error = %e, "failed to encode command state"),
        }

        let mut result = if exit_code == 0 {
            ReconcileResult::ok()
        } else {
            ReconcileResult::failed(anyhow!("command exited with code {exit_code}"))
        };
        let next = refresh_interval(&spec)
            .and_then(|every| chrono::Duration::from_std(every).ok())
            .and_then(|every| Utc::now().checked_add_signed(every));
        if let Some(at) = next {
            result = result.with_retrigger(at);
        }
        result
    }
}

impl Reconciler for CommandReconciler {
    fn reconcile(&self, ctx: ReconcileContext, name: ResourceName) -> BoxFuture<'_, ReconcileResult> {
        Box::pin(self.run(ctx, name))
    }
}

/// Exit code of the command, or `None` if it was killed on cancellation.
async fn run_command(
    ctx: &ReconcileContext,
    name: &ResourceName,
    cmd_line: &str,
) -> anyhow::Result<Option<i32>> {
    info!(resource = %name, cmd = %cmd_line, "starting command");

    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmd_line);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(cmd_line);
        c
    };

    cmd.stdout(Stdio::inherit())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning process for resource {name}"))?;

    // Always consume stderr so buffers don't fill; log at debug.
    if let Some(stderr) = child.stderr.take() {
        let resource = name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(resource = %resource, "stderr: {}", line);
            }
        });
    }

    tokio::select! {
        status = child.wait() => {
            let status = status
                .with_context(|| format!("waiting for process of resource {name}"))?;
            let code = status.code().unwrap_or(-1);
            info!(resource = %name, exit_code = code, success = status.success(), "command exited");
            Ok(Some(code))
        }
        _ = ctx.cancelled() => {
            info!(resource = %name, "reconcile cancelled; killing process");
            if let Err(e) = child.kill().await {
                warn!(resource = %name, error = %e, "failed to kill process on cancellation");
            }
            Ok(None)
        }
    }
}

/// How long to wait before the next refresh, if the spec asks for one.
pub fn refresh_interval(spec: &CommandSpec) -> Option<Duration> {
    spec.refresh_every_ms.map(Duration::from_millis)
}
