//! Process executor: the only component that touches an external process
//! boundary. Spawns the agent CLI per invocation, captures its structured
//! output, and races three independent limits — the wall-clock ceiling,
//! cancellation, and the limits the subprocess reports about itself. The
//! earliest-detected terminal condition determines the status.

#[cfg(test)]
mod tests;

use crate::config::{Defaults, GatewayConfig};
use crate::jobs::{Job, OutputFormat};
use crate::util::expand_tilde;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ─── Result taxonomy ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    BudgetExceeded,
    TurnLimitExceeded,
    Timeout,
    ProcessError,
    Cancelled,
}

impl ExecutionStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::BudgetExceeded => "budget-exceeded",
            Self::TurnLimitExceeded => "turn-limit-exceeded",
            Self::Timeout => "timeout",
            Self::ProcessError => "process-error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Outcome of one invocation. Owned by the invocation that produced it
/// until handed to the output router; never mutated after creation.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub execution_id: String,
    /// Job id, or `chat:<id>` for gateway-triggered executions.
    pub reference: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub output_text: String,
    pub cost_usd: Option<f64>,
    pub turns_used: Option<u32>,
}

// ─── Invocation ──────────────────────────────────────────────────────────────

/// Fully resolved configuration for one subprocess spawn. Job fields that
/// were unset have already been merged with the process-wide defaults.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub reference: String,
    pub prompt: String,
    pub model: String,
    pub fallback_model: String,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub system_prompt: String,
    pub append_system_prompt: String,
    pub mcp_config: String,
    pub max_turns: u32,
    pub max_budget_usd: f64,
    pub output_format: OutputFormat,
    pub working_dir: Option<PathBuf>,
}

impl Invocation {
    pub fn for_job(job: &Job, defaults: &Defaults) -> Self {
        Self {
            reference: job.id.clone(),
            prompt: job.prompt.clone(),
            model: job.model.clone().unwrap_or_else(|| defaults.model.clone()),
            fallback_model: job
                .fallback_model
                .clone()
                .unwrap_or_else(|| defaults.fallback_model.clone()),
            allowed_tools: job.allowed_tools.clone(),
            disallowed_tools: job.disallowed_tools.clone(),
            system_prompt: job.system_prompt.clone().unwrap_or_default(),
            append_system_prompt: job.append_system_prompt.clone().unwrap_or_default(),
            mcp_config: job.mcp_config.clone().unwrap_or_default(),
            max_turns: job.max_turns.unwrap_or(defaults.max_turns),
            max_budget_usd: job.max_budget_usd.unwrap_or(defaults.max_budget_usd),
            output_format: job.output_format.unwrap_or(defaults.output_format),
            working_dir: job.working_dir.as_deref().map(expand_tilde),
        }
    }

    /// Gateway messages execute with the gateway configuration, not with
    /// the job defaults.
    pub fn for_chat(chat_id: i64, prompt: &str, gateway: &GatewayConfig) -> Self {
        Self {
            reference: format!("chat:{chat_id}"),
            prompt: prompt.to_string(),
            model: gateway.default_model.clone(),
            fallback_model: String::new(),
            allowed_tools: gateway.allowed_tools.clone(),
            disallowed_tools: gateway.disallowed_tools.clone(),
            system_prompt: String::new(),
            append_system_prompt: gateway.append_system_prompt.clone(),
            mcp_config: String::new(),
            max_turns: gateway.max_turns,
            max_budget_usd: gateway.max_budget_usd,
            output_format: OutputFormat::Json,
            working_dir: None,
        }
    }
}

// ─── Executor ────────────────────────────────────────────────────────────────

pub struct Executor {
    agent_bin: String,
    timeout: Duration,
}

impl Executor {
    pub fn new(defaults: &Defaults) -> Self {
        Self {
            agent_bin: defaults.agent_bin.clone(),
            timeout: Duration::from_secs(defaults.exec_timeout_secs),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_binary(agent_bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            agent_bin: agent_bin.into(),
            timeout,
        }
    }

    /// Spawn the agent CLI and supervise it to completion. Never returns
    /// an error: every failure mode maps to an [`ExecutionStatus`] so the
    /// caller can record and route it like any other result.
    pub async fn execute(&self, invocation: &Invocation, cancel: &CancellationToken) -> ExecutionResult {
        let started_at = Utc::now();
        let execution_id = Uuid::new_v4().to_string();
        tracing::info!(
            reference = %invocation.reference,
            execution_id = %execution_id,
            model = %invocation.model,
            "spawning agent process"
        );

        let mut command = self.build_command(invocation);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                return self.finish(
                    execution_id,
                    invocation,
                    started_at,
                    ExecutionStatus::ProcessError,
                    format!("failed to spawn '{}': {error}", self.agent_bin),
                    None,
                    None,
                );
            }
        };

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(drain(stdout_pipe));
        let stderr_task = tokio::spawn(drain(stderr_pipe));

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut forced: Option<ExecutionStatus> = None;
        let exit = tokio::select! {
            result = child.wait() => result,
            () = &mut deadline => {
                forced = Some(ExecutionStatus::Timeout);
                reap(&mut child).await
            }
            () = cancel.cancelled() => {
                forced = Some(ExecutionStatus::Cancelled);
                reap(&mut child).await
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if let Some(status) = forced {
            let note = match status {
                ExecutionStatus::Timeout => format!(
                    "execution exceeded the {}s wall-clock ceiling and was killed",
                    self.timeout.as_secs()
                ),
                _ => "execution cancelled during shutdown".to_string(),
            };
            let text = if stderr.trim().is_empty() {
                note
            } else {
                format!("{note}\n{}", stderr.trim())
            };
            return self.finish(execution_id, invocation, started_at, status, text, None, None);
        }

        let exit = match exit {
            Ok(exit) => exit,
            Err(error) => {
                return self.finish(
                    execution_id,
                    invocation,
                    started_at,
                    ExecutionStatus::ProcessError,
                    format!("failed waiting on agent process: {error}"),
                    None,
                    None,
                );
            }
        };

        let (status, output_text, cost_usd, turns_used) =
            interpret(invocation, exit.success(), &stdout, &stderr);
        self.finish(
            execution_id,
            invocation,
            started_at,
            status,
            output_text,
            cost_usd,
            turns_used,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        execution_id: String,
        invocation: &Invocation,
        started_at: DateTime<Utc>,
        status: ExecutionStatus,
        output_text: String,
        cost_usd: Option<f64>,
        turns_used: Option<u32>,
    ) -> ExecutionResult {
        let result = ExecutionResult {
            execution_id,
            reference: invocation.reference.clone(),
            started_at,
            ended_at: Utc::now(),
            status,
            output_text,
            cost_usd,
            turns_used,
        };
        tracing::info!(
            reference = %result.reference,
            status = result.status.label(),
            cost_usd = ?result.cost_usd,
            turns = ?result.turns_used,
            "execution finished"
        );
        result
    }

    fn build_command(&self, invocation: &Invocation) -> Command {
        let mut command = Command::new(&self.agent_bin);
        command.arg("-p");

        if !invocation.model.is_empty() {
            command.arg("--model").arg(&invocation.model);
        }
        if !invocation.fallback_model.is_empty() {
            command.arg("--fallback-model").arg(&invocation.fallback_model);
        }
        for tool in &invocation.allowed_tools {
            command.arg("--allowedTools").arg(tool);
        }
        for tool in &invocation.disallowed_tools {
            command.arg("--disallowedTools").arg(tool);
        }
        if !invocation.system_prompt.is_empty() {
            command.arg("--system-prompt").arg(&invocation.system_prompt);
        }
        if !invocation.append_system_prompt.is_empty() {
            command
                .arg("--append-system-prompt")
                .arg(&invocation.append_system_prompt);
        }
        if !invocation.mcp_config.is_empty() {
            command.arg("--mcp-config").arg(&invocation.mcp_config);
        }
        command.arg("--max-turns").arg(invocation.max_turns.to_string());
        command
            .arg("--max-budget-usd")
            .arg(format!("{:.2}", invocation.max_budget_usd));
        command
            .arg("--output-format")
            .arg(invocation.output_format.as_flag());
        command.arg("--no-session-persistence");

        if let Some(ref dir) = invocation.working_dir {
            if dir.exists() {
                command.current_dir(dir);
            } else {
                tracing::warn!(
                    reference = %invocation.reference,
                    dir = %dir.display(),
                    "working_dir does not exist, using current dir"
                );
            }
        }

        command.arg(&invocation.prompt);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);
        command
    }
}

/// Kill and reap the child so no orphan survives a timeout or cancel.
async fn reap(child: &mut tokio::process::Child) -> std::io::Result<std::process::ExitStatus> {
    let _ = child.start_kill();
    child.wait().await
}

async fn drain<R>(pipe: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

// ─── Output interpretation ───────────────────────────────────────────────────

/// Map a finished subprocess to a status. Trust but verify: a limit the
/// subprocess reports about itself wins over its exit code, and reported
/// cost/turns are checked against the configured ceilings even on a
/// claimed success.
fn interpret(
    invocation: &Invocation,
    exited_ok: bool,
    stdout: &str,
    stderr: &str,
) -> (ExecutionStatus, String, Option<f64>, Option<u32>) {
    let parsed = serde_json::from_str::<serde_json::Value>(stdout.trim()).ok();

    let Some(json) = parsed else {
        if exited_ok {
            return (ExecutionStatus::Success, stdout.to_string(), None, None);
        }
        let diagnostics = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        return (ExecutionStatus::ProcessError, diagnostics, None, None);
    };

    let text = json
        .get("result")
        .and_then(|v| v.as_str())
        .map_or_else(|| stdout.to_string(), ToString::to_string);
    let cost_usd = json.get("total_cost_usd").and_then(serde_json::Value::as_f64);
    let turns_used = json
        .get("num_turns")
        .and_then(serde_json::Value::as_u64)
        .and_then(|n| u32::try_from(n).ok());
    let subtype = json.get("subtype").and_then(|v| v.as_str()).unwrap_or("");
    let is_error = json
        .get("is_error")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    let status = if subtype == "error_max_turns" {
        ExecutionStatus::TurnLimitExceeded
    } else if subtype == "error_max_budget" {
        ExecutionStatus::BudgetExceeded
    } else if cost_usd.is_some_and(|cost| cost >= invocation.max_budget_usd) {
        ExecutionStatus::BudgetExceeded
    } else if turns_used.is_some_and(|turns| turns > invocation.max_turns) {
        ExecutionStatus::TurnLimitExceeded
    } else if is_error || !exited_ok {
        ExecutionStatus::ProcessError
    } else {
        ExecutionStatus::Success
    };

    (status, text, cost_usd, turns_used)
}
