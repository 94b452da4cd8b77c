//! Persisted job definitions and their run state.
//!
//! Jobs live in a human-editable `jobs.toml` (one `[[jobs]]` record per
//! job); per-job run state lives separately in `state.toml` so editing the
//! definitions never clobbers history.

mod store;

pub use store::{JobStore, JobView};

use crate::error::StoreError;
use crate::schedule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ─── Schedule kind ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    #[default]
    Recurring,
    Once,
}

// ─── Output format ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Text,
}

impl OutputFormat {
    pub fn as_flag(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
        }
    }
}

// ─── Output destinations ─────────────────────────────────────────────────────

/// A named result sink. Wire format: `"file"` or `"chat:<id>"`.
/// Unknown strings fail at job-add time, not at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OutputDestination {
    File,
    Chat(i64),
}

impl TryFrom<String> for OutputDestination {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        if raw == "file" {
            return Ok(Self::File);
        }
        if let Some(id) = raw.strip_prefix("chat:") {
            return id
                .parse::<i64>()
                .map(Self::Chat)
                .map_err(|_| format!("invalid chat id in destination '{raw}'"));
        }
        Err(format!(
            "unknown output destination '{raw}' (expected \"file\" or \"chat:<id>\")"
        ))
    }
}

impl From<OutputDestination> for String {
    fn from(dest: OutputDestination) -> Self {
        dest.to_string()
    }
}

impl fmt::Display for OutputDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Chat(id) => write!(f, "chat:{id}"),
        }
    }
}

// ─── Job definition ──────────────────────────────────────────────────────────

/// A persisted, independently schedulable unit of agent-session work.
///
/// Optional fields fall back to the process-wide [`crate::config::Defaults`]
/// at execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub schedule_kind: ScheduleKind,
    /// Cron expression; present iff `schedule_kind = "recurring"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// Absolute timestamp; present iff `schedule_kind = "once"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disallowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_budget_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<OutputFormat>,
    #[serde(default = "default_destinations")]
    pub output_destinations: Vec<OutputDestination>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_destinations() -> Vec<OutputDestination> {
    vec![OutputDestination::File]
}

fn default_true() -> bool {
    true
}

impl Job {
    /// Validate a definition before it is persisted. The daemon's state is
    /// unaffected when this fails.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.id.is_empty() {
            return Err(StoreError::Validation("job id must not be empty".into()));
        }
        // The id doubles as an output-path segment.
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(StoreError::Validation(format!(
                "job id '{}' may only contain alphanumerics, '-' and '_'",
                self.id
            )));
        }
        if self.name.is_empty() {
            return Err(StoreError::Validation("job name must not be empty".into()));
        }
        if self.prompt.is_empty() {
            return Err(StoreError::Validation("job prompt must not be empty".into()));
        }

        match self.schedule_kind {
            ScheduleKind::Recurring => {
                if self.run_at.is_some() {
                    return Err(StoreError::Validation(
                        "recurring job must not set run_at".into(),
                    ));
                }
                let Some(ref expr) = self.schedule else {
                    return Err(StoreError::Validation(
                        "recurring job requires a schedule expression".into(),
                    ));
                };
                schedule::parse_expression(expr)
                    .map_err(|e| StoreError::Validation(format!("invalid cron '{expr}': {e}")))?;
            }
            ScheduleKind::Once => {
                if self.schedule.is_some() {
                    return Err(StoreError::Validation(
                        "once job must not set a cron schedule".into(),
                    ));
                }
                let Some(ref raw) = self.run_at else {
                    return Err(StoreError::Validation(
                        "once job requires run_at".into(),
                    ));
                };
                if schedule::parse_run_at(raw).is_none() {
                    return Err(StoreError::Validation(format!(
                        "invalid run_at timestamp '{raw}'"
                    )));
                }
            }
        }

        if self.max_turns == Some(0) {
            return Err(StoreError::Validation("max_turns must be positive".into()));
        }
        if let Some(budget) = self.max_budget_usd {
            if budget <= 0.0 {
                return Err(StoreError::Validation(
                    "max_budget_usd must be positive".into(),
                ));
            }
        }

        if let Some(tool) = self
            .allowed_tools
            .iter()
            .find(|t| self.disallowed_tools.contains(t))
        {
            return Err(StoreError::Validation(format!(
                "tool '{tool}' appears in both allowed_tools and disallowed_tools"
            )));
        }

        if self.output_destinations.is_empty() {
            return Err(StoreError::Validation(
                "at least one output destination is required".into(),
            ));
        }

        Ok(())
    }

    pub fn schedule_display(&self) -> String {
        match self.schedule_kind {
            ScheduleKind::Recurring => self.schedule.clone().unwrap_or_default(),
            ScheduleKind::Once => self.run_at.clone().unwrap_or_default(),
        }
    }
}

// ─── Run state ───────────────────────────────────────────────────────────────

/// Per-job run state, persisted separately from the definitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<String>,
    /// Terminal flag for once jobs: set after the single execution attempt,
    /// success or failure, and never cleared.
    #[serde(default)]
    pub consumed: bool,
    /// Pid holding the running claim for this job. Cleared on finish; a
    /// recorded pid that is no longer alive counts as a stale claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_pid: Option<u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct StateFile {
    #[serde(default)]
    pub jobs: BTreeMap<String, JobState>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct JobsFile {
    #[serde(default)]
    pub jobs: Vec<Job>,
}
