use crate::jobs::OutputFormat;
use crate::util::{expand_tilde, write_atomic};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Process-wide configuration, persisted as `config.toml` in the base dir.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub defaults: Defaults,
}

// ─── Paths ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Base directory for all daemon state (default: `~/.nocturne`).
    #[serde(default)]
    pub base_dir: Option<String>,
}

impl PathsConfig {
    pub fn base_dir(&self) -> PathBuf {
        match self.base_dir {
            Some(ref base) => expand_tilde(base),
            None => directories::UserDirs::new()
                .map_or_else(|| PathBuf::from("."), |dirs| dirs.home_dir().to_path_buf())
                .join(".nocturne"),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base_dir().join("config.toml")
    }

    pub fn jobs_file(&self) -> PathBuf {
        self.base_dir().join("jobs.toml")
    }

    pub fn state_file(&self) -> PathBuf {
        self.base_dir().join("state.toml")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.base_dir().join("output")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir().join("logs")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.base_dir().join("nocturne.pid")
    }
}

// ─── Gateway ─────────────────────────────────────────────────────────────────

/// Chat gateway settings. Messages are executed with this configuration,
/// not with the job [`Defaults`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    /// Whitelisted chat ids: positive = direct message, negative = group.
    #[serde(default)]
    pub allowed_chat_ids: Vec<i64>,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_max_budget")]
    pub max_budget_usd: f64,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    #[serde(default)]
    pub append_system_prompt: String,
    /// Long-poll timeout for getUpdates, in seconds.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            allowed_chat_ids: Vec::new(),
            default_model: default_model(),
            max_turns: default_max_turns(),
            max_budget_usd: default_max_budget(),
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            append_system_prompt: String::new(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

impl GatewayConfig {
    /// True when the outbound chat channel can actually deliver.
    pub fn is_available(&self) -> bool {
        self.enabled && !self.bot_token.is_empty()
    }
}

// ─── Job defaults ────────────────────────────────────────────────────────────

/// Fallback values applied when a job leaves a field unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub fallback_model: String,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_max_budget")]
    pub max_budget_usd: f64,
    #[serde(default)]
    pub output_format: OutputFormat,
    /// Agent CLI binary spawned per execution.
    #[serde(default = "default_agent_bin")]
    pub agent_bin: String,
    /// Wall-clock ceiling for a single execution. Process-wide, never
    /// user-settable per job.
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            model: default_model(),
            fallback_model: String::new(),
            max_turns: default_max_turns(),
            max_budget_usd: default_max_budget(),
            output_format: OutputFormat::default(),
            agent_bin: default_agent_bin(),
            exec_timeout_secs: default_exec_timeout(),
        }
    }
}

fn default_model() -> String {
    "sonnet".into()
}

fn default_max_turns() -> u32 {
    10
}

fn default_max_budget() -> f64 {
    5.0
}

fn default_poll_timeout() -> u64 {
    30
}

fn default_agent_bin() -> String {
    "claude".into()
}

fn default_exec_timeout() -> u64 {
    1800
}

// ─── Load / save ─────────────────────────────────────────────────────────────

impl Config {
    pub fn load() -> Result<Self> {
        let config_file = PathsConfig::default().config_file();
        if !config_file.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_file)
            .with_context(|| format!("failed reading config: {}", config_file.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed parsing config: {}", config_file.display()))
    }

    pub fn save(&self) -> Result<()> {
        let config_file = self.paths.config_file();
        let content = toml::to_string_pretty(self).context("failed serializing config")?;
        write_atomic(&config_file, &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gateway_config() {
        let gateway = GatewayConfig::default();

        assert!(!gateway.enabled);
        assert!(gateway.bot_token.is_empty());
        assert!(gateway.allowed_chat_ids.is_empty());
        assert_eq!(gateway.max_turns, 10);
        assert_eq!(gateway.poll_timeout_secs, 30);
        assert!(!gateway.is_available());
    }

    #[test]
    fn gateway_available_requires_enabled_and_token() {
        let mut gateway = GatewayConfig {
            enabled: true,
            ..GatewayConfig::default()
        };
        assert!(!gateway.is_available());

        gateway.bot_token = "123:ABC".into();
        assert!(gateway.is_available());
    }

    #[test]
    fn default_job_defaults() {
        let defaults = Defaults::default();

        assert_eq!(defaults.model, "sonnet");
        assert_eq!(defaults.max_turns, 10);
        assert!((defaults.max_budget_usd - 5.0).abs() < f64::EPSILON);
        assert_eq!(defaults.agent_bin, "claude");
        assert_eq!(defaults.exec_timeout_secs, 1800);
    }

    #[test]
    fn config_toml_round_trip() {
        let original = Config {
            paths: PathsConfig {
                base_dir: Some("/var/lib/nocturne".into()),
            },
            gateway: GatewayConfig {
                enabled: true,
                bot_token: "123:ABC".into(),
                allowed_chat_ids: vec![42, -100],
                ..GatewayConfig::default()
            },
            defaults: Defaults {
                model: "opus".into(),
                max_turns: 3,
                ..Defaults::default()
            },
        };

        let serialized = toml::to_string_pretty(&original).unwrap();
        let restored: Config = toml::from_str(&serialized).unwrap();

        assert_eq!(restored.paths.base_dir.as_deref(), Some("/var/lib/nocturne"));
        assert!(restored.gateway.enabled);
        assert_eq!(restored.gateway.allowed_chat_ids, vec![42, -100]);
        assert_eq!(restored.defaults.model, "opus");
        assert_eq!(restored.defaults.max_turns, 3);
    }

    #[test]
    fn empty_document_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.paths.base_dir.is_none());
        assert!(!config.gateway.enabled);
        assert_eq!(config.defaults.model, "sonnet");
    }

    #[test]
    fn base_dir_override_expands_tilde() {
        let paths = PathsConfig {
            base_dir: Some("~/nocturne-state".into()),
        };
        assert!(!paths.base_dir().to_string_lossy().starts_with('~'));
    }
}
