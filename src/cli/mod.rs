//! Command-line surface. Definitions live here; the per-command logic is
//! in [`commands`].

pub mod commands;

use crate::config::Config;
use crate::jobs::{Job, OutputDestination, ScheduleKind};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

/// Nocturne - schedules agent CLI sessions and relays chat messages into them.
#[derive(Parser, Debug)]
#[command(name = "nocturne")]
#[command(version)]
#[command(about = "Background daemon for scheduled and chat-triggered agent sessions", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the daemon (background by default)
    Start {
        /// Also start the chat gateway listener
        #[arg(long)]
        with_gateway: bool,

        /// Run in the foreground instead of detaching
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the running daemon, letting in-flight executions finish
    Stop,

    /// Show daemon liveness, gateway state, and the job table
    Status,

    /// Create the state directory and a default configuration
    Init,

    /// Manage job definitions
    Job {
        #[command(subcommand)]
        job_command: JobCommands,
    },

    /// Run or inspect the chat gateway without the scheduler
    Gateway {
        #[command(subcommand)]
        gateway_command: GatewayCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum JobCommands {
    /// Add a job definition
    Add {
        /// Job id (also the output directory name)
        #[arg(required_unless_present = "stdin")]
        id: Option<String>,

        /// Human-readable name (defaults to the id)
        #[arg(long)]
        name: Option<String>,

        /// Prompt passed to the agent session
        #[arg(long, required_unless_present = "stdin")]
        prompt: Option<String>,

        /// Cron expression for a recurring job (standard 5-field form)
        #[arg(long, conflicts_with = "at")]
        cron: Option<String>,

        /// Timestamp for a one-shot job (RFC 3339 or local `YYYY-MM-DDTHH:MM:SS`)
        #[arg(long)]
        at: Option<String>,

        /// Model override for this job
        #[arg(long)]
        model: Option<String>,

        /// Working directory for the agent process
        #[arg(long)]
        working_dir: Option<String>,

        /// Turn ceiling override
        #[arg(long)]
        max_turns: Option<u32>,

        /// Budget ceiling override, in USD
        #[arg(long)]
        max_budget_usd: Option<f64>,

        /// Output destination: `file` or `chat:<id>` (repeatable)
        #[arg(long = "output", value_name = "DEST")]
        outputs: Vec<String>,

        /// Create the job disabled
        #[arg(long)]
        disabled: bool,

        /// Read the full definition as a TOML document from stdin
        /// instead of flags
        #[arg(long, conflicts_with_all = ["id", "prompt", "cron", "at"])]
        stdin: bool,
    },

    /// List jobs with run state and next due time
    List,

    /// Remove a job and its run state
    Remove { id: String },

    /// Execute a job immediately, in this process
    Run { id: String },

    /// Enable a job
    Enable { id: String },

    /// Disable a job without removing it
    Disable { id: String },
}

#[derive(Subcommand, Debug)]
pub enum GatewayCommands {
    /// Run the gateway listener in the foreground until interrupted
    Start,

    /// Show gateway configuration and probe the bot API
    Status,
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;

    match cli.command {
        Commands::Start {
            with_gateway,
            foreground,
        } => commands::start(config, with_gateway, foreground).await,
        Commands::Stop => commands::stop(&config),
        Commands::Status => commands::status(&config).await,
        Commands::Init => commands::init(&config),
        Commands::Job { job_command } => match job_command {
            JobCommands::Add {
                id,
                name,
                prompt,
                cron,
                at,
                model,
                working_dir,
                max_turns,
                max_budget_usd,
                outputs,
                disabled,
                stdin,
            } => {
                if stdin {
                    return commands::job_add_stdin(&config).await;
                }
                let job = build_job(JobArgs {
                    id: id.context("a job id is required")?,
                    name,
                    prompt: prompt.context("--prompt is required")?,
                    cron,
                    at,
                    model,
                    working_dir,
                    max_turns,
                    max_budget_usd,
                    outputs,
                    disabled,
                })?;
                commands::job_add(&config, job).await
            }
            JobCommands::List => commands::job_list(&config).await,
            JobCommands::Remove { id } => commands::job_remove(&config, &id).await,
            JobCommands::Run { id } => commands::job_run(&config, &id).await,
            JobCommands::Enable { id } => commands::job_set_enabled(&config, &id, true).await,
            JobCommands::Disable { id } => commands::job_set_enabled(&config, &id, false).await,
        },
        Commands::Gateway { gateway_command } => match gateway_command {
            GatewayCommands::Start => commands::gateway_start(config).await,
            GatewayCommands::Status => commands::gateway_status(&config).await,
        },
    }
}

struct JobArgs {
    id: String,
    name: Option<String>,
    prompt: String,
    cron: Option<String>,
    at: Option<String>,
    model: Option<String>,
    working_dir: Option<String>,
    max_turns: Option<u32>,
    max_budget_usd: Option<f64>,
    outputs: Vec<String>,
    disabled: bool,
}

fn build_job(args: JobArgs) -> Result<Job> {
    if args.cron.is_none() && args.at.is_none() {
        anyhow::bail!("a job needs either --cron <expr> or --at <timestamp>");
    }

    let schedule_kind = if args.at.is_some() {
        ScheduleKind::Once
    } else {
        ScheduleKind::Recurring
    };

    let output_destinations = if args.outputs.is_empty() {
        vec![OutputDestination::File]
    } else {
        args.outputs
            .into_iter()
            .map(|raw| {
                OutputDestination::try_from(raw.clone())
                    .map_err(|e| anyhow::anyhow!(e))
                    .with_context(|| format!("bad --output '{raw}'"))
            })
            .collect::<Result<Vec<_>>>()?
    };

    Ok(Job {
        name: args.name.unwrap_or_else(|| args.id.clone()),
        id: args.id,
        prompt: args.prompt,
        schedule_kind,
        schedule: args.cron,
        run_at: args.at,
        working_dir: args.working_dir,
        model: args.model,
        fallback_model: None,
        allowed_tools: Vec::new(),
        disallowed_tools: Vec::new(),
        system_prompt: None,
        append_system_prompt: None,
        mcp_config: None,
        max_turns: args.max_turns,
        max_budget_usd: args.max_budget_usd,
        output_format: None,
        output_destinations,
        enabled: !args.disabled,
    })
}
