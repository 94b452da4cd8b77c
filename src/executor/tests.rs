use super::*;
use crate::config::Defaults;
use crate::jobs::{Job, OutputDestination, ScheduleKind};

fn sample_invocation() -> Invocation {
    Invocation {
        reference: "job-1".into(),
        prompt: "say hi".into(),
        model: "sonnet".into(),
        fallback_model: String::new(),
        allowed_tools: vec!["Read".into()],
        disallowed_tools: vec!["Bash(*)".into()],
        system_prompt: String::new(),
        append_system_prompt: String::new(),
        mcp_config: String::new(),
        max_turns: 5,
        max_budget_usd: 2.0,
        output_format: crate::jobs::OutputFormat::Json,
        working_dir: None,
    }
}

fn sample_job() -> Job {
    Job {
        id: "daily-plan".into(),
        name: "Daily plan".into(),
        prompt: "plan my day".into(),
        schedule_kind: ScheduleKind::Recurring,
        schedule: Some("0 9 * * Mon-Fri".into()),
        run_at: None,
        working_dir: None,
        model: None,
        fallback_model: None,
        allowed_tools: Vec::new(),
        disallowed_tools: Vec::new(),
        system_prompt: None,
        append_system_prompt: None,
        mcp_config: None,
        max_turns: None,
        max_budget_usd: None,
        output_format: None,
        output_destinations: vec![OutputDestination::File],
        enabled: true,
    }
}

// ─── Invocation resolution ──────────────────────────────────────────────────

#[test]
fn job_invocation_falls_back_to_defaults() {
    let defaults = Defaults::default();
    let inv = Invocation::for_job(&sample_job(), &defaults);

    assert_eq!(inv.reference, "daily-plan");
    assert_eq!(inv.model, "sonnet");
    assert_eq!(inv.max_turns, defaults.max_turns);
    assert!((inv.max_budget_usd - defaults.max_budget_usd).abs() < f64::EPSILON);
}

#[test]
fn job_invocation_prefers_job_fields() {
    let mut job = sample_job();
    job.model = Some("opus".into());
    job.max_turns = Some(3);
    let inv = Invocation::for_job(&job, &Defaults::default());

    assert_eq!(inv.model, "opus");
    assert_eq!(inv.max_turns, 3);
}

#[test]
fn chat_invocation_uses_gateway_config_not_defaults() {
    let gateway = crate::config::GatewayConfig {
        default_model: "haiku".into(),
        max_turns: 2,
        max_budget_usd: 0.5,
        append_system_prompt: "be brief".into(),
        ..crate::config::GatewayConfig::default()
    };
    let inv = Invocation::for_chat(-1001, "hello", &gateway);

    assert_eq!(inv.reference, "chat:-1001");
    assert_eq!(inv.model, "haiku");
    assert_eq!(inv.max_turns, 2);
    assert_eq!(inv.append_system_prompt, "be brief");
}

#[test]
fn command_carries_resolved_flags() {
    let executor = Executor::with_binary("agent", Duration::from_secs(60));
    let command = executor.build_command(&sample_invocation());
    let args: Vec<String> = command
        .as_std()
        .get_args()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();

    assert_eq!(args[0], "-p");
    assert!(args.windows(2).any(|w| w == ["--model", "sonnet"]));
    assert!(args.windows(2).any(|w| w == ["--allowedTools", "Read"]));
    assert!(args.windows(2).any(|w| w == ["--disallowedTools", "Bash(*)"]));
    assert!(args.windows(2).any(|w| w == ["--max-turns", "5"]));
    assert!(args.windows(2).any(|w| w == ["--max-budget-usd", "2.00"]));
    assert!(args.windows(2).any(|w| w == ["--output-format", "json"]));
    assert!(args.contains(&"--no-session-persistence".to_string()));
    // The prompt is the final argument.
    assert_eq!(args.last().map(String::as_str), Some("say hi"));
}

// ─── Output interpretation ──────────────────────────────────────────────────

#[test]
fn success_json_yields_result_cost_and_turns() {
    let stdout = r#"{"result":"done","total_cost_usd":0.42,"num_turns":3,"subtype":"success"}"#;
    let (status, text, cost, turns) = interpret(&sample_invocation(), true, stdout, "");

    assert_eq!(status, ExecutionStatus::Success);
    assert_eq!(text, "done");
    assert_eq!(cost, Some(0.42));
    assert_eq!(turns, Some(3));
}

#[test]
fn reported_turn_limit_wins_over_zero_exit() {
    let stdout = r#"{"result":"gave up","num_turns":5,"subtype":"error_max_turns"}"#;
    let (status, _, _, _) = interpret(&sample_invocation(), true, stdout, "");
    assert_eq!(status, ExecutionStatus::TurnLimitExceeded);
}

#[test]
fn budget_overrun_is_detected_even_on_claimed_success() {
    // Budget ceiling is 2.0; the subprocess reports 2.50 spent before it
    // ran out of turns. BudgetExceeded, not Success.
    let stdout = r#"{"result":"partial","total_cost_usd":2.5,"num_turns":2,"subtype":"success"}"#;
    let (status, _, cost, _) = interpret(&sample_invocation(), true, stdout, "");

    assert_eq!(status, ExecutionStatus::BudgetExceeded);
    assert_eq!(cost, Some(2.5));
}

#[test]
fn overreported_turns_map_to_turn_limit() {
    let stdout = r#"{"result":"x","num_turns":9,"subtype":"success"}"#;
    let (status, _, _, _) = interpret(&sample_invocation(), true, stdout, "");
    assert_eq!(status, ExecutionStatus::TurnLimitExceeded);
}

#[test]
fn nonzero_exit_without_json_carries_stderr() {
    let (status, text, cost, turns) =
        interpret(&sample_invocation(), false, "", "boom: no credentials\n");

    assert_eq!(status, ExecutionStatus::ProcessError);
    assert_eq!(text, "boom: no credentials");
    assert_eq!(cost, None);
    assert_eq!(turns, None);
}

#[test]
fn plain_text_success_passes_stdout_through() {
    let (status, text, _, _) = interpret(&sample_invocation(), true, "plain answer\n", "");
    assert_eq!(status, ExecutionStatus::Success);
    assert_eq!(text, "plain answer\n");
}

// ─── Subprocess supervision (unix: spawn real scripts) ──────────────────────

#[cfg(unix)]
mod spawn {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn fake_agent(tmp: &TempDir, body: &str) -> String {
        let path = tmp.path().join("agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn captures_structured_output() {
        let tmp = TempDir::new().unwrap();
        let bin = fake_agent(
            &tmp,
            r#"echo '{"result":"hello","total_cost_usd":0.01,"num_turns":1,"subtype":"success"}'"#,
        );
        let executor = Executor::with_binary(bin, Duration::from_secs(10));

        let result = executor
            .execute(&sample_invocation(), &CancellationToken::new())
            .await;

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.output_text, "hello");
        assert_eq!(result.turns_used, Some(1));
        assert!(result.ended_at >= result.started_at);
    }

    #[tokio::test]
    async fn nonzero_exit_reports_process_error() {
        let tmp = TempDir::new().unwrap();
        let bin = fake_agent(&tmp, "echo 'credentials missing' >&2; exit 3");
        let executor = Executor::with_binary(bin, Duration::from_secs(10));

        let result = executor
            .execute(&sample_invocation(), &CancellationToken::new())
            .await;

        assert_eq!(result.status, ExecutionStatus::ProcessError);
        assert!(result.output_text.contains("credentials missing"));
    }

    #[tokio::test]
    async fn wall_clock_ceiling_kills_and_reports_timeout() {
        let tmp = TempDir::new().unwrap();
        let bin = fake_agent(&tmp, "sleep 30");
        let executor = Executor::with_binary(bin, Duration::from_millis(200));

        let started = std::time::Instant::now();
        let result = executor
            .execute(&sample_invocation(), &CancellationToken::new())
            .await;

        assert_eq!(result.status, ExecutionStatus::Timeout);
        // The child was reaped, not awaited to natural completion.
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_reports_cancelled() {
        let tmp = TempDir::new().unwrap();
        let bin = fake_agent(&tmp, "sleep 30");
        let executor = Executor::with_binary(bin, Duration::from_secs(60));

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let result = executor.execute(&sample_invocation(), &cancel).await;
        assert_eq!(result.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn missing_binary_reports_process_error() {
        let executor =
            Executor::with_binary("/nonexistent/agent-bin", Duration::from_secs(1));
        let result = executor
            .execute(&sample_invocation(), &CancellationToken::new())
            .await;

        assert_eq!(result.status, ExecutionStatus::ProcessError);
        assert!(result.output_text.contains("failed to spawn"));
    }
}
