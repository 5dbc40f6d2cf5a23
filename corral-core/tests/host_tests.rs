use corral_core::container::StopCommand;
use corral_core::{
    ContainerInput, ContainerOutput, Expiry, HostLimits, HostRun, Launch, OutputStatus,
    SessionHost, Timeouts,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const EMIT: &str = r#"emit() { printf '%s\n' '---OUTPUT-START---' "$1" '---OUTPUT-END---'; }"#;

fn limits(hard_ms: u64, idle_ms: u64, grace_ms: u64) -> HostLimits {
    HostLimits {
        timeouts: Timeouts {
            hard: Duration::from_millis(hard_ms),
            idle: Duration::from_millis(idle_ms),
            grace: Duration::from_millis(grace_ms),
        },
        max_output_bytes: 1024 * 1024,
    }
}

fn script_run(dir: &TempDir, body: &str) -> HostRun {
    let ipc_dir = dir.path().join("ipc");
    let script = format!("{EMIT}\n{body}");
    HostRun {
        group: "main".to_string(),
        launch: Launch::new("sh", ["-c", script.as_str()])
            .env("CORRAL_IPC_DIR", ipc_dir.to_string_lossy())
            .env("WORK", dir.path().to_string_lossy()),
        ipc_dir,
        log_dir: Some(dir.path().join("logs")),
    }
}

fn input(prompt: &str) -> ContainerInput {
    ContainerInput {
        prompt: prompt.to_string(),
        group_folder: "main".to_string(),
        ..Default::default()
    }
}

/// Collects every record the callback sees
fn recorder() -> (Arc<Mutex<Vec<ContainerOutput>>>, impl FnMut(&ContainerOutput) + Send) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |output: &ContainerOutput| {
        sink.lock().unwrap().push(output.clone())
    })
}

#[tokio::test]
async fn test_single_record_then_clean_exit_is_success() {
    let dir = TempDir::new().unwrap();
    let host = SessionHost::new(limits(5_000, 5_000, 1_000));
    let (seen, on_output) = recorder();

    let run = script_run(
        &dir,
        r#"cat > /dev/null
echo "agent booting"
emit '{"status":"success","result":"ok","newSessionId":"s1"}'
exit 0"#,
    );
    let outcome = host.run(run, &input("hi"), on_output).await;

    assert_eq!(outcome.status(), OutputStatus::Success);
    assert_eq!(outcome.output.new_session_id.as_deref(), Some("s1"));
    assert_eq!(outcome.output.result.as_deref(), Some("ok"));
    assert_eq!(outcome.records, 1);
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_hard_timeout_without_output_is_error_and_never_calls_back() {
    let dir = TempDir::new().unwrap();
    let host = SessionHost::new(limits(300, 5_000, 1_000));
    let (seen, on_output) = recorder();

    let started = std::time::Instant::now();
    let outcome = host
        .run(script_run(&dir, "exec sleep 30"), &input("hi"), on_output)
        .await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(outcome.status(), OutputStatus::Error);
    assert_eq!(outcome.forced_by, Some(Expiry::Hard));
    assert!(outcome.output.error.as_deref().unwrap_or("").contains("timed out"));
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_steady_output_outlives_the_original_hard_deadline() {
    let dir = TempDir::new().unwrap();
    // Five records 200ms apart run for about a second, well past the 600ms ceiling
    let host = SessionHost::new(limits(600, 450, 150));
    let (seen, on_output) = recorder();

    let run = script_run(
        &dir,
        r#"cat > /dev/null
for i in 1 2 3 4 5; do
  emit "{\"status\":\"success\",\"result\":\"turn $i\",\"newSessionId\":\"s1\"}"
  sleep 0.2
done"#,
    );
    let outcome = host.run(run, &input("hi"), on_output).await;

    assert_eq!(outcome.forced_by, None);
    assert_eq!(outcome.records, 5);
    assert_eq!(outcome.output.result.as_deref(), Some("turn 5"));
    let results: Vec<_> = seen
        .lock()
        .unwrap()
        .iter()
        .filter_map(|o| o.result.clone())
        .collect();
    assert_eq!(results, vec!["turn 1", "turn 2", "turn 3", "turn 4", "turn 5"]);
}

#[tokio::test]
async fn test_idle_container_is_asked_to_close_and_exits_cleanly() {
    let dir = TempDir::new().unwrap();
    let host = SessionHost::new(limits(10_000, 300, 5_000));
    let (_, on_output) = recorder();

    let run = script_run(
        &dir,
        r#"cat > /dev/null
emit '{"status":"success","result":"done","newSessionId":"s2"}'
while [ ! -f "$CORRAL_IPC_DIR/input/_close" ]; do sleep 0.05; done
exit 0"#,
    );
    let outcome = host.run(run, &input("hi"), on_output).await;

    assert!(outcome.idle_closed);
    assert_eq!(outcome.forced_by, None);
    assert_eq!(outcome.status(), OutputStatus::Success);
    assert_eq!(outcome.output.new_session_id.as_deref(), Some("s2"));
}

#[tokio::test]
async fn test_ignored_close_is_forced_after_grace_and_keeps_last_result() {
    let dir = TempDir::new().unwrap();
    let host = SessionHost::new(limits(10_000, 200, 300));
    let (_, on_output) = recorder();

    let run = script_run(
        &dir,
        r#"cat > /dev/null
emit '{"status":"success","result":"partial work","newSessionId":"s3"}'
exec sleep 30"#,
    );
    let outcome = host.run(run, &input("hi"), on_output).await;

    assert!(outcome.idle_closed);
    assert_eq!(outcome.forced_by, Some(Expiry::GraceElapsed));
    assert_eq!(outcome.status(), OutputStatus::Success);
    assert_eq!(outcome.output.result.as_deref(), Some("partial work"));
    assert!(dir.path().join("ipc/input/_close").exists());
}

#[tokio::test]
async fn test_follow_up_answered_during_close_grace_is_not_killed() {
    let dir = TempDir::new().unwrap();
    let host = SessionHost::new(limits(10_000, 200, 300));
    let (seen, on_output) = recorder();

    // turn 2 lands inside the grace window; turn 3 comes well after it would have ended
    let run = script_run(
        &dir,
        r#"cat > /dev/null
emit '{"status":"success","result":"turn1","newSessionId":"s4"}'
sleep 0.3
emit '{"status":"success","result":"turn2"}'
sleep 0.6
emit '{"status":"success","result":"turn3"}'
exit 0"#,
    );
    let outcome = host.run(run, &input("hi"), on_output).await;

    assert!(outcome.idle_closed);
    assert_eq!(outcome.forced_by, None);
    assert_eq!(outcome.exit_code, Some(0));
    let results: Vec<_> = seen
        .lock()
        .unwrap()
        .iter()
        .filter_map(|o| o.result.clone())
        .collect();
    assert_eq!(results, vec!["turn1", "turn2", "turn3"]);
}

#[tokio::test]
async fn test_records_after_much_noise_are_still_relayed() {
    let dir = TempDir::new().unwrap();
    let mut limits = limits(5_000, 5_000, 1_000);
    limits.max_output_bytes = 300;
    let host = SessionHost::new(limits);
    let (seen, on_output) = recorder();

    let run = script_run(
        &dir,
        r#"cat > /dev/null
emit '{"status":"success","result":"turn1","newSessionId":"s5"}'
for i in 1 2 3 4 5 6 7 8 9 10; do echo "progress line $i with some padding to use up bytes"; done
head -c 5000 /dev/zero | tr '\0' 'x'
echo
emit '{"status":"success","result":"turn2"}'
exit 0"#,
    );
    let outcome = host.run(run, &input("hi"), on_output).await;

    assert_eq!(outcome.records, 2);
    assert_eq!(outcome.output.result.as_deref(), Some("turn2"));
    let results: Vec<_> = seen
        .lock()
        .unwrap()
        .iter()
        .filter_map(|o| o.result.clone())
        .collect();
    assert_eq!(results, vec!["turn1", "turn2"]);
}

#[tokio::test]
async fn test_crash_without_output_reports_stderr() {
    let dir = TempDir::new().unwrap();
    let host = SessionHost::new(limits(5_000, 5_000, 1_000));
    let (_, on_output) = recorder();

    let run = script_run(&dir, "cat > /dev/null; echo 'image is broken' >&2; exit 3");
    let outcome = host.run(run, &input("hi"), on_output).await;

    assert_eq!(outcome.status(), OutputStatus::Error);
    assert_eq!(outcome.exit_code, Some(3));
    let error = outcome.output.error.unwrap_or_default();
    assert!(error.contains("code 3"), "{error}");
    assert!(error.contains("image is broken"), "{error}");
}

#[tokio::test]
async fn test_final_error_record_with_failing_exit_is_the_outcome() {
    let dir = TempDir::new().unwrap();
    let host = SessionHost::new(limits(5_000, 5_000, 1_000));
    let (_, on_output) = recorder();

    let run = script_run(
        &dir,
        r#"cat > /dev/null
emit '{"status":"error","result":null,"newSessionId":"s4","error":"backend unavailable"}'
exit 1"#,
    );
    let outcome = host.run(run, &input("hi"), on_output).await;

    assert_eq!(outcome.status(), OutputStatus::Error);
    assert_eq!(outcome.output.error.as_deref(), Some("backend unavailable"));
    assert_eq!(outcome.output.new_session_id.as_deref(), Some("s4"));
}

#[tokio::test]
async fn test_spawn_failure_resolves_to_error() {
    let dir = TempDir::new().unwrap();
    let host = SessionHost::new(limits(5_000, 5_000, 1_000));
    let (_, on_output) = recorder();

    let mut run = script_run(&dir, "true");
    run.launch = Launch::new("/nonexistent/corral-runtime", ["run"]);
    let outcome = host.run(run, &input("hi"), on_output).await;

    assert_eq!(outcome.status(), OutputStatus::Error);
    assert!(outcome
        .output
        .error
        .unwrap_or_default()
        .starts_with("Failed to spawn /nonexistent/corral-runtime"));
}

#[tokio::test]
async fn test_input_is_written_to_stdin_as_json() {
    let dir = TempDir::new().unwrap();
    let host = SessionHost::new(limits(5_000, 5_000, 1_000));
    let (_, on_output) = recorder();

    let run = script_run(
        &dir,
        r#"cat > "$WORK/stdin.json"
emit '{"status":"success","result":"ok"}'"#,
    );
    let mut request = input("summarize the thread");
    request.session_id = Some("existing".to_string());
    host.run(run, &request, on_output).await;

    let written = std::fs::read_to_string(dir.path().join("stdin.json")).unwrap();
    let parsed: ContainerInput = serde_json::from_str(&written).unwrap();
    assert_eq!(parsed, request);
}

#[tokio::test]
async fn test_forced_stop_runs_the_stop_command() {
    let dir = TempDir::new().unwrap();
    let host = SessionHost::new(limits(300, 5_000, 1_000));
    let (_, on_output) = recorder();

    let marker = dir.path().join("stopped");
    let mut run = script_run(&dir, "exec sleep 30");
    run.launch.stop = Some(StopCommand {
        program: "touch".to_string(),
        args: vec![marker.to_string_lossy().to_string()],
    });
    host.run(run, &input("hi"), on_output).await;

    assert!(marker.exists());
}

#[tokio::test]
async fn test_run_log_is_written() {
    let dir = TempDir::new().unwrap();
    let host = SessionHost::new(limits(5_000, 5_000, 1_000));
    let (_, on_output) = recorder();

    let run = script_run(
        &dir,
        r#"cat > /dev/null
echo "warming up" >&2
emit '{"status":"success","result":"ok"}'"#,
    );
    host.run(run, &input("hi"), on_output).await;

    let logs: Vec<_> = std::fs::read_dir(dir.path().join("logs"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(logs.len(), 1);
    let name = logs[0].file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("container-") && name.ends_with(".log"));

    let text = std::fs::read_to_string(&logs[0]).unwrap();
    assert!(text.contains("Group: main"));
    assert!(text.contains("Output records: 1"));
    assert!(text.contains("warming up"));
}
