use corral_core::{
    BackendKind, Config, ContainerInput, ContainerSpec, Dispatcher, Launch, Launcher,
    OutputStatus, SessionStore,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const EMIT: &str = r#"emit() { printf '%s\n' '---OUTPUT-START---' "$1" '---OUTPUT-END---'; }"#;

/// Runs a shell script in place of the container runtime
struct ScriptLauncher {
    body: String,
}

impl Launcher for ScriptLauncher {
    fn launch(&self, spec: &ContainerSpec) -> Launch {
        let script = format!("{EMIT}\n{}", self.body);
        Launch::new("sh", ["-c", script.as_str()])
            .env("CORRAL_IPC_DIR", spec.ipc_dir.to_string_lossy())
            .env("CORRAL_GROUP_DIR", spec.group_dir.to_string_lossy())
    }
}

fn config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.paths.data_dir = dir.path().to_string_lossy().to_string();
    config.container.timeout_ms = 10_000;
    config.container.idle_timeout_ms = 10_000;
    config.container.close_grace_ms = 1_000;
    config
}

fn dispatcher(config: Config, body: &str) -> Dispatcher {
    Dispatcher::new(Arc::new(config)).with_launcher(Arc::new(ScriptLauncher {
        body: body.to_string(),
    }))
}

fn prompt(text: &str) -> ContainerInput {
    ContainerInput {
        prompt: text.to_string(),
        ..Default::default()
    }
}

fn read_input(dir: &TempDir, group: &str) -> ContainerInput {
    let path = dir.path().join("groups").join(group).join("stdin.json");
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

async fn wait_until_active(dispatcher: &Dispatcher, group: &str) {
    for _ in 0..250 {
        if dispatcher.is_active(group) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("group {group} never became active");
}

#[tokio::test]
async fn test_run_fills_group_fields_and_persists_session() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path()).unwrap();
    let mut config = config(&dir);
    config.groups.insert(
        "family".to_string(),
        corral_core::config::GroupConfig {
            is_main: true,
            ..Default::default()
        },
    );
    let dispatcher = dispatcher(
        config,
        r#"cat > "$CORRAL_GROUP_DIR/stdin.json"
emit '{"status":"success","result":"hello","newSessionId":"sess-A"}'"#,
    )
    .with_store(store.clone());

    let mut relayed = Vec::new();
    let outcome = dispatcher
        .run("family", prompt("hi"), |o| relayed.push(o.clone()))
        .await
        .unwrap();

    assert_eq!(outcome.status(), OutputStatus::Success);
    assert_eq!(relayed.len(), 1);

    let sent = read_input(&dir, "family");
    assert_eq!(sent.group_folder, "family");
    assert!(sent.is_main);
    assert_eq!(sent.session_id, None);

    let saved = store.get("family").unwrap().unwrap();
    assert_eq!(saved.session_id, "sess-A");
    assert_eq!(saved.backend, BackendKind::Claude);

    // The next run resumes the stored session
    dispatcher.run("family", prompt("again"), |_| {}).await.unwrap();
    assert_eq!(read_input(&dir, "family").session_id.as_deref(), Some("sess-A"));
}

#[tokio::test]
async fn test_backend_change_starts_fresh_session() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path()).unwrap();
    store.save("research", "oc-session", BackendKind::OpenCode).unwrap();

    let dispatcher = dispatcher(
        config(&dir),
        r#"cat > "$CORRAL_GROUP_DIR/stdin.json"
emit '{"status":"success","result":"ok"}'"#,
    )
    .with_store(store);

    dispatcher.run("research", prompt("hi"), |_| {}).await.unwrap();
    assert_eq!(read_input(&dir, "research").session_id, None);
}

#[tokio::test]
async fn test_follow_ups_route_into_live_container() {
    let dir = TempDir::new().unwrap();
    let dispatcher = Arc::new(dispatcher(
        config(&dir),
        r#"cat > /dev/null
emit '{"status":"success","result":"first"}'
while [ ! -f "$CORRAL_IPC_DIR/input/_close" ]; do sleep 0.05; done"#,
    ));

    assert!(!dispatcher.send_message("ops", "too early").await.unwrap());

    let runner = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run("ops", prompt("start"), |_| {}).await })
    };
    wait_until_active(&dispatcher, "ops").await;
    assert_eq!(dispatcher.active_groups(), vec!["ops".to_string()]);

    assert!(dispatcher.send_message("ops", "follow up").await.unwrap());
    let queued = std::fs::read_dir(dir.path().join("ipc/ops/input"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".json"))
        .count();
    assert_eq!(queued, 1);

    assert!(dispatcher.close_session("ops").await.unwrap());
    let outcome = tokio::time::timeout(Duration::from_secs(10), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(outcome.status(), OutputStatus::Success);
    assert!(!dispatcher.is_active("ops"));
    assert!(!dispatcher.send_message("ops", "too late").await.unwrap());
    assert!(!dispatcher.close_session("ops").await.unwrap());
}

#[tokio::test]
async fn test_runs_for_one_group_never_overlap() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("order.log");
    let body = format!(
        r#"cat > /dev/null
echo start >> "{log}"
sleep 0.2
echo end >> "{log}"
emit '{{"status":"success","result":"ok"}}'"#,
        log = log.display()
    );
    let dispatcher = dispatcher(config(&dir), &body);

    let (a, b) = tokio::join!(
        dispatcher.run("solo", prompt("one"), |_| {}),
        dispatcher.run("solo", prompt("two"), |_| {}),
    );
    a.unwrap();
    b.unwrap();

    let order = std::fs::read_to_string(&log).unwrap();
    assert_eq!(order.lines().collect::<Vec<_>>(), vec!["start", "end", "start", "end"]);
}

#[tokio::test]
async fn test_concurrency_ceiling_applies_across_groups() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("order.log");
    let body = format!(
        r#"cat > /dev/null
echo start >> "{log}"
sleep 0.2
echo end >> "{log}"
emit '{{"status":"success","result":"ok"}}'"#,
        log = log.display()
    );
    let mut config = config(&dir);
    config.container.max_concurrent = 1;
    let dispatcher = dispatcher(config, &body);

    let (a, b) = tokio::join!(
        dispatcher.run("alpha", prompt("one"), |_| {}),
        dispatcher.run("beta", prompt("two"), |_| {}),
    );
    a.unwrap();
    b.unwrap();

    let order = std::fs::read_to_string(&log).unwrap();
    assert_eq!(order.lines().collect::<Vec<_>>(), vec!["start", "end", "start", "end"]);
}

#[tokio::test]
async fn test_stale_close_sentinel_is_cleared_before_launch() {
    let dir = TempDir::new().unwrap();
    let input_dir = dir.path().join("ipc/main/input");
    std::fs::create_dir_all(&input_dir).unwrap();
    std::fs::write(input_dir.join("_close"), b"").unwrap();

    let dispatcher = dispatcher(
        config(&dir),
        r#"cat > /dev/null
if [ -f "$CORRAL_IPC_DIR/input/_close" ]; then
  emit '{"status":"success","result":"stale"}'
else
  emit '{"status":"success","result":"clean"}'
fi"#,
    );

    let outcome = dispatcher.run("main", prompt("hi"), |_| {}).await.unwrap();
    assert_eq!(outcome.output.result.as_deref(), Some("clean"));
}

#[tokio::test]
async fn test_invalid_group_is_rejected() {
    let dir = TempDir::new().unwrap();
    let dispatcher = dispatcher(config(&dir), "true");
    assert!(dispatcher.run("../etc", prompt("hi"), |_| {}).await.is_err());
}
