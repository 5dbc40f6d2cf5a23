use corral_agent::backends::mock::MockBackend;
use corral_agent::{
    runner, AgentMessage, BackendKind, ContainerInput, ContainerOutput, FrameDecoder, Mailbox,
    OutputStatus, ResultSubtype, RunnerConfig,
};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn config(dir: &TempDir) -> RunnerConfig {
    RunnerConfig {
        backend: BackendKind::Claude,
        ipc_dir: dir.path().join("ipc"),
        workspace_dir: dir.path().to_path_buf(),
        claude_binary: "claude".to_string(),
        opencode_url: "http://127.0.0.1:4096".to_string(),
        poll_interval: Duration::from_millis(20),
        turn_timeout: None,
    }
}

fn input(prompt: &str) -> ContainerInput {
    ContainerInput {
        prompt: prompt.to_string(),
        group_folder: "main".to_string(),
        ..Default::default()
    }
}

fn decode(out: &[u8]) -> Vec<ContainerOutput> {
    let mut decoder = FrameDecoder::new();
    decoder
        .push(&String::from_utf8_lossy(out))
        .into_iter()
        .map(|r| r.unwrap())
        .collect()
}

#[tokio::test]
async fn test_each_turn_result_becomes_one_framed_record() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let mailbox = Mailbox::for_ipc_root(&config.ipc_dir);
    mailbox.request_close().await.unwrap();

    let mock = MockBackend::new().on_prompt("hello").respond_text("hi there");
    let mut out = Vec::new();

    let records = runner::run(&mock, &config, input("hello"), CancellationToken::new(), &mut out)
        .await
        .unwrap();

    assert_eq!(records, 1);
    assert_eq!(
        decode(&out),
        vec![ContainerOutput::success(
            Some("hi there".to_string()),
            Some("mock-session-1".to_string())
        )]
    );
}

#[tokio::test]
async fn test_queued_messages_are_folded_into_first_prompt() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let mailbox = Mailbox::for_ipc_root(&config.ipc_dir);
    mailbox.enqueue("also this").await.unwrap();
    mailbox.request_close().await.unwrap();

    let mock = MockBackend::new().on_prompt("hello").respond_text("ok");
    let mut out = Vec::new();
    runner::run(&mock, &config, input("hello"), CancellationToken::new(), &mut out)
        .await
        .unwrap();

    assert_eq!(mock.prompts(), vec!["hello\nalso this"]);
}

#[tokio::test]
async fn test_resume_carries_session_id_into_records() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    Mailbox::for_ipc_root(&config.ipc_dir)
        .request_close()
        .await
        .unwrap();

    let mock = MockBackend::new().on_prompt("again").respond_with(vec![AgentMessage::failure(
        ResultSubtype::Timeout,
        "model took too long",
    )]);
    let mut resumed = input("again");
    resumed.session_id = Some("existing-7".to_string());

    let mut out = Vec::new();
    runner::run(&mock, &config, resumed, CancellationToken::new(), &mut out)
        .await
        .unwrap();

    let records = decode(&out);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, OutputStatus::Timeout);
    assert_eq!(records[0].result.as_deref(), Some("Timeout: model took too long"));
    assert_eq!(records[0].new_session_id.as_deref(), Some("existing-7"));
}

#[tokio::test]
async fn test_follow_up_turns_write_additional_records() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let writer = Mailbox::for_ipc_root(&config.ipc_dir);

    let mock = MockBackend::new()
        .on_prompt("first")
        .respond_text("one")
        .on_prompt("second")
        .respond_text("two");

    let mut out = Vec::new();
    let run = runner::run(&mock, &config, input("first"), CancellationToken::new(), &mut out);
    let feed = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        writer.enqueue("second").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        writer.request_close().await.unwrap();
    };

    let (records, _) = tokio::time::timeout(Duration::from_secs(10), async { tokio::join!(run, feed) })
        .await
        .unwrap();

    assert_eq!(records.unwrap(), 2);
    let results: Vec<_> = decode(&out).into_iter().map(|r| r.result).collect();
    assert_eq!(results, vec![Some("one".to_string()), Some("two".to_string())]);
}
