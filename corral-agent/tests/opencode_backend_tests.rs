use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use corral_agent::backends::opencode::{BackendUnavailable, OpenCodeBackend, OpenCodeConfig};
use corral_agent::{
    AgentBackend, AgentMessage, Mailbox, QueryOptions, ResultSubtype, SessionConfig, SystemSubtype,
};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

#[derive(Clone)]
struct FakeOpenCode {
    events: broadcast::Sender<Value>,
    prompts: Arc<Mutex<Vec<String>>>,
    aborts: Arc<AtomicUsize>,
}

fn session_json(id: &str) -> Value {
    json!({
        "id": id,
        "projectID": "prj_1",
        "directory": "/workspace/group",
        "title": "corral: main",
        "time": {"created": 1700000000000_i64, "updated": 1700000000500_i64}
    })
}

/// Events the fake server publishes in response to one prompt
fn script(session: &str, prompt: &str) -> Vec<Value> {
    match prompt {
        "hang" => Vec::new(),
        "fail" => vec![
            json!({"type": "session.error", "properties": {"sessionID": session, "error": {
                "name": "APIError", "data": {"message": "provider overloaded"}
            }}}),
            json!({"type": "session.idle", "properties": {"sessionID": session}}),
        ],
        _ => {
            let reply = if prompt == "hello" {
                "Hello world".to_string()
            } else {
                format!("echo: {prompt}")
            };
            let user_id = format!("msg_u_{prompt}");
            let assistant_id = format!("msg_a_{prompt}");
            let part_id = format!("prt_{prompt}");
            let text = |t: &str| {
                json!({"type": "message.part.updated", "properties": {"part": {
                    "id": part_id, "messageID": assistant_id, "sessionID": session, "type": "text", "text": t
                }}})
            };
            let half = reply.len() / 2;
            vec![
                json!({"type": "message.updated", "properties": {"info": {
                    "id": user_id, "sessionID": session, "role": "user"
                }}}),
                json!({"type": "message.part.updated", "properties": {"part": {
                    "id": format!("prt_u_{prompt}"), "messageID": user_id, "sessionID": session,
                    "type": "text", "text": prompt
                }}}),
                json!({"type": "session.status", "properties": {"sessionID": session, "status": {"type": "busy"}}}),
                json!({"type": "message.updated", "properties": {"info": {
                    "id": assistant_id, "sessionID": session, "role": "assistant"
                }}}),
                text(&reply[..half]),
                json!({"type": "message.part.updated", "properties": {"part": {
                    "id": "prt_noise", "messageID": "msg_other", "sessionID": "ses_other",
                    "type": "text", "text": "not ours"
                }}}),
                text(&reply),
                text(&reply),
                json!({"type": "message.updated", "properties": {"info": {
                    "id": assistant_id, "sessionID": session, "role": "assistant",
                    "tokens": {"input": 12, "output": 4, "cache": {"read": 0, "write": 0}}, "cost": 0.002
                }}}),
                json!({"type": "session.idle", "properties": {"sessionID": session}}),
            ]
        }
    }
}

async fn create_session() -> Json<Value> {
    Json(session_json("ses_1"))
}

async fn get_session(Path(id): Path<String>) -> Result<Json<Value>, StatusCode> {
    if id == "ses_1" {
        Ok(Json(session_json(&id)))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn fork_session(Path(id): Path<String>, Json(body): Json<Value>) -> Json<Value> {
    let at = body["messageID"].as_str().unwrap_or("none");
    Json(session_json(&format!("{id}_fork_{at}")))
}

async fn prompt_async(
    State(state): State<FakeOpenCode>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    let text = body["parts"][0]["text"].as_str().unwrap_or("").to_string();
    state.prompts.lock().unwrap().push(text.clone());
    for event in script(&id, &text) {
        let _ = state.events.send(event);
    }
    StatusCode::NO_CONTENT
}

async fn abort(State(state): State<FakeOpenCode>, Path(id): Path<String>) -> Json<Value> {
    state.aborts.fetch_add(1, Ordering::SeqCst);
    let _ = state.events.send(json!({"type": "session.error", "properties": {"sessionID": id, "error": {
        "name": "MessageAbortedError", "data": {"message": "aborted"}
    }}}));
    let _ = state.events.send(json!({"type": "session.idle", "properties": {"sessionID": id}}));
    Json(json!(true))
}

async fn events(
    State(state): State<FakeOpenCode>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.events.subscribe();
    let stream = async_stream::stream! {
        yield Ok(Event::default().data(json!({"type": "server.connected", "properties": {}}).to_string()));
        loop {
            match rx.recv().await {
                Ok(event) => yield Ok(Event::default().data(event.to_string())),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream)
}

async fn start_fake() -> (FakeOpenCode, String) {
    let (events_tx, _) = broadcast::channel(256);
    let state = FakeOpenCode {
        events: events_tx,
        prompts: Arc::new(Mutex::new(Vec::new())),
        aborts: Arc::new(AtomicUsize::new(0)),
    };

    let app = Router::new()
        .route("/session", post(create_session))
        .route("/session/{id}", get(get_session))
        .route("/session/{id}/fork", post(fork_session))
        .route("/session/{id}/prompt_async", post(prompt_async))
        .route("/session/{id}/abort", post(abort))
        .route("/event", get(events))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (state, format!("http://{addr}"))
}

fn backend(url: &str) -> OpenCodeBackend {
    OpenCodeBackend::new(OpenCodeConfig {
        base_url: url.to_string(),
    })
    .unwrap()
}

fn collect_text(messages: &[AgentMessage]) -> String {
    messages
        .iter()
        .filter_map(|m| match m {
            AgentMessage::Text { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_create_session_fills_metadata() {
    let (_fake, url) = start_fake().await;
    let backend = backend(&url);

    let session = backend
        .create_session(SessionConfig::new("/workspace/group"))
        .await
        .unwrap();

    assert_eq!(session.id.as_deref(), Some("ses_1"));
    assert_eq!(session.metadata.project_id.as_deref(), Some("prj_1"));
    assert_eq!(session.metadata.created_at, Some(1700000000000));
}

#[tokio::test]
async fn test_single_turn_streams_deduplicated_text_and_one_result() {
    let (_fake, url) = start_fake().await;
    let backend = backend(&url);
    let mut session = backend
        .create_session(SessionConfig::new("/workspace/group"))
        .await
        .unwrap();

    let messages: Vec<AgentMessage> = tokio::time::timeout(
        Duration::from_secs(10),
        backend
            .run_query(&mut session, "hello", QueryOptions::default())
            .collect(),
    )
    .await
    .unwrap();

    assert_eq!(messages[0], AgentMessage::init("ses_1"));
    assert_eq!(collect_text(&messages), "Hello world");

    let results: Vec<_> = messages.iter().filter(|m| m.is_result()).collect();
    assert_eq!(results.len(), 1);
    match results[0] {
        AgentMessage::Result {
            subtype: ResultSubtype::Success,
            result: Some(text),
            usage: Some(usage),
        } => {
            assert_eq!(text, "Hello world");
            assert_eq!(usage.input_tokens, 12);
        }
        other => panic!("expected success, got {other:?}"),
    }
}

#[tokio::test]
async fn test_session_error_then_idle_is_one_error() {
    let (_fake, url) = start_fake().await;
    let backend = backend(&url);
    let mut session = backend
        .create_session(SessionConfig::new("/workspace/group"))
        .await
        .unwrap();

    let messages: Vec<AgentMessage> = tokio::time::timeout(
        Duration::from_secs(10),
        backend
            .run_query(&mut session, "fail", QueryOptions::default())
            .collect(),
    )
    .await
    .unwrap();

    let results: Vec<_> = messages.iter().filter(|m| m.is_result()).cloned().collect();
    assert_eq!(
        results,
        vec![AgentMessage::failure(ResultSubtype::Error, "provider overloaded")]
    );
}

#[tokio::test]
async fn test_multi_turn_reuses_subscription_and_emits_init_once() {
    let (fake, url) = start_fake().await;
    let backend = backend(&url);
    let mut session = backend
        .create_session(SessionConfig::new("/workspace/group"))
        .await
        .unwrap();

    let dir = TempDir::new().unwrap();
    let mailbox = Mailbox::for_ipc_root(dir.path()).with_poll_interval(Duration::from_millis(20));
    mailbox.enqueue("again").await.unwrap();
    mailbox.request_close().await.unwrap();

    let messages: Vec<AgentMessage> = tokio::time::timeout(
        Duration::from_secs(10),
        backend
            .run_multi_turn_query(&mut session, "hello", &mailbox, QueryOptions::default())
            .collect(),
    )
    .await
    .unwrap();

    let inits = messages
        .iter()
        .filter(|m| matches!(m, AgentMessage::System { subtype: SystemSubtype::Init, .. }))
        .count();
    let results: Vec<_> = messages.iter().filter(|m| m.is_result()).cloned().collect();

    assert_eq!(inits, 1);
    assert_eq!(
        results,
        vec![
            AgentMessage::success(
                "Hello world",
                Some(corral_agent::Usage {
                    input_tokens: 12,
                    output_tokens: 4,
                    cache_read_tokens: Some(0),
                    cache_write_tokens: Some(0),
                    cost_usd: Some(0.002),
                })
            ),
            AgentMessage::success(
                "echo: again",
                Some(corral_agent::Usage {
                    input_tokens: 12,
                    output_tokens: 4,
                    cache_read_tokens: Some(0),
                    cache_write_tokens: Some(0),
                    cost_usd: Some(0.002),
                })
            ),
        ]
    );
    assert_eq!(*fake.prompts.lock().unwrap(), vec!["hello", "again"]);
    assert_eq!(session.turns(), 2);
}

fn results_of(messages: &[AgentMessage]) -> Vec<(ResultSubtype, Option<String>)> {
    messages
        .iter()
        .filter_map(|m| match m {
            AgentMessage::Result { subtype, result, .. } => Some((*subtype, result.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_follow_up_after_error_turn_gets_its_own_reply() {
    let (fake, url) = start_fake().await;
    let backend = backend(&url);
    let mut session = backend
        .create_session(SessionConfig::new("/workspace/group"))
        .await
        .unwrap();

    let dir = TempDir::new().unwrap();
    let mailbox = Mailbox::for_ipc_root(dir.path()).with_poll_interval(Duration::from_millis(20));
    mailbox.enqueue("again").await.unwrap();
    mailbox.request_close().await.unwrap();

    let messages: Vec<AgentMessage> = tokio::time::timeout(
        Duration::from_secs(10),
        backend
            .run_multi_turn_query(&mut session, "fail", &mailbox, QueryOptions::default())
            .collect(),
    )
    .await
    .unwrap();

    let results = results_of(&messages);
    assert_eq!(results.len(), 2, "one result per turn: {results:?}");
    assert_eq!(results[0].0, ResultSubtype::Error);
    assert_eq!(results[1], (ResultSubtype::Success, Some("echo: again".to_string())));
    assert_eq!(*fake.prompts.lock().unwrap(), vec!["fail", "again"]);
}

#[tokio::test]
async fn test_follow_up_after_timed_out_turn_is_not_aborted() {
    let (fake, url) = start_fake().await;
    let backend = backend(&url);
    let mut session = backend
        .create_session(SessionConfig::new("/workspace/group"))
        .await
        .unwrap();

    let dir = TempDir::new().unwrap();
    let mailbox = Mailbox::for_ipc_root(dir.path()).with_poll_interval(Duration::from_millis(20));
    mailbox.enqueue("again").await.unwrap();
    mailbox.request_close().await.unwrap();

    let options = QueryOptions::default().with_turn_timeout(Duration::from_millis(200));
    let messages: Vec<AgentMessage> = tokio::time::timeout(
        Duration::from_secs(10),
        backend
            .run_multi_turn_query(&mut session, "hang", &mailbox, options)
            .collect(),
    )
    .await
    .unwrap();

    let results = results_of(&messages);
    assert_eq!(results.len(), 2, "one result per turn: {results:?}");
    assert_eq!(results[0].0, ResultSubtype::Timeout);
    assert_eq!(results[1], (ResultSubtype::Success, Some("echo: again".to_string())));
    assert_eq!(fake.aborts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_aborts_upstream_and_yields_abort() {
    let (fake, url) = start_fake().await;
    let backend = backend(&url);
    let mut session = backend
        .create_session(SessionConfig::new("/workspace/group"))
        .await
        .unwrap();

    let options = QueryOptions::default();
    let cancel = options.abort.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
    });

    let messages: Vec<AgentMessage> = tokio::time::timeout(
        Duration::from_secs(10),
        backend.run_query(&mut session, "hang", options).collect(),
    )
    .await
    .unwrap();

    let results: Vec<_> = messages.iter().filter(|m| m.is_result()).collect();
    assert_eq!(results.len(), 1);
    assert!(matches!(
        results[0],
        AgentMessage::Result { subtype: ResultSubtype::Abort, .. }
    ));
    assert_eq!(fake.aborts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_turn_timeout_yields_timeout_result() {
    let (_fake, url) = start_fake().await;
    let backend = backend(&url);
    let mut session = backend
        .create_session(SessionConfig::new("/workspace/group"))
        .await
        .unwrap();

    let options = QueryOptions::default().with_turn_timeout(Duration::from_millis(200));
    let messages: Vec<AgentMessage> = tokio::time::timeout(
        Duration::from_secs(10),
        backend.run_query(&mut session, "hang", options).collect(),
    )
    .await
    .unwrap();

    match messages.iter().find(|m| m.is_result()) {
        Some(AgentMessage::Result {
            subtype: ResultSubtype::Timeout,
            result: Some(text),
            ..
        }) => assert!(text.starts_with("Timeout: ")),
        other => panic!("expected timeout result, got {other:?}"),
    }
}

#[tokio::test]
async fn test_resume_at_forks_instead_of_mutating() {
    let (_fake, url) = start_fake().await;
    let backend = backend(&url);

    let session = backend
        .resume_session(SessionConfig::new("/workspace/group"), "ses_1", Some("msg_7"))
        .await
        .unwrap();
    assert_eq!(session.id.as_deref(), Some("ses_1_fork_msg_7"));

    let plain = backend
        .resume_session(SessionConfig::new("/workspace/group"), "ses_1", None)
        .await
        .unwrap();
    assert_eq!(plain.id.as_deref(), Some("ses_1"));

    let missing = backend
        .resume_session(SessionConfig::new("/workspace/group"), "ses_gone", None)
        .await;
    assert!(missing.is_err());
}

#[tokio::test]
async fn test_unreachable_server_is_backend_unavailable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let backend = backend(&format!("http://{addr}"));
    let err = backend
        .create_session(SessionConfig::new("/workspace/group"))
        .await
        .unwrap_err();

    let unavailable = err
        .downcast_ref::<BackendUnavailable>()
        .expect("connection failure should be BackendUnavailable");
    assert!(unavailable.to_string().contains("opencode serve"));
}
