mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use backup_jobs::backup::{BackupType, JobDefinition, JobState};
use backup_jobs::crypto::StreamCipher;
use backup_jobs::remote::{CommandHandler, JobStatusDto, StatusBroadcaster};
use backup_jobs::storage::Storage;
use backup_jobs::utils::log_buffer::JobEvent;
use backup_jobs::web::{self, AppState};
use common::*;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn app(svc: &Service, every: Duration) -> axum::Router {
    let handler: Arc<dyn CommandHandler> = Arc::new(svc.manager.clone());
    let broadcaster = StatusBroadcaster::new();
    broadcaster.start(handler, every);
    web::router(AppState {
        manager: svc.manager.clone(),
        broadcaster,
    })
}

async fn next_status(socket: &mut Socket) -> Vec<JobStatusDto> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .unwrap();
        match frame {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("socket ended: {:?}", other),
        }
    }
}

async fn send_json(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: &str,
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn websocket_sends_snapshot_and_runs_commands() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    write_tree(&src, &[("held.enc", b"payload")]);

    let latch = Arc::new(Latch::default());
    let svc = service(None, Arc::new(LatchedCipher(latch.clone())));
    let definition = JobDefinition::new("Backup1", &src, dir.path().join("dst"), BackupType::Full)
        .unwrap()
        .with_encryption(["enc"]);
    svc.manager.add(definition).await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(&svc, Duration::from_millis(50));
    tokio::spawn(async move { axum::serve(listener, router).await });

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws/", addr))
        .await
        .unwrap();
    let initial = next_status(&mut socket).await;
    assert_eq!(initial.len(), 1);
    assert_eq!(initial[0].name, "Backup1");
    assert_eq!(initial[0].state, JobState::Pending);

    socket.send(Message::Text("not json".into())).await.unwrap();
    socket
        .send(Message::Text(r#"{"Command":"run","JobName":"backup1"}"#.into()))
        .await
        .unwrap();

    let mut running = false;
    for _ in 0..20 {
        if next_status(&mut socket).await[0].state == JobState::Running {
            running = true;
            break;
        }
    }
    assert!(running, "RUNNING never reached the socket");

    latch.release();
    wait_for_state(&svc.manager, "Backup1", JobState::Completed).await;
    let mut completed = false;
    for _ in 0..20 {
        if next_status(&mut socket).await[0].state == JobState::Completed {
            completed = true;
            break;
        }
    }
    assert!(completed);
}

#[tokio::test]
async fn api_reports_missing_job_names_and_unknown_jobs() {
    let svc = service(None, Arc::new(StreamCipher::new()));
    let app = app(&svc, Duration::from_secs(1));

    let (status, body) = send_json(&app, "POST", "/api/command", r#"{"Command":"run"}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("needs a job name"));

    let (status, _) = send_json(
        &app,
        "POST",
        "/api/command",
        r#"{"Command":"pause","JobName":"ghost"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send_json(&app, "GET", "/api/jobs", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!([]));
}

#[tokio::test]
async fn api_lists_stored_events_per_job() {
    let storage = Storage::in_memory().await.unwrap();
    storage
        .add_event(&JobEvent::error(Some("Backup1"), "disk full"))
        .await
        .unwrap();
    storage
        .add_event(&JobEvent::error(Some("Other"), "unrelated"))
        .await
        .unwrap();
    let svc = service(Some(storage), Arc::new(StreamCipher::new()));
    let app = app(&svc, Duration::from_secs(1));

    let (status, body) = send_json(&app, "GET", "/api/events?job=backup1&limit=5", "").await;
    assert_eq!(status, StatusCode::OK);
    let events = body.as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["job_name"], "Backup1");
    assert_eq!(events[0]["level"], "error");

    let (_, all) = send_json(&app, "GET", "/api/events", "").await;
    assert_eq!(all.as_array().unwrap().len(), 2);
}
