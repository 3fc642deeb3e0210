//! Telegram delivery against a local mock of the Bot API.

mod common;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::post;
use common::{Fixture, background, glyph, paste};
use pixeljack::config::ConfigLoader;
use pixeljack::error::NotifyError;
use pixeljack::notify::{Notification, NotificationTransport, Notifier, RetryPolicy, TelegramTransport};
use pixeljack::observability::{ErrorKind, Event, EventBus};
use pixeljack::platform::stub::{RecordingInput, StubBackend, VirtualScreen};
use pixeljack::runtime::{EngineKind, Runtime};

const TOKEN: &str = "123:test-token";

/// One request seen by the mock.
#[derive(Debug, Clone)]
struct Hit {
    bot: String,
    method: String,
    content_type: String,
    body: Vec<u8>,
}

impl Hit {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Default)]
struct MockBot {
    hits: Mutex<Vec<Hit>>,
    /// Requests still to be answered with 502.
    failures: AtomicU32,
}

impl MockBot {
    fn hits(&self) -> Vec<Hit> {
        self.hits.lock().unwrap().clone()
    }
}

async fn handle(
    State(bot): State<Arc<MockBot>>,
    Path((name, method)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    bot.hits.lock().unwrap().push(Hit {
        bot: name.clone(),
        method,
        content_type: headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        body: body.to_vec(),
    });
    if name != format!("bot{TOKEN}") {
        return (
            StatusCode::UNAUTHORIZED,
            r#"{"ok":false,"description":"Unauthorized"}"#.to_string(),
        );
    }
    if bot
        .failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return (StatusCode::BAD_GATEWAY, "upstream down".to_string());
    }
    (StatusCode::OK, r#"{"ok":true}"#.to_string())
}

async fn serve(bot: Arc<MockBot>) -> SocketAddr {
    let app = Router::new()
        .route("/{bot}/{method}", post(handle))
        .with_state(bot);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn transport(addr: SocketAddr, token: &str) -> TelegramTransport {
    TelegramTransport::new(
        token,
        "-100200",
        Some(&format!("http://{addr}")),
        Duration::from_secs(5),
    )
    .unwrap()
}

fn fast_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
    }
}

#[tokio::test]
async fn send_message_posts_chat_and_text_as_json() {
    let bot = Arc::new(MockBot::default());
    let addr = serve(Arc::clone(&bot)).await;

    transport(addr, TOKEN)
        .send_message("rival detected")
        .await
        .unwrap();

    let hits = bot.hits();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].bot, format!("bot{TOKEN}"));
    assert_eq!(hits[0].method, "sendMessage");
    assert!(hits[0].content_type.starts_with("application/json"));
    let json: serde_json::Value = serde_json::from_slice(&hits[0].body).unwrap();
    assert_eq!(json["chat_id"], "-100200");
    assert_eq!(json["text"], "rival detected");
}

#[tokio::test]
async fn send_photo_uploads_png_as_multipart() {
    let bot = Arc::new(MockBot::default());
    let addr = serve(Arc::clone(&bot)).await;
    let png = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

    transport(addr, TOKEN)
        .send_photo(&png, "snapshot caption")
        .await
        .unwrap();

    let hit = &bot.hits()[0];
    assert_eq!(hit.method, "sendPhoto");
    assert!(hit.content_type.starts_with("multipart/form-data"));
    let body = hit.text();
    assert!(body.contains("name=\"chat_id\""));
    assert!(body.contains("snapshot caption"));
    assert!(body.contains("filename=\"snapshot.png\""));
    assert!(body.contains("image/png"));
}

#[tokio::test]
async fn non_success_status_is_rejected_with_body() {
    let bot = Arc::new(MockBot::default());
    let addr = serve(Arc::clone(&bot)).await;

    let err = transport(addr, "999:wrong")
        .send_message("hello")
        .await
        .unwrap_err();
    match err {
        NotifyError::Rejected { status, body } => {
            assert_eq!(status, 401);
            assert!(body.contains("Unauthorized"));
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn worker_retries_transient_failures() {
    let bot = Arc::new(MockBot {
        failures: AtomicU32::new(2),
        ..MockBot::default()
    });
    let addr = serve(Arc::clone(&bot)).await;

    let notifier = Notifier::spawn(Arc::new(transport(addr, TOKEN)), fast_retries(3), None);
    notifier.sink().send(Notification::text("third time lucky"));
    assert!(notifier.shutdown(Duration::from_secs(10)).await);

    let hits = bot.hits();
    assert_eq!(hits.len(), 3);
    assert!(hits.iter().all(|h| h.text().contains("third time lucky")));
}

#[tokio::test]
async fn worker_gives_up_after_max_attempts_and_moves_on() {
    let bot = Arc::new(MockBot {
        failures: AtomicU32::new(3),
        ..MockBot::default()
    });
    let addr = serve(Arc::clone(&bot)).await;
    let events = Arc::new(EventBus::new());
    let mut rx = events.subscribe();

    let notifier = Notifier::spawn(
        Arc::new(transport(addr, TOKEN)),
        fast_retries(3),
        Some(Arc::clone(&events)),
    );
    let sink = notifier.sink();
    sink.send(Notification::text("lost"));
    sink.send(Notification::text("delivered"));
    assert!(notifier.shutdown(Duration::from_secs(10)).await);

    let texts: Vec<_> = bot.hits().iter().map(Hit::text).collect();
    assert_eq!(texts.len(), 4);
    assert!(texts[..3].iter().all(|t| t.contains("lost")));
    assert!(texts[3].contains("delivered"));

    let event = rx.try_recv().unwrap();
    assert!(matches!(
        event,
        Event::ErrorOccurred {
            kind: ErrorKind::Notification,
            ..
        }
    ));
}

#[tokio::test]
async fn runtime_forwards_trigger_onset_to_the_chat() {
    let bot = Arc::new(MockBot::default());
    let addr = serve(Arc::clone(&bot)).await;

    let fx = Fixture::new();
    fx.write_png("start.png", &glyph(3, 16, 16));
    let path = fx.write(
        "bot.yaml",
        &format!(
            r#"
clicker:
  trigger:
    region: {{ x1: 0, y1: 0, x2: 200, y2: 200 }}
    templates: [start.png]
  sequence:
    phases:
      - kind: fixed_wait
        duration_secs: 0.2
notify:
  telegram:
    token: "{TOKEN}"
    chat_id: "-100200"
    api_base: "http://{addr}"
  forward:
    trigger_onset: true
    sequence_completed: true
"#
        ),
    );
    let config = ConfigLoader::with_defaults().load(&path).unwrap().config;

    let mut screen_img = background(240, 240);
    paste(&mut screen_img, &glyph(3, 16, 16), 60, 60);
    let backend = StubBackend::new(VirtualScreen::from_image(screen_img), RecordingInput::new());
    let events = Arc::new(EventBus::new());
    let mut rx = events.subscribe();
    let runtime = Runtime::launch(&config, &backend, &events, &[EngineKind::Clicker]).unwrap();

    common::wait_for(&mut rx, |e| matches!(e, Event::SequenceCompleted { .. })).await;
    assert!(runtime.shutdown(Duration::from_secs(10)).await);

    let texts: Vec<_> = bot
        .hits()
        .iter()
        .filter(|h| h.method == "sendMessage")
        .map(Hit::text)
        .collect();
    assert!(
        texts.iter().any(|t| t.contains("trigger 'start' at (68, 68)")),
        "{texts:?}"
    );
    assert!(texts.iter().any(|t| t.contains("sequence completed")), "{texts:?}");
}
