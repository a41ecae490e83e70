//! LiveSession end to end: wiremock serves the page, a local WebSocket
//! server plays the LiveView channel.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tiki_channel::ChannelError;
use tiki_liveview::{
    BootstrapError, Endpoint, LiveSession, SessionConfig, SessionError, SessionState,
};

const TIMEOUT: Duration = Duration::from_secs(5);
const PAGE_PATH: &str = "/events/1/purchase";

const PAGE: &str = r#"<html>
  <head><meta name="csrf-token" content="Csrf-Tok3n"></head>
  <body>
    <div id="phx-F1abc" data-phx-main data-phx-session="S.session" data-phx-static="S.static"></div>
  </body>
</html>"#;

/// How the channel server treats the join.
#[derive(Clone, Copy)]
enum Mode {
    Accept,
    RejectJoin,
    DropAfterJoin,
    CloseTopicAfterJoin,
}

/// What the channel server observed.
#[derive(Debug)]
enum Seen {
    Upgrade { query: String, cookie: Option<String> },
    Frame(Value),
    Closed,
}

async fn serve_socket(mode: Mode) -> (String, mpsc::UnboundedReceiver<Seen>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    let _server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let upgrade_tx = seen_tx.clone();
        let callback = move |req: &Request, resp: Response| {
            let _ = upgrade_tx.send(Seen::Upgrade {
                query: req.uri().query().unwrap_or_default().to_owned(),
                cookie: req
                    .headers()
                    .get("cookie")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned),
            });
            Ok::<_, ErrorResponse>(resp)
        };
        let mut ws = accept_hdr_async(stream, callback).await.unwrap();

        while let Some(Ok(msg)) = ws.next().await {
            let Message::Text(text) = msg else {
                continue;
            };
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            let _ = seen_tx.send(Seen::Frame(frame.clone()));

            let event = frame[3].as_str().unwrap_or_default().to_owned();
            let (status, response) = match (event.as_str(), mode) {
                ("phx_join", Mode::RejectJoin) => ("error", json!({"reason": "stale"})),
                ("phx_join", _) => ("ok", json!({"rendered": {"0": "0"}})),
                ("heartbeat" | "phx_leave", _) => ("ok", json!({})),
                (_, _) => ("ok", json!({"echo": frame[4]})),
            };
            let reply = json!([frame[0], frame[1], frame[2], "phx_reply", {"status": status, "response": response}]);
            if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
                break;
            }
            if event == "phx_join" && matches!(mode, Mode::CloseTopicAfterJoin) {
                let close = json!([frame[0], null, frame[2], "phx_close", {}]);
                if ws.send(Message::Text(close.to_string().into())).await.is_err() {
                    break;
                }
            }
            if event == "phx_join" && matches!(mode, Mode::DropAfterJoin) {
                let _ = ws.close(None).await;
                break;
            }
        }
        let _ = seen_tx.send(Seen::Closed);
    });

    (format!("ws://{addr}/live/websocket?vsn=2.0.0"), seen_rx)
}

async fn serve_page(template: ResponseTemplate) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(PAGE_PATH))
        .and(header("cookie", "_tiki_key=abc"))
        .respond_with(template)
        .expect(1)
        .mount(&server)
        .await;
    server
}

fn session(page: &MockServer, socket_url: &str) -> LiveSession {
    let endpoint = Endpoint::new(&format!("{}{PAGE_PATH}", page.uri()), socket_url)
        .unwrap()
        .with_cookie("_tiki_key", "abc");
    LiveSession::new(Arc::new(endpoint), SessionConfig::default())
}

async fn next_seen(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn connect_send_and_leave() {
    let page = serve_page(
        ResponseTemplate::new(200)
            .set_body_string(PAGE)
            .insert_header("set-cookie", "_tiki_key=fresh; path=/; HttpOnly"),
    )
    .await;
    let (socket_url, mut seen) = serve_socket(Mode::Accept).await;
    let mut session = session(&page, &socket_url);

    let rendered = timeout(TIMEOUT, session.connect()).await.unwrap().unwrap();
    assert_eq!(rendered, json!({"rendered": {"0": "0"}}));
    assert_eq!(session.state(), SessionState::Joined);
    assert_eq!(session.topic(), Some("lv:phx-F1abc"));

    assert_matches!(
        next_seen(&mut seen).await,
        Seen::Upgrade { query, cookie }
            if query == "vsn=2.0.0&_csrf_token=Csrf-Tok3n"
                && cookie.as_deref() == Some("_tiki_key=fresh")
    );
    let Seen::Frame(join) = next_seen(&mut seen).await else {
        panic!("expected the join frame");
    };
    assert_eq!(join[2], "lv:phx-F1abc");
    assert_eq!(join[3], "phx_join");
    assert_eq!(
        join[4],
        json!({
            "url": format!("{}{PAGE_PATH}", page.uri()),
            "session": "S.session",
            "static": "S.static",
            "params": {"_csrf_token": "Csrf-Tok3n", "_mounts": 0},
        })
    );

    let payload = json!({"type": "click", "event": "inc", "value": {"id": 3}, "cid": 1});
    let echoed = session.call("event", payload.clone()).await.unwrap();
    assert_eq!(echoed, json!({"echo": payload}));
    assert_matches!(next_seen(&mut seen).await, Seen::Frame(frame) if frame[3] == "event");

    assert!(session.leave());
    assert_eq!(session.state(), SessionState::Left);
    assert!(!session.leave());
    assert_matches!(next_seen(&mut seen).await, Seen::Frame(frame) if frame[3] == "phx_leave");
    assert_matches!(next_seen(&mut seen).await, Seen::Closed);

    assert_matches!(
        session.send("event", json!({})).await,
        Err(ChannelError::NotJoined { .. })
    );
}

#[tokio::test]
async fn page_without_liveview_fails_bootstrap() {
    let page = serve_page(ResponseTemplate::new(200).set_body_string("<html><body>hi</body></html>")).await;
    let mut session = session(&page, "ws://127.0.0.1:9/live/websocket");

    let err = session.connect().await.unwrap_err();
    assert_matches!(
        err,
        SessionError::Bootstrap(BootstrapError::MissingElement { .. })
    );
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn error_status_fails_bootstrap() {
    let page = serve_page(ResponseTemplate::new(503)).await;
    let mut session = session(&page, "ws://127.0.0.1:9/live/websocket");

    assert_matches!(
        session.connect().await,
        Err(SessionError::Bootstrap(BootstrapError::Status { status: 503, .. }))
    );
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn refused_socket_fails_connect() {
    let page = serve_page(ResponseTemplate::new(200).set_body_string(PAGE)).await;
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let mut session = session(&page, &format!("ws://127.0.0.1:{port}/live/websocket"));

    assert_matches!(
        session.connect().await,
        Err(SessionError::Channel(ChannelError::Connect { .. }))
    );
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn rejected_join_fails_session() {
    let page = serve_page(ResponseTemplate::new(200).set_body_string(PAGE)).await;
    let (socket_url, _seen) = serve_socket(Mode::RejectJoin).await;
    let mut session = session(&page, &socket_url);

    let err = timeout(TIMEOUT, session.connect()).await.unwrap().unwrap_err();
    assert_matches!(
        err,
        SessionError::Channel(ChannelError::JoinRejected { reason, .. }) if reason == json!({"reason": "stale"})
    );
    assert_eq!(session.state(), SessionState::Failed);
    assert!(!session.leave());
}

#[tokio::test]
async fn dropped_connection_turns_joined_into_failed() {
    let page = serve_page(ResponseTemplate::new(200).set_body_string(PAGE)).await;
    let (socket_url, mut seen) = serve_socket(Mode::DropAfterJoin).await;
    let mut session = session(&page, &socket_url);

    let _ = timeout(TIMEOUT, session.connect()).await.unwrap().unwrap();
    loop {
        if matches!(next_seen(&mut seen).await, Seen::Closed) {
            break;
        }
    }
    timeout(TIMEOUT, async {
        while session.state() != SessionState::Failed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let err = session.call("event", json!({})).await.unwrap_err();
    assert_matches!(err, SessionError::Channel(e) if e.is_connection_error());
    assert!(!session.leave());
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn server_closed_topic_turns_joined_into_failed() {
    let page = serve_page(ResponseTemplate::new(200).set_body_string(PAGE)).await;
    let (socket_url, _seen) = serve_socket(Mode::CloseTopicAfterJoin).await;
    let mut session = session(&page, &socket_url);

    let _ = timeout(TIMEOUT, session.connect()).await.unwrap().unwrap();
    timeout(TIMEOUT, async {
        while session.state() != SessionState::Failed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_matches!(
        session.call("event", json!({})).await,
        Err(SessionError::Channel(_))
    );
    assert!(!session.leave());
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn stalled_upgrade_fails_connect_within_timeout() {
    let page = serve_page(ResponseTemplate::new(200).set_body_string(PAGE)).await;
    // Accepts TCP but never answers the upgrade request.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _server = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    let endpoint = Endpoint::new(
        &format!("{}{PAGE_PATH}", page.uri()),
        &format!("ws://{addr}/live/websocket"),
    )
    .unwrap()
    .with_cookie("_tiki_key", "abc");
    let config = SessionConfig {
        connect_timeout: Duration::from_millis(200),
        ..SessionConfig::default()
    };
    let mut session = LiveSession::new(Arc::new(endpoint), config);

    let err = timeout(TIMEOUT, session.connect()).await.unwrap().unwrap_err();
    assert_matches!(err, SessionError::Channel(ChannelError::Connect { .. }));
    assert_eq!(session.state(), SessionState::Failed);
}
