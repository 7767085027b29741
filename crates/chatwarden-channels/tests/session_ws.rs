//! Drives `TwitchSession::run` against a local WebSocket chat server.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chatwarden_channels::twitch::{StaticTokenProvider, TokenProvider, TwitchSession};
use chatwarden_core::pipeline::PipelineStats;
use chatwarden_types::config::TwitchConfig;
use chatwarden_types::event::ChatMessage;
use chatwarden_types::secret::SecretString;
use chatwarden_types::{TransportError, WardenError};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

type Ws = WebSocketStream<TcpStream>;

const WAIT: Duration = Duration::from_secs(10);

/// Serves `first` until refreshed, then `second`.
struct RotatingProvider {
    current: Mutex<String>,
    refreshes: AtomicU32,
}

impl RotatingProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new("first".into()),
            refreshes: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl TokenProvider for RotatingProvider {
    async fn access_token(&self) -> Result<SecretString, TransportError> {
        Ok(self.current.lock().clone().into())
    }

    async fn refresh(&self, rejected: &SecretString) -> Result<SecretString, TransportError> {
        assert_eq!(rejected.expose(), "first");
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        *self.current.lock() = "second".into();
        Ok("second".into())
    }
}

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

/// Accept one client and read its four login lines.
async fn accept(listener: &TcpListener) -> (Ws, Vec<String>) {
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    let mut login = Vec::new();
    while login.len() < 4 {
        if let Message::Text(line) = ws.next().await.unwrap().unwrap() {
            login.push(line);
        }
    }
    (ws, login)
}

async fn say(ws: &mut Ws, line: &str) {
    ws.send(Message::Text(format!("{line}\r\n"))).await.unwrap();
}

async fn welcome(ws: &mut Ws) {
    say(ws, ":tmi.twitch.tv 001 warden :Welcome, GLHF!").await;
}

fn privmsg(id: &str, user: &str, text: &str) -> String {
    format!(
        "@id={id};user-id=7;tmi-sent-ts=1700000000000 \
         :{user}!{user}@{user}.tmi.twitch.tv PRIVMSG #somechannel :{text}"
    )
}

/// Read until the client goes away; true if it sent a close frame first.
async fn closed_by_client(ws: &mut Ws) -> bool {
    loop {
        match ws.next().await {
            Some(Ok(Message::Close(_))) => return true,
            Some(Ok(_)) => continue,
            _ => return false,
        }
    }
}

fn config(url: &str) -> TwitchConfig {
    TwitchConfig {
        channel: "somechannel".into(),
        nick: "warden".into(),
        client_id: "cid".into(),
        irc_url: url.into(),
        reconnect_base_ms: 10,
        reconnect_max_ms: 50,
        ..Default::default()
    }
}

async fn next(rx: &mut mpsc::Receiver<ChatMessage>) -> ChatMessage {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no chat message in time")
        .expect("inbound closed")
}

#[tokio::test]
async fn session_survives_drops_reconnect_requests_and_refused_logins() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        // Socket dies after one message.
        let (mut ws, login) = accept(&listener).await;
        assert_eq!(login[1], "PASS oauth:first");
        assert_eq!(login[3], "JOIN #somechannel");
        welcome(&mut ws).await;
        say(&mut ws, &privmsg("m1", "viewer", "one")).await;
        drop(ws);

        // Server asks for a reconnect; the client closes cleanly.
        let (mut ws, _) = accept(&listener).await;
        welcome(&mut ws).await;
        say(&mut ws, &privmsg("m2", "viewer", "two")).await;
        say(&mut ws, ":tmi.twitch.tv RECONNECT").await;
        assert!(closed_by_client(&mut ws).await);

        // Login refused.
        let (mut ws, login) = accept(&listener).await;
        assert_eq!(login[1], "PASS oauth:first");
        say(&mut ws, ":tmi.twitch.tv NOTICE * :Login authentication failed").await;
        closed_by_client(&mut ws).await;

        // The refreshed token is used.
        let (mut ws, login) = accept(&listener).await;
        assert_eq!(login[1], "PASS oauth:second");
        welcome(&mut ws).await;
        say(&mut ws, &privmsg("m3", "viewer", "three")).await;
        closed_by_client(&mut ws).await;
    });

    let auth = RotatingProvider::new();
    let session = Arc::new(TwitchSession::new(config(&url), auth.clone()));
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let run = {
        let session = session.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            session
                .run(tx, Arc::new(PipelineStats::default()), cancel)
                .await
        })
    };

    assert_eq!(next(&mut rx).await.id, "m1");
    assert_eq!(next(&mut rx).await.id, "m2");
    let third = next(&mut rx).await;
    assert_eq!(third.id, "m3");
    assert_eq!(third.user, "viewer");
    assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);

    cancel.cancel();
    let result = tokio::time::timeout(WAIT, run).await.unwrap().unwrap();
    assert!(result.is_ok());
    tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn unrefreshable_login_failure_ends_the_session() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let (mut ws, _) = accept(&listener).await;
        say(&mut ws, ":tmi.twitch.tv NOTICE * :Login authentication failed").await;
        closed_by_client(&mut ws).await;
    });

    let session = TwitchSession::new(
        config(&url),
        Arc::new(StaticTokenProvider::new("stale".into())),
    );
    let (tx, _rx) = mpsc::channel(4);
    let result = tokio::time::timeout(
        WAIT,
        session.run(tx, Arc::new(PipelineStats::default()), CancellationToken::new()),
    )
    .await
    .unwrap();

    assert!(matches!(
        result,
        Err(WardenError::Transport(TransportError::AuthExpired(_)))
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn full_pipeline_queue_sheds_messages_and_keeps_answering_pings() {
    let (listener, url) = listen().await;
    let (ponged_tx, ponged) = oneshot::channel();
    let server = tokio::spawn(async move {
        let (mut ws, _) = accept(&listener).await;
        welcome(&mut ws).await;
        for id in ["a", "b", "c"] {
            say(&mut ws, &privmsg(id, "viewer", "spam")).await;
        }
        say(&mut ws, "PING :tmi.twitch.tv").await;
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(line))) if line.starts_with("PONG") => {
                    let _ = ponged_tx.send(line);
                    break;
                }
                Some(Ok(_)) => continue,
                other => panic!("client went away without answering PING: {other:?}"),
            }
        }
        closed_by_client(&mut ws).await;
    });

    let session = Arc::new(TwitchSession::new(
        config(&url),
        Arc::new(StaticTokenProvider::new("tok".into())),
    ));
    let stats = Arc::new(PipelineStats::default());
    // Room for one message, and nobody reading.
    let (tx, mut rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    let run = {
        let session = session.clone();
        let stats = stats.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { session.run(tx, stats, cancel).await })
    };

    let pong = tokio::time::timeout(WAIT, ponged).await.unwrap().unwrap();
    assert_eq!(pong, "PONG :tmi.twitch.tv");

    let report = stats.report();
    assert_eq!(report.received, 2);
    assert_eq!(report.not_moderated, 2);
    assert_eq!(report.not_moderated_sample, vec!["b", "c"]);

    cancel.cancel();
    tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(rx.recv().await.unwrap().id, "a");
}
