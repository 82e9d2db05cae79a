use crate::session::{SessionError, SessionIo, SessionOptions, TerminalSession};
use alm_core::terminal_ipc::{parse_client_frame, ClientFrame, ServerFrame, DEFAULT_COLS, DEFAULT_ROWS};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{stream::SplitStream, SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_CONNECT_GRACE: Duration = Duration::from_secs(2);
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const OUTBOUND_QUEUE: usize = 256;

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub shell: String,
    pub default_cwd: PathBuf,
    pub connect_grace: Duration,
}

/// Registry entry describing a live terminal session.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

pub struct RelayState {
    config: RelayConfig,
    sessions: Mutex<HashMap<String, SessionInfo>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        lock(&self.sessions).values().cloned().collect()
    }

    fn register(&self, info: SessionInfo) {
        lock(&self.sessions).insert(info.id.clone(), info);
    }

    fn update_size(&self, id: &str, cols: u16, rows: u16) {
        if let Some(info) = lock(&self.sessions).get_mut(id) {
            info.cols = cols;
            info.rows = rows;
        }
    }

    fn unregister(&self, id: &str) {
        lock(&self.sessions).remove(id);
    }

    fn resolve_cwd(&self, hint: Option<&str>) -> PathBuf {
        match hint.map(str::trim).filter(|value| !value.is_empty()) {
            Some(value) if Path::new(value).is_dir() => PathBuf::from(value),
            Some(value) => {
                warn!(event = "cwd_hint_rejected", cwd = value);
                self.config.default_cwd.clone()
            }
            None => self.config.default_cwd.clone(),
        }
    }
}

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/terminal", get(terminal_handler))
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(relay): State<Arc<RelayState>>) -> impl IntoResponse {
    let sessions = relay.sessions();
    Json(json!({
        "status": "ok",
        "count": sessions.len(),
        "sessions": sessions,
    }))
}

async fn terminal_handler(
    ws: WebSocketUpgrade,
    State(relay): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        handle_socket(relay, socket).await;
    })
}

/// First frame of a connection: either an explicit connect, or something else that has
/// to be applied once a default session is open.
enum Opening {
    Connect {
        cwd: Option<String>,
        cols: Option<u16>,
        rows: Option<u16>,
        attempt: Option<u32>,
    },
    Default(Option<Inbound>),
    Closed,
}

enum Inbound {
    Frame(ClientFrame),
    Bytes(Vec<u8>),
    Invalid(String),
}

fn classify(msg: Message) -> Option<Result<Inbound, ()>> {
    match msg {
        Message::Text(text) => Some(Ok(match parse_client_frame(&text) {
            Ok(frame) => Inbound::Frame(frame),
            Err(err) => Inbound::Invalid(err),
        })),
        Message::Binary(bytes) => Some(Ok(Inbound::Bytes(bytes))),
        Message::Close(_) => Some(Err(())),
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

async fn await_opening(receiver: &mut SplitStream<WebSocket>, grace: Duration) -> Opening {
    let deadline = Instant::now() + grace;
    loop {
        let next = match tokio::time::timeout_at(deadline, receiver.next()).await {
            Ok(next) => next,
            Err(_) => return Opening::Default(None),
        };
        let msg = match next {
            Some(Ok(msg)) => msg,
            _ => return Opening::Closed,
        };
        match classify(msg) {
            None => continue,
            Some(Err(())) => return Opening::Closed,
            Some(Ok(Inbound::Frame(ClientFrame::Connect {
                cwd,
                cols,
                rows,
                attempt,
            }))) => {
                return Opening::Connect {
                    cwd,
                    cols,
                    rows,
                    attempt,
                }
            }
            Some(Ok(other)) => return Opening::Default(Some(other)),
        }
    }
}

async fn handle_socket(relay: Arc<RelayState>, socket: WebSocket) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                return;
            }
        }
    });

    let (cwd, cols, rows, attempt, pending) =
        match await_opening(&mut ws_receiver, relay.config.connect_grace).await {
            Opening::Connect {
                cwd,
                cols,
                rows,
                attempt,
            } => (cwd, cols, rows, attempt.unwrap_or(0), None),
            Opening::Default(pending) => (None, None, None, 0, pending),
            Opening::Closed => {
                debug!(event = "closed_before_connect");
                drop(tx);
                let _ = write_task.await;
                return;
            }
        };

    let session_id = uuid::Uuid::new_v4().to_string();
    let options = SessionOptions {
        shell: relay.config.shell.clone(),
        cwd: relay.resolve_cwd(cwd.as_deref()),
        cols: cols.unwrap_or(DEFAULT_COLS).max(1),
        rows: rows.unwrap_or(DEFAULT_ROWS).max(1),
    };
    let (session, io) = match TerminalSession::open(session_id.clone(), &options) {
        Ok(value) => value,
        Err(err) => {
            warn!(event = "session_open_failed", error = %err);
            send_frame(&tx, ServerFrame::Error {
                message: err.to_string(),
            })
            .await;
            close(&tx, "session_open_failed").await;
            drop(tx);
            let _ = write_task.await;
            return;
        }
    };

    relay.register(SessionInfo {
        id: session_id.clone(),
        pid: session.pid(),
        cols: options.cols,
        rows: options.rows,
        attempt,
        started_at: Utc::now(),
    });
    info!(
        event = "session_open",
        session_id = %session_id,
        pid = ?session.pid(),
        cwd = %options.cwd.display(),
        attempt = attempt,
        live = relay.session_count()
    );
    send_frame(&tx, ServerFrame::Ready {
        session_id: session_id.clone(),
        pid: session.pid(),
    })
    .await;

    let reason = run_session(&relay, &session, io, &mut ws_receiver, &tx, pending).await;

    if reason != "shell_exit" {
        session.kill();
    }
    relay.unregister(&session_id);
    info!(event = "session_closed", session_id = %session_id, reason = reason);
    drop(tx);
    let _ = write_task.await;
}

async fn run_session(
    relay: &RelayState,
    session: &TerminalSession,
    mut io: SessionIo,
    receiver: &mut SplitStream<WebSocket>,
    tx: &mpsc::Sender<Message>,
    pending: Option<Inbound>,
) -> &'static str {
    if let Some(inbound) = pending {
        if let Err(err) = apply_inbound(relay, session, inbound, tx).await {
            return fail(session, tx, err).await;
        }
    }

    let mut output_open = true;
    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    Some(Err(err)) => {
                        debug!(event = "read_error", session_id = %session.id(), error = %err);
                        return "client_error";
                    }
                    None => return "client_closed",
                };
                let inbound = match classify(msg) {
                    None => continue,
                    Some(Err(())) => return "client_closed",
                    Some(Ok(inbound)) => inbound,
                };
                if let Err(err) = apply_inbound(relay, session, inbound, tx).await {
                    return fail(session, tx, err).await;
                }
            }
            chunk = io.output.recv(), if output_open => match chunk {
                Some(data) => {
                    if !send_frame(tx, ServerFrame::Output { data }).await {
                        return "client_gone";
                    }
                }
                None => output_open = false,
            },
            code = &mut io.exit => {
                let code = code.unwrap_or(1);
                if output_open {
                    drain_output(&mut io.output, tx).await;
                }
                send_frame(tx, ServerFrame::Exit { code }).await;
                close(tx, "shell_exit").await;
                info!(event = "shell_exit", session_id = %session.id(), code = code);
                return "shell_exit";
            }
        }
    }
}

async fn apply_inbound(
    relay: &RelayState,
    session: &TerminalSession,
    inbound: Inbound,
    tx: &mpsc::Sender<Message>,
) -> Result<(), SessionError> {
    match inbound {
        Inbound::Bytes(bytes) => session.write(&bytes),
        Inbound::Frame(ClientFrame::Input { data }) => session.write(data.as_bytes()),
        Inbound::Frame(ClientFrame::Resize { cols, rows }) => {
            let (cols, rows) = session.resize(cols, rows)?;
            relay.update_size(session.id(), cols, rows);
            debug!(event = "session_resize", session_id = %session.id(), cols = cols, rows = rows);
            Ok(())
        }
        Inbound::Frame(ClientFrame::Connect { .. }) => {
            debug!(event = "duplicate_connect", session_id = %session.id());
            Ok(())
        }
        Inbound::Invalid(err) => {
            send_frame(tx, ServerFrame::Error {
                message: format!("invalid frame: {err}"),
            })
            .await;
            Ok(())
        }
    }
}

async fn fail(session: &TerminalSession, tx: &mpsc::Sender<Message>, err: SessionError) -> &'static str {
    warn!(event = "session_error", session_id = %session.id(), error = %err);
    send_frame(tx, ServerFrame::Error {
        message: err.to_string(),
    })
    .await;
    close(tx, "session_error").await;
    "session_error"
}

async fn drain_output(output: &mut mpsc::UnboundedReceiver<String>, tx: &mpsc::Sender<Message>) {
    let deadline = Instant::now() + EXIT_DRAIN_TIMEOUT;
    while let Ok(Some(data)) = tokio::time::timeout_at(deadline, output.recv()).await {
        if !send_frame(tx, ServerFrame::Output { data }).await {
            return;
        }
    }
}

async fn send_frame(tx: &mpsc::Sender<Message>, frame: ServerFrame) -> bool {
    tx.send(Message::Text(frame.to_text())).await.is_ok()
}

async fn close(tx: &mpsc::Sender<Message>, reason: &str) {
    let _ = tx
        .send(Message::Close(Some(CloseFrame {
            code: 1000,
            reason: reason.to_string().into(),
        })))
        .await;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn start(grace: Duration, default_cwd: &Path) -> (String, Arc<RelayState>) {
        let state = Arc::new(RelayState::new(RelayConfig {
            shell: "/bin/sh".to_string(),
            default_cwd: default_cwd.to_path_buf(),
            connect_grace: grace,
        }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = router(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("ws://{addr}/terminal"), state)
    }

    async fn connect(url: &str) -> Client {
        let (ws, _) = connect_async(url).await.expect("connect");
        ws
    }

    async fn send(ws: &mut Client, frame: &ClientFrame) {
        let text = serde_json::to_string(frame).expect("frame");
        ws.send(WsMessage::Text(text)).await.expect("send");
    }

    async fn recv(ws: &mut Client) -> ServerFrame {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
                .await
                .expect("frame timeout")
                .expect("stream open")
                .expect("frame");
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(&text).expect("server frame");
            }
        }
    }

    async fn expect_ready(ws: &mut Client) -> String {
        match recv(ws).await {
            ServerFrame::Ready { session_id, pid } => {
                assert!(pid.is_some());
                session_id
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    async fn output_until(ws: &mut Client, needle: &str) -> String {
        let mut seen = String::new();
        while !seen.contains(needle) {
            match recv(ws).await {
                ServerFrame::Output { data } => seen.push_str(&data),
                other => panic!("unexpected frame {other:?}"),
            }
        }
        seen
    }

    fn connect_frame(cwd: &Path) -> ClientFrame {
        ClientFrame::Connect {
            cwd: Some(cwd.display().to_string()),
            cols: Some(80),
            rows: Some(24),
            attempt: Some(1),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resize_applies_before_next_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (url, state) = start(DEFAULT_CONNECT_GRACE, dir.path()).await;
        let mut ws = connect(&url).await;
        send(&mut ws, &connect_frame(dir.path())).await;
        let session_id = expect_ready(&mut ws).await;

        send(&mut ws, &ClientFrame::Resize { cols: 120, rows: 40 }).await;
        send(
            &mut ws,
            &ClientFrame::Input {
                data: "stty size\n".to_string(),
            },
        )
        .await;
        output_until(&mut ws, "40 120").await;

        let info = state
            .sessions()
            .into_iter()
            .find(|info| info.id == session_id)
            .expect("session registered");
        assert_eq!((info.cols, info.rows, info.attempt), (120, 40, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shell_exit_sends_code_and_unregisters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (url, state) = start(DEFAULT_CONNECT_GRACE, dir.path()).await;
        let mut ws = connect(&url).await;
        send(&mut ws, &connect_frame(dir.path())).await;
        expect_ready(&mut ws).await;
        assert_eq!(state.session_count(), 1);

        ws.send(WsMessage::Binary(b"exit 3\n".to_vec()))
            .await
            .expect("send");
        loop {
            match recv(&mut ws).await {
                ServerFrame::Output { .. } => continue,
                ServerFrame::Exit { code } => {
                    assert_eq!(code, 3);
                    break;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        for _ in 0..200 {
            if state.session_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(state.session_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silent_client_gets_default_session_after_grace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (url, _state) = start(Duration::from_millis(200), dir.path()).await;
        let mut ws = connect(&url).await;
        expect_ready(&mut ws).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn input_before_connect_opens_default_session_and_applies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (url, _state) = start(DEFAULT_CONNECT_GRACE, dir.path()).await;
        let mut ws = connect(&url).await;
        send(
            &mut ws,
            &ClientFrame::Input {
                data: "echo $((40+2))\n".to_string(),
            },
        )
        .await;
        expect_ready(&mut ws).await;
        output_until(&mut ws, "42").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn client_disconnect_kills_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (url, state) = start(DEFAULT_CONNECT_GRACE, dir.path()).await;
        let mut ws = connect(&url).await;
        send(&mut ws, &connect_frame(dir.path())).await;
        expect_ready(&mut ws).await;
        assert_eq!(state.session_count(), 1);

        ws.close(None).await.expect("close");
        drop(ws);
        for _ in 0..200 {
            if state.session_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(state.session_count(), 0);
    }

    #[test]
    fn cwd_hint_falls_back_to_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = RelayState::new(RelayConfig {
            shell: "/bin/sh".to_string(),
            default_cwd: dir.path().to_path_buf(),
            connect_grace: DEFAULT_CONNECT_GRACE,
        });
        assert_eq!(state.resolve_cwd(None), dir.path());
        assert_eq!(state.resolve_cwd(Some("/definitely/not/here")), dir.path());
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).expect("sub");
        assert_eq!(state.resolve_cwd(Some(&sub.display().to_string())), sub);
    }
}
