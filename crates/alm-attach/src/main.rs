use alm_core::{
    reconnect::{ReconnectPolicy, DEFAULT_MAX_ATTEMPTS},
    terminal_ipc::{ClientFrame, ServerFrame, DEFAULT_COLS, DEFAULT_ROWS},
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use futures_util::{SinkExt, StreamExt};
use std::{
    fs::OpenOptions,
    io::{self, Read, Write},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use url::Url;

const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:7421/terminal";
const RESIZE_POLL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "alm-attach")]
struct Args {
    #[arg(long, default_value = "")]
    url: String,
    #[arg(long, default_value = "")]
    cwd: String,
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[derive(Clone, Debug)]
struct Config {
    url: Url,
    cwd: Option<String>,
    policy: ReconnectPolicy,
    log_dir: String,
}

/// How one relay connection ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Exit(i32),
    Dropped { ready: bool },
}

/// Puts the local terminal in raw mode for as long as it is alive.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        enable_raw_mode().context("enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    let _log_guard = init_logging(&config);
    info!(event = "attach_start", url = %config.url, max_attempts = config.policy.max_attempts);

    let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    std::thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buffer = [0u8; 4096];
        loop {
            let read = match stdin.read(&mut buffer) {
                Ok(0) => break,
                Ok(count) => count,
                Err(_) => break,
            };
            if stdin_tx.send(buffer[..read].to_vec()).is_err() {
                break;
            }
        }
    });

    let raw_mode = RawModeGuard::enable()?;
    let code = run(&config, &mut stdin_rx).await;
    drop(raw_mode);
    info!(event = "attach_exit", code = code);
    std::process::exit(code);
}

async fn run(config: &Config, stdin_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> i32 {
    let mut backoff = config.policy.start();
    let mut attempt = 0;
    loop {
        let end = match run_session(config, attempt, stdin_rx).await {
            Ok(end) => end,
            Err(err) => {
                warn!(event = "relay_connect_error", attempt = attempt, error = %err);
                SessionEnd::Dropped { ready: false }
            }
        };
        match end {
            SessionEnd::Exit(code) => return code,
            SessionEnd::Dropped { ready } => {
                if ready {
                    backoff.reset();
                }
                match backoff.next_attempt() {
                    Some((next, delay)) => {
                        status_line(&reconnect_message(next, backoff.max_attempts()));
                        tokio::time::sleep(delay).await;
                        attempt = next;
                    }
                    None => {
                        status_line(&format!(
                            "giving up after {} attempts",
                            backoff.max_attempts()
                        ));
                        return 1;
                    }
                }
            }
        }
    }
}

async fn run_session(
    config: &Config,
    attempt: u32,
    stdin_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<SessionEnd> {
    let (mut ws, _) = connect_async(config.url.as_str())
        .await
        .context("relay connect")?;
    let mut size = terminal_size();
    let hello = connect_frame(config.cwd.clone(), size, attempt);
    ws.send(Message::Text(serde_json::to_string(&hello)?))
        .await
        .context("send connect")?;

    let mut ready = false;
    let mut stdout = io::stdout();
    let mut ticker = tokio::time::interval(RESIZE_POLL);
    loop {
        tokio::select! {
            incoming = ws.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    Some(Err(err)) => {
                        debug!(event = "relay_read_error", error = %err);
                        return Ok(SessionEnd::Dropped { ready });
                    }
                    None => return Ok(SessionEnd::Dropped { ready }),
                };
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => return Ok(SessionEnd::Dropped { ready }),
                    _ => continue,
                };
                let frame: ServerFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(event = "relay_frame_invalid", error = %err);
                        continue;
                    }
                };
                match frame {
                    ServerFrame::Ready { session_id, pid } => {
                        ready = true;
                        info!(event = "session_ready", session_id = %session_id, pid = ?pid, attempt = attempt);
                    }
                    ServerFrame::Output { data } => {
                        let _ = stdout.write_all(data.as_bytes());
                        let _ = stdout.flush();
                    }
                    ServerFrame::Error { message } => {
                        warn!(event = "relay_error", message = %message);
                        status_line(&format!("relay error: {message}"));
                    }
                    ServerFrame::Exit { code } => {
                        let _ = ws.close(None).await;
                        return Ok(SessionEnd::Exit(code));
                    }
                }
            }
            input = stdin_rx.recv() => {
                let Some(bytes) = input else {
                    let _ = ws.close(None).await;
                    return Ok(SessionEnd::Exit(0));
                };
                if ws.send(Message::Binary(bytes)).await.is_err() {
                    return Ok(SessionEnd::Dropped { ready });
                }
            }
            _ = ticker.tick() => {
                let current = terminal_size();
                if current != size {
                    size = current;
                    let frame = ClientFrame::Resize { cols: size.0, rows: size.1 };
                    if ws.send(Message::Text(serde_json::to_string(&frame)?)).await.is_err() {
                        return Ok(SessionEnd::Dropped { ready });
                    }
                }
            }
        }
    }
}

fn connect_frame(cwd: Option<String>, size: (u16, u16), attempt: u32) -> ClientFrame {
    ClientFrame::Connect {
        cwd,
        cols: Some(size.0),
        rows: Some(size.1),
        attempt: (attempt > 0).then_some(attempt),
    }
}

fn terminal_size() -> (u16, u16) {
    crossterm::terminal::size().unwrap_or((DEFAULT_COLS, DEFAULT_ROWS))
}

fn reconnect_message(attempt: u32, max_attempts: u32) -> String {
    format!("reconnecting (attempt {attempt}/{max_attempts})")
}

fn status_line(message: &str) {
    let mut stderr = io::stderr();
    let _ = write!(stderr, "\r\n[alm-attach] {message}\r\n");
    let _ = stderr.flush();
}

fn load_config() -> Result<Config> {
    let args = Args::parse();
    let url = normalize_url(&resolve_url(&args.url))?;
    let cwd = if args.cwd.trim().is_empty() {
        std::env::current_dir()
            .ok()
            .map(|dir| dir.display().to_string())
    } else {
        Some(args.cwd.trim().to_string())
    };
    Ok(Config {
        url,
        cwd,
        policy: ReconnectPolicy {
            max_attempts: args.max_attempts,
            ..ReconnectPolicy::default()
        },
        log_dir: resolve_log_dir(&args.log_dir),
    })
}

fn resolve_url(url_flag: &str) -> String {
    if !url_flag.trim().is_empty() {
        return url_flag.trim().to_string();
    }
    match std::env::var("ALM_RELAY_URL") {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => DEFAULT_RELAY_URL.to_string(),
    }
}

/// Accepts `ws`/`wss` URLs as-is and maps `http`/`https` onto them.
fn normalize_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).with_context(|| format!("invalid relay url: {raw}"))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => bail!("unsupported relay url scheme: {other}"),
    };
    if url.set_scheme(scheme).is_err() {
        bail!("cannot rewrite relay url scheme: {raw}");
    }
    Ok(url)
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    match std::env::var("ALM_LOG_DIR") {
        Ok(value) if !value.trim().is_empty() => value,
        _ => ".alm/logs".to_string(),
    }
}

struct LogGuard {
    _file: Arc<Mutex<std::fs::File>>,
}

struct FileWriter {
    file: Arc<Mutex<std::fs::File>>,
}

fn lock_file(file: &Mutex<std::fs::File>) -> MutexGuard<'_, std::fs::File> {
    file.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = lock_file(&self.file).write_all(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        lock_file(&self.file).flush()
    }
}

/// Logs go to a file only: stdout belongs to the remote terminal.
fn init_logging(config: &Config) -> Option<LogGuard> {
    if config.log_dir.trim().is_empty() {
        return None;
    }
    let dir = PathBuf::from(&config.log_dir);
    std::fs::create_dir_all(&dir).ok()?;
    let path = dir.join(format!("alm-attach-{}.log", std::process::id()));
    let file = OpenOptions::new().create(true).append(true).open(path).ok()?;
    let file = Arc::new(Mutex::new(file));

    let level = std::env::var("ALM_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer_file = file.clone();
    let make_writer = BoxMakeWriter::new(move || FileWriter {
        file: writer_file.clone(),
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;
    Some(LogGuard { _file: file })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_omits_attempt_counter() {
        let frame = connect_frame(Some("/tmp".to_string()), (100, 30), 0);
        assert_eq!(
            frame,
            ClientFrame::Connect {
                cwd: Some("/tmp".to_string()),
                cols: Some(100),
                rows: Some(30),
                attempt: None,
            }
        );
        let value = serde_json::to_value(connect_frame(None, (80, 24), 3)).expect("json");
        assert_eq!(value["type"], "connect");
        assert_eq!(value["attempt"], 3);
    }

    #[test]
    fn reconnect_message_names_attempt_and_limit() {
        assert_eq!(reconnect_message(2, 5), "reconnecting (attempt 2/5)");
    }

    #[test]
    fn http_urls_map_to_websocket_schemes() {
        assert_eq!(
            normalize_url("http://127.0.0.1:7421/terminal")
                .expect("url")
                .as_str(),
            "ws://127.0.0.1:7421/terminal"
        );
        assert_eq!(
            normalize_url("wss://relay.local/terminal").expect("url").scheme(),
            "wss"
        );
        assert!(normalize_url("ftp://relay.local").is_err());
        assert!(normalize_url("not a url").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unreachable_relay_gives_up_after_max_attempts() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let config = Config {
            url: normalize_url(&format!("ws://{addr}/terminal")).expect("url"),
            cwd: None,
            policy: ReconnectPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
            },
            log_dir: String::new(),
        };
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let code = tokio::time::timeout(Duration::from_secs(10), run(&config, &mut rx))
            .await
            .expect("gave up in time");
        assert_eq!(code, 1);
    }
}
