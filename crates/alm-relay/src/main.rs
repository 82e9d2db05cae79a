use clap::Parser;
use relay::{RelayConfig, RelayState, DEFAULT_CONNECT_GRACE};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

mod relay;
mod session;

const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:7421";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    shell: String,
    cwd: PathBuf,
    connect_grace: Duration,
    debug: bool,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "alm-relay")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    shell: String,
    #[arg(long, default_value = "")]
    cwd: String,
    #[arg(long, default_value_t = DEFAULT_CONNECT_GRACE.as_millis() as u64)]
    connect_grace_ms: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %config.addr);
        return;
    }

    let state = Arc::new(RelayState::new(RelayConfig {
        shell: config.shell.clone(),
        default_cwd: config.cwd.clone(),
        connect_grace: config.connect_grace,
    }));
    let app = relay::router(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "relay_error", error = %err);
            return;
        }
    };

    info!(
        event = "relay_start",
        addr = %config.addr,
        shell = %config.shell,
        cwd = %config.cwd.display()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "relay_error", error = %err);
    }
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_addr(&args.addr),
        shell: resolve_shell(&args.shell),
        cwd: resolve_cwd(&args.cwd),
        connect_grace: Duration::from_millis(args.connect_grace_ms),
        debug: args.debug || env_true("ALM_RELAY_DEBUG"),
        log_dir: resolve_log_dir(&args.log_dir),
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("ALM_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

fn lock_file(file: &Mutex<std::fs::File>) -> MutexGuard<'_, std::fs::File> {
    file.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let _ = lock_file(file).write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let _ = lock_file(file).flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let path = dir.join(format!("alm-relay-{}.log", std::process::id()));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.trim().to_string();
    }
    env_value("ALM_RELAY_ADDR").unwrap_or_else(|| DEFAULT_RELAY_ADDR.to_string())
}

fn resolve_shell(shell_flag: &str) -> String {
    if !shell_flag.trim().is_empty() {
        return shell_flag.trim().to_string();
    }
    env_value("ALM_SHELL")
        .or_else(|| env_value("SHELL"))
        .unwrap_or_else(default_shell)
}

#[cfg(not(windows))]
fn default_shell() -> String {
    "/bin/sh".to_string()
}

#[cfg(windows)]
fn default_shell() -> String {
    env_value("COMSPEC").unwrap_or_else(|| "cmd.exe".to_string())
}

fn resolve_cwd(cwd_flag: &str) -> PathBuf {
    let raw = if cwd_flag.trim().is_empty() {
        env_value("ALM_RELAY_CWD")
    } else {
        Some(cwd_flag.trim().to_string())
    };
    raw.map(PathBuf::from)
        .filter(|dir| dir.is_dir())
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    env_value("ALM_LOG_DIR").unwrap_or_else(|| ".alm/logs".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_take_precedence() {
        assert_eq!(resolve_addr("127.0.0.1:9999"), "127.0.0.1:9999");
        assert_eq!(resolve_shell(" /bin/bash "), "/bin/bash");
        assert_eq!(resolve_log_dir("logs"), "logs");
    }

    #[test]
    fn missing_cwd_falls_back_to_current_dir() {
        let resolved = resolve_cwd("/definitely/not/here");
        assert!(resolved.is_dir());
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(resolve_cwd(&dir.path().display().to_string()), dir.path());
    }
}
