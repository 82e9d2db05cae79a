use alm_core::{CollaboratorFiles, DEFAULT_PROGRESS_FILE, DEFAULT_TASKS_FILE};
use axum::{
    routing::{get, post},
    Router,
};
use broadcast::{Broadcaster, DEFAULT_CONNECTION_QUEUE};
use clap::Parser;
use process::ProcessRunner;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use watch::{WatchConfig, WatchRegistry, DEFAULT_DEBOUNCE, DEFAULT_SUBSCRIBER_QUEUE};

mod api;
mod broadcast;
mod process;
mod watch;

const DEFAULT_HUB_ADDR: &str = "127.0.0.1:7420";

#[derive(Clone, Debug)]
pub(crate) struct Config {
    addr: String,
    project_dir: PathBuf,
    projects_root: PathBuf,
    files: CollaboratorFiles,
    debounce: Duration,
    max_output_lines: Option<usize>,
    process_retention: Option<Duration>,
    watch_queue: usize,
    queue_capacity: usize,
    debug: bool,
    log_dir: String,
}

impl Config {
    #[cfg(test)]
    fn for_project(project_dir: PathBuf, projects_root: PathBuf) -> Self {
        Self {
            addr: DEFAULT_HUB_ADDR.to_string(),
            project_dir,
            projects_root,
            files: CollaboratorFiles::default(),
            debounce: Duration::from_millis(50),
            max_output_lines: None,
            process_retention: None,
            watch_queue: DEFAULT_SUBSCRIBER_QUEUE,
            queue_capacity: DEFAULT_CONNECTION_QUEUE,
            debug: false,
            log_dir: String::new(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "alm-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    project_dir: String,
    #[arg(long, default_value = "")]
    projects_root: String,
    #[arg(long, default_value = "")]
    tasks_file: String,
    #[arg(long, default_value = "")]
    progress_file: String,
    #[arg(long, default_value_t = DEFAULT_DEBOUNCE.as_millis() as u64)]
    debounce_ms: u64,
    #[arg(long, default_value_t = 0)]
    max_output_lines: usize,
    #[arg(long, default_value_t = 3600)]
    process_retention_secs: u64,
    #[arg(long, default_value_t = DEFAULT_CONNECTION_QUEUE)]
    queue_capacity: usize,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

pub(crate) struct HubState {
    config: Config,
    broadcaster: Broadcaster,
    runner: ProcessRunner,
    watch: WatchRegistry,
}

impl HubState {
    fn new(config: Config) -> Self {
        let watch = WatchRegistry::new(WatchConfig {
            files: config.files.clone(),
            debounce: config.debounce,
            queue_capacity: config.watch_queue,
        });
        let runner = ProcessRunner::new(config.max_output_lines);
        Self {
            broadcaster: Broadcaster::new(watch.clone(), runner.clone()),
            config,
            runner,
            watch,
        }
    }

    fn start_process_reaper(self: Arc<Self>) {
        let Some(retention) = self.config.process_retention else {
            return;
        };
        let interval = (retention / 4).clamp(Duration::from_secs(1), Duration::from_secs(300));
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = hub.runner.prune_exited(retention);
                if removed > 0 {
                    info!(
                        event = "process_reaped",
                        removed = removed,
                        watch_targets = hub.watch.target_count(),
                        connections = hub.broadcaster.active_connections()
                    );
                }
            }
        });
    }
}

/// Locks a registry mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[tokio::main]
async fn main() {
    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("alm-hub: {err}");
            std::process::exit(2);
        }
    };
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

    let hub = Arc::new(HubState::new(config.clone()));
    hub.clone().start_process_reaper();

    let app = router(hub.clone());
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        project_dir = %config.project_dir.display(),
        projects_root = %config.projects_root.display()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }
}

fn router(hub: Arc<HubState>) -> Router {
    Router::new()
        .route("/events", get(api::events))
        .route(
            "/processes",
            get(api::list_processes).post(api::spawn_process),
        )
        .route("/processes/:id", get(api::process_status))
        .route("/processes/:id/output", get(api::process_output))
        .route("/processes/:id/kill", post(api::kill_process))
        .route("/health", get(|| async { "ok" }))
        .with_state(hub)
}

fn load_config() -> io::Result<Config> {
    let args = Args::parse();
    let project_dir = resolve_project_dir(&args.project_dir)?;
    let projects_root = if args.projects_root.trim().is_empty() {
        project_dir
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| project_dir.clone())
    } else {
        PathBuf::from(args.projects_root.trim())
    };
    let files = CollaboratorFiles {
        tasks: resolve_file_name(&args.tasks_file, "ALM_TASKS_FILE", DEFAULT_TASKS_FILE),
        progress: resolve_file_name(&args.progress_file, "ALM_PROGRESS_FILE", DEFAULT_PROGRESS_FILE),
    };
    Ok(Config {
        addr: resolve_addr(&args.addr),
        project_dir,
        projects_root,
        files,
        debounce: Duration::from_millis(args.debounce_ms),
        max_output_lines: (args.max_output_lines > 0).then_some(args.max_output_lines),
        process_retention: (args.process_retention_secs > 0)
            .then(|| Duration::from_secs(args.process_retention_secs)),
        watch_queue: DEFAULT_SUBSCRIBER_QUEUE,
        queue_capacity: args.queue_capacity.max(1),
        debug: args.debug || env_true("ALM_HUB_DEBUG"),
        log_dir: resolve_log_dir(&args.log_dir),
    })
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

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let _ = lock_unpoisoned(file).write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let _ = lock_unpoisoned(file).flush();
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
    let path = dir.join(format!("alm-hub-{}.log", std::process::id()));
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
    env_value("ALM_HUB_ADDR").unwrap_or_else(|| DEFAULT_HUB_ADDR.to_string())
}

fn resolve_project_dir(flag: &str) -> io::Result<PathBuf> {
    let raw = if flag.trim().is_empty() {
        env_value("ALM_PROJECT_DIR")
    } else {
        Some(flag.trim().to_string())
    };
    let dir = match raw {
        Some(value) => PathBuf::from(value),
        None => std::env::current_dir()?,
    };
    let dir = std::fs::canonicalize(&dir)?;
    if !dir.is_dir() {
        warn!(event = "project_dir_invalid", dir = %dir.display());
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("project dir is not a directory: {}", dir.display()),
        ));
    }
    Ok(dir)
}

fn resolve_file_name(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    env_value(env_key).unwrap_or_else(|| default.to_string())
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
    fn explicit_flags_win_over_defaults() {
        assert_eq!(resolve_addr(" 127.0.0.1:9000 "), "127.0.0.1:9000");
        assert_eq!(resolve_file_name("todo.json", "ALM_TEST_UNSET_KEY", "tasks.json"), "todo.json");
        assert_eq!(resolve_file_name("", "ALM_TEST_UNSET_KEY", "tasks.json"), "tasks.json");
        assert_eq!(resolve_log_dir("/var/log/alm"), "/var/log/alm");
    }

    #[test]
    fn project_dir_must_exist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolved = resolve_project_dir(&dir.path().display().to_string()).expect("dir");
        assert!(resolved.is_absolute());
        assert!(resolve_project_dir(&dir.path().join("missing").display().to_string()).is_err());
    }

    #[test]
    fn poisoned_registry_lock_recovers() {
        let mutex = Arc::new(Mutex::new(1));
        let poisoner = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock();
            panic!("poison");
        })
        .join();
        assert!(mutex.is_poisoned());
        *lock_unpoisoned(&mutex) += 1;
        assert_eq!(*lock_unpoisoned(&mutex), 2);
    }
}
