//! Spawned command tracking: output buffering, fan-out listeners and exit notification.

use crate::lock_unpoisoned;
use alm_core::{
    event_ipc::{OutputLine, OutputStream, ProcessState, ProcessStatus},
    now_ms,
    terminal_ipc::Utf8Carry,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    io,
    panic::{catch_unwind, AssertUnwindSafe},
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    sync::{mpsc, oneshot},
};
use tracing::{debug, info, warn};

const READ_CHUNK_BYTES: usize = 8192;
/// Upper bound on collecting output after the shell exits. Background children that
/// inherited the pipes may keep them open indefinitely.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

type OutputListener = Arc<dyn Fn(&OutputLine) + Send + Sync>;
type ExitListener = Arc<dyn Fn(Option<i32>) + Send + Sync>;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("empty command")]
    EmptyCommand,
    #[error("working directory does not exist: {0}")]
    InvalidCwd(PathBuf),
    #[error("spawn failed: {0}")]
    Spawn(#[from] io::Error),
    #[error("process not found: {0}")]
    NotFound(String),
    #[error("process already exited: {0}")]
    AlreadyExited(String),
}

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSummary {
    pub id: String,
    pub command: String,
    pub cwd: String,
    pub pid: Option<u32>,
    pub state: ProcessState,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub line_count: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ListenerKind {
    Output,
    Exit,
}

struct HandleState {
    state: ProcessState,
    exit_code: Option<i32>,
    exited_at: Option<Instant>,
    lines: VecDeque<OutputLine>,
    next_seq: u64,
    last_timestamp: i64,
    next_listener_id: u64,
    output_listeners: Vec<(u64, OutputListener)>,
    exit_listeners: Vec<(u64, ExitListener)>,
}

pub struct ProcessHandle {
    id: String,
    command: String,
    cwd: PathBuf,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    max_lines: Option<usize>,
    state: Mutex<HandleState>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessHandle {
    fn status(&self) -> ProcessStatus {
        let state = lock_unpoisoned(&self.state);
        ProcessStatus {
            state: state.state,
            exit_code: state.exit_code,
        }
    }

    fn snapshot(&self) -> Vec<OutputLine> {
        lock_unpoisoned(&self.state).lines.iter().cloned().collect()
    }

    fn summary(&self) -> ProcessSummary {
        let state = lock_unpoisoned(&self.state);
        ProcessSummary {
            id: self.id.clone(),
            command: self.command.clone(),
            cwd: self.cwd.display().to_string(),
            pid: self.pid,
            state: state.state,
            exit_code: state.exit_code,
            started_at: self.started_at,
            line_count: state.lines.len(),
        }
    }

    fn add_output_listener(&self, listener: OutputListener) -> u64 {
        let mut state = lock_unpoisoned(&self.state);
        state.next_listener_id += 1;
        let id = state.next_listener_id;
        state.output_listeners.push((id, listener));
        id
    }

    /// Fails with the recorded exit code when the process has already exited; the caller
    /// then fires the listener itself.
    fn add_exit_listener(&self, listener: ExitListener) -> Result<u64, Option<i32>> {
        let mut state = lock_unpoisoned(&self.state);
        if state.state == ProcessState::Exited {
            return Err(state.exit_code);
        }
        state.next_listener_id += 1;
        let id = state.next_listener_id;
        state.exit_listeners.push((id, listener));
        Ok(id)
    }

    fn remove_listener(&self, kind: ListenerKind, listener_id: u64) {
        let mut state = lock_unpoisoned(&self.state);
        match kind {
            ListenerKind::Output => state.output_listeners.retain(|(id, _)| *id != listener_id),
            ListenerKind::Exit => state.exit_listeners.retain(|(id, _)| *id != listener_id),
        }
    }

    fn listener_counts(&self) -> (usize, usize) {
        let state = lock_unpoisoned(&self.state);
        (state.output_listeners.len(), state.exit_listeners.len())
    }

    /// Appends one decoded chunk and dispatches the resulting lines. Only the pump task
    /// calls this, so dispatch order equals append order.
    fn publish(&self, stream: OutputStream, chunk: &str) {
        let (appended, listeners) = {
            let mut state = lock_unpoisoned(&self.state);
            let mut appended = Vec::new();
            for text in split_chunk(chunk) {
                let timestamp = now_ms().max(state.last_timestamp);
                state.last_timestamp = timestamp;
                state.next_seq += 1;
                let line = OutputLine {
                    seq: state.next_seq,
                    stream,
                    text,
                    timestamp,
                };
                state.lines.push_back(line.clone());
                appended.push(line);
            }
            if let Some(max) = self.max_lines {
                while state.lines.len() > max {
                    state.lines.pop_front();
                }
            }
            (appended, state.output_listeners.clone())
        };

        let mut failed = Vec::new();
        for line in &appended {
            for (listener_id, listener) in &listeners {
                if failed.contains(listener_id) {
                    continue;
                }
                if catch_unwind(AssertUnwindSafe(|| listener(line))).is_err() {
                    warn!(event = "output_listener_panicked", id = %self.id, listener = listener_id);
                    failed.push(*listener_id);
                }
            }
        }
        for listener_id in failed {
            self.remove_listener(ListenerKind::Output, listener_id);
        }
    }

    fn finish(&self, exit_code: Option<i32>) {
        let listeners = {
            let mut state = lock_unpoisoned(&self.state);
            state.state = ProcessState::Exited;
            state.exit_code = exit_code;
            state.exited_at = Some(Instant::now());
            std::mem::take(&mut state.exit_listeners)
        };
        lock_unpoisoned(&self.kill_tx).take();
        info!(event = "process_exited", id = %self.id, exit_code = ?exit_code);
        for (listener_id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(exit_code))).is_err() {
                warn!(event = "exit_listener_panicked", id = %self.id, listener = listener_id);
            }
        }
    }

    fn collectable(&self, retention: Duration) -> bool {
        let state = lock_unpoisoned(&self.state);
        let expired = state
            .exited_at
            .map(|at| at.elapsed() >= retention)
            .unwrap_or(false);
        expired && state.output_listeners.is_empty() && state.exit_listeners.is_empty()
    }
}

/// Cancels a listener registration. Dropping the handle cancels as well.
pub struct Unsubscribe {
    handle: Weak<ProcessHandle>,
    kind: ListenerKind,
    listener_id: u64,
    active: bool,
}

impl Unsubscribe {
    fn inert() -> Self {
        Self {
            handle: Weak::new(),
            kind: ListenerKind::Exit,
            listener_id: 0,
            active: false,
        }
    }

    pub fn cancel(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(handle) = self.handle.upgrade() {
            handle.remove_listener(self.kind, self.listener_id);
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct RunnerInner {
    processes: Mutex<HashMap<String, Arc<ProcessHandle>>>,
    counter: AtomicU64,
    max_lines: Option<usize>,
}

/// Registry of spawned commands, shared by the HTTP surface and the broadcaster.
#[derive(Clone)]
pub struct ProcessRunner {
    inner: Arc<RunnerInner>,
}

impl ProcessRunner {
    pub fn new(max_lines: Option<usize>) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                processes: Mutex::new(HashMap::new()),
                counter: AtomicU64::new(0),
                max_lines,
            }),
        }
    }

    fn get(&self, id: &str) -> Result<Arc<ProcessHandle>, RunnerError> {
        lock_unpoisoned(&self.inner.processes)
            .get(id)
            .cloned()
            .ok_or_else(|| RunnerError::NotFound(id.to_string()))
    }

    /// Launches `command` through the platform shell. Must be called from within a tokio
    /// runtime; no handle is created when the launch fails.
    pub fn spawn(&self, command: &str, options: SpawnOptions) -> Result<String, RunnerError> {
        if command.trim().is_empty() {
            return Err(RunnerError::EmptyCommand);
        }
        let cwd = match options.cwd {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };
        if !cwd.is_dir() {
            return Err(RunnerError::InvalidCwd(cwd));
        }

        let mut cmd = shell_command(command);
        cmd.current_dir(&cwd)
            .envs(options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }
        let mut child = cmd.spawn().map_err(|err| {
            warn!(event = "process_spawn_failed", command = command, error = %err);
            RunnerError::Spawn(err)
        })?;

        let id = format!("proc-{}", self.inner.counter.fetch_add(1, Ordering::SeqCst) + 1);
        let (kill_tx, kill_rx) = oneshot::channel();
        let handle = Arc::new(ProcessHandle {
            id: id.clone(),
            command: command.to_string(),
            cwd: cwd.clone(),
            pid: child.id(),
            started_at: Utc::now(),
            max_lines: self.inner.max_lines,
            state: Mutex::new(HandleState {
                state: ProcessState::Running,
                exit_code: None,
                exited_at: None,
                lines: VecDeque::new(),
                next_seq: 0,
                last_timestamp: 0,
                next_listener_id: 0,
                output_listeners: Vec::new(),
                exit_listeners: Vec::new(),
            }),
            kill_tx: Mutex::new(Some(kill_tx)),
        });
        lock_unpoisoned(&self.inner.processes).insert(id.clone(), handle.clone());

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel::<(OutputStream, String)>();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_chunks(stdout, OutputStream::Stdout, chunk_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_chunks(stderr, OutputStream::Stderr, chunk_tx.clone()));
        }
        drop(chunk_tx);
        tokio::spawn(pump(handle.clone(), child, chunk_rx, kill_rx));

        info!(
            event = "process_spawned",
            id = %id,
            pid = ?handle.pid,
            cwd = %cwd.display(),
            command = command
        );
        Ok(id)
    }

    pub fn get_status(&self, id: &str) -> ProcessStatus {
        self.get(id)
            .map(|handle| handle.status())
            .unwrap_or(ProcessStatus::NOT_FOUND)
    }

    pub fn get_output(&self, id: &str) -> Result<Vec<OutputLine>, RunnerError> {
        Ok(self.get(id)?.snapshot())
    }

    pub fn on_output<F>(&self, id: &str, callback: F) -> Result<Unsubscribe, RunnerError>
    where
        F: Fn(&OutputLine) + Send + Sync + 'static,
    {
        let handle = self.get(id)?;
        let listener_id = handle.add_output_listener(Arc::new(callback));
        Ok(Unsubscribe {
            handle: Arc::downgrade(&handle),
            kind: ListenerKind::Output,
            listener_id,
            active: true,
        })
    }

    /// Registers an exit listener. On an already exited process the callback runs before
    /// this returns and the returned handle is inert.
    pub fn on_exit<F>(&self, id: &str, callback: F) -> Result<Unsubscribe, RunnerError>
    where
        F: Fn(Option<i32>) + Send + Sync + 'static,
    {
        let handle = self.get(id)?;
        let callback: ExitListener = Arc::new(callback);
        match handle.add_exit_listener(callback.clone()) {
            Ok(listener_id) => Ok(Unsubscribe {
                handle: Arc::downgrade(&handle),
                kind: ListenerKind::Exit,
                listener_id,
                active: true,
            }),
            Err(exit_code) => {
                if catch_unwind(AssertUnwindSafe(|| callback(exit_code))).is_err() {
                    warn!(event = "exit_listener_panicked", id = id);
                }
                Ok(Unsubscribe::inert())
            }
        }
    }

    pub fn kill(&self, id: &str) -> Result<(), RunnerError> {
        let handle = self.get(id)?;
        let sender = lock_unpoisoned(&handle.kill_tx).take();
        match sender {
            Some(sender) => {
                let _ = sender.send(());
                info!(event = "process_kill_requested", id = id);
                Ok(())
            }
            None => Err(RunnerError::AlreadyExited(id.to_string())),
        }
    }

    pub fn list(&self) -> Vec<ProcessSummary> {
        let handles = lock_unpoisoned(&self.inner.processes)
            .values()
            .cloned()
            .collect::<Vec<_>>();
        let mut summaries = handles.iter().map(|handle| handle.summary()).collect::<Vec<_>>();
        summaries.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        summaries
    }

    /// Drops handles that exited at least `retention` ago and have no listeners left.
    pub fn prune_exited(&self, retention: Duration) -> usize {
        let mut processes = lock_unpoisoned(&self.inner.processes);
        let before = processes.len();
        processes.retain(|_, handle| !handle.collectable(retention));
        let removed = before - processes.len();
        if removed > 0 {
            debug!(event = "process_pruned", removed = removed, remaining = processes.len());
        }
        removed
    }

    pub fn listener_counts(&self, id: &str) -> Option<(usize, usize)> {
        self.get(id).ok().map(|handle| handle.listener_counts())
    }
}

#[cfg(not(windows))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

/// Splits one delivered chunk on newlines, so a chunk becomes one or more output lines
/// rather than exactly one. Lines never span chunks: a trailing segment without a
/// newline is emitted as its own line. See "chunk vs. line" in DESIGN.md.
fn split_chunk(chunk: &str) -> Vec<String> {
    let mut lines = chunk
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
        .collect::<Vec<_>>();
    if chunk.ends_with('\n') {
        lines.pop();
    }
    lines
}

async fn read_chunks<R>(mut reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<(OutputStream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_CHUNK_BYTES];
    let mut carry = Utf8Carry::default();
    loop {
        let read = match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(count) => count,
            Err(err) => {
                debug!(event = "process_read_error", stream = stream.as_str(), error = %err);
                break;
            }
        };
        let text = carry.push(&buffer[..read]);
        if text.is_empty() {
            continue;
        }
        if tx.send((stream, text)).is_err() {
            return;
        }
    }
    let rest = carry.finish();
    if !rest.is_empty() {
        let _ = tx.send((stream, rest));
    }
}

/// Publishes output until the shell exits, then drains what is left for a bounded time
/// and records the exit.
async fn pump(
    handle: Arc<ProcessHandle>,
    mut child: Child,
    mut chunks: mpsc::UnboundedReceiver<(OutputStream, String)>,
    mut kill_rx: oneshot::Receiver<()>,
) {
    let mut kill_requested = false;
    let mut chunks_open = true;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            chunk = chunks.recv(), if chunks_open => match chunk {
                Some((stream, text)) => handle.publish(stream, &text),
                None => chunks_open = false,
            },
            signal = &mut kill_rx, if !kill_requested => {
                kill_requested = true;
                if signal.is_ok() {
                    terminate(&mut child);
                }
            }
        }
    };

    if chunks_open {
        let deadline = tokio::time::Instant::now() + EXIT_DRAIN_TIMEOUT;
        while let Ok(Some((stream, text))) = tokio::time::timeout_at(deadline, chunks.recv()).await {
            handle.publish(stream, &text);
        }
    }

    let exit_code = match status {
        Ok(status) => status.code(),
        Err(err) => {
            warn!(event = "process_wait_failed", id = %handle.id, error = %err);
            None
        }
    };
    handle.finish(exit_code);
}

/// Kills the shell together with everything it started. The shell leads its own process
/// group on unix.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!(event = "process_group_kill_failed", pid = pid, error = %err);
            }
        }
    }
    let _ = child.start_kill();
}

pub fn resolve_cwd(base: &Path, requested: Option<&str>) -> PathBuf {
    match requested.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => {
            let path = PathBuf::from(value);
            if path.is_absolute() {
                path
            } else {
                base.join(path)
            }
        }
        None => base.to_path_buf(),
    }
}
