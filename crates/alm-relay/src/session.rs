//! One pseudo-terminal bound to an interactive shell.

use alm_core::terminal_ipc::Utf8Carry;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::{
    io::{Read, Write},
    path::PathBuf,
    sync::{Mutex as StdMutex, MutexGuard, PoisonError},
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const READ_CHUNK_BYTES: usize = 8192;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("pty open failed: {0}")]
    Open(String),
    #[error("shell spawn failed: {0}")]
    Spawn(String),
    #[error("pty io failed: {0}")]
    Io(String),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub shell: String,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
}

/// Receiving ends of a session: decoded output chunks and the shell's exit code.
pub struct SessionIo {
    pub output: mpsc::UnboundedReceiver<String>,
    pub exit: oneshot::Receiver<i32>,
}

/// Work for the PTY writer thread. Input and resizes share one queue so a resize is
/// applied only after the input sent before it.
enum PtyCommand {
    Write(Vec<u8>),
    Resize(PtySize),
}

pub struct TerminalSession {
    id: String,
    pid: Option<u32>,
    commands: mpsc::UnboundedSender<PtyCommand>,
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
}

fn lock<T: ?Sized>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows: rows.max(1),
        cols: cols.max(1),
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl TerminalSession {
    pub fn open(id: String, options: &SessionOptions) -> Result<(Self, SessionIo), SessionError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(options.cols, options.rows))
            .map_err(|err| SessionError::Open(err.to_string()))?;

        let mut builder = CommandBuilder::new(&options.shell);
        builder.cwd(&options.cwd);
        if std::env::var("TERM").is_err() {
            builder.env("TERM", "xterm-256color");
        }

        let mut child = pair
            .slave
            .spawn_command(builder)
            .map_err(|err| SessionError::Spawn(err.to_string()))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| SessionError::Open(err.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|err| SessionError::Open(err.to_string()))?;
        let killer = child.clone_killer();
        let pid = child.process_id();

        let (output_tx, output_rx) = mpsc::unbounded_channel::<String>();
        let reader_id = id.clone();
        std::thread::spawn(move || {
            let mut buffer = [0u8; READ_CHUNK_BYTES];
            let mut carry = Utf8Carry::default();
            loop {
                let read = match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(count) => count,
                    Err(err) => {
                        debug!(event = "pty_read_end", session_id = %reader_id, error = %err);
                        break;
                    }
                };
                let text = carry.push(&buffer[..read]);
                if !text.is_empty() && output_tx.send(text).is_err() {
                    return;
                }
            }
            let rest = carry.finish();
            if !rest.is_empty() {
                let _ = output_tx.send(rest);
            }
        });

        let (exit_tx, exit_rx) = oneshot::channel::<i32>();
        let wait_id = id.clone();
        std::thread::spawn(move || {
            let code = match child.wait() {
                Ok(status) => i32::try_from(status.exit_code()).unwrap_or(1),
                Err(err) => {
                    warn!(event = "shell_wait_failed", session_id = %wait_id, error = %err);
                    1
                }
            };
            let _ = exit_tx.send(code);
        });

        let (commands, command_rx) = mpsc::unbounded_channel::<PtyCommand>();
        let writer_id = id.clone();
        let master = pair.master;
        std::thread::spawn(move || run_writer(writer_id, master, writer, command_rx));

        let session = Self {
            id,
            pid,
            commands,
            killer: StdMutex::new(killer),
        };
        Ok((
            session,
            SessionIo {
                output: output_rx,
                exit: exit_rx,
            },
        ))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queues input for the shell. Never blocks: a shell that is not reading only backs
    /// up the writer thread.
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        self.send(PtyCommand::Write(data.to_vec()))
    }

    /// Queues a window size, clamped to at least 1x1, and returns the size that will be
    /// applied.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(u16, u16), SessionError> {
        let size = pty_size(cols, rows);
        let applied = (size.cols, size.rows);
        self.send(PtyCommand::Resize(size))?;
        Ok(applied)
    }

    fn send(&self, command: PtyCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Io("pty writer closed".to_string()))
    }

    pub fn kill(&self) {
        if let Err(err) = lock(&self.killer).kill() {
            debug!(event = "shell_kill_failed", session_id = %self.id, error = %err);
        }
    }
}

fn run_writer(
    id: String,
    master: Box<dyn MasterPty + Send>,
    mut writer: Box<dyn Write + Send>,
    mut commands: mpsc::UnboundedReceiver<PtyCommand>,
) {
    while let Some(command) = commands.blocking_recv() {
        match command {
            PtyCommand::Write(data) => {
                if let Err(err) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    debug!(event = "pty_write_end", session_id = %id, error = %err);
                    return;
                }
            }
            PtyCommand::Resize(size) => {
                if let Err(err) = master.resize(size) {
                    warn!(event = "pty_resize_failed", session_id = %id, error = %err);
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options(dir: &std::path::Path) -> SessionOptions {
        SessionOptions {
            shell: "/bin/sh".to_string(),
            cwd: dir.to_path_buf(),
            cols: 80,
            rows: 24,
        }
    }

    async fn read_until(io: &mut SessionIo, needle: &str) -> String {
        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !seen.contains(needle) {
            let chunk = tokio::time::timeout_at(deadline, io.output.recv())
                .await
                .expect("output timeout")
                .expect("output open");
            seen.push_str(&chunk);
        }
        seen
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resize_clamps_and_applies_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (session, mut io) = TerminalSession::open("s-1".to_string(), &options(dir.path()))
            .expect("open");
        assert_eq!(session.resize(0, 0).expect("resize"), (1, 1));
        assert_eq!(session.resize(120, 40).expect("resize"), (120, 40));
        session.write(b"stty size\n").expect("write");
        read_until(&mut io, "40 120").await;
        session.kill();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn large_write_does_not_block_the_caller() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (session, mut io) = TerminalSession::open("s-3".to_string(), &options(dir.path()))
            .expect("open");
        session
            .write(b"stty raw -echo; sleep 3; echo drained\n")
            .expect("write");
        tokio::time::sleep(Duration::from_millis(300)).await;

        let payload = vec![b'x'; 256 * 1024];
        let started = std::time::Instant::now();
        session.write(&payload).expect("write");
        assert!(started.elapsed() < Duration::from_millis(200));
        session.kill();
        let _ = tokio::time::timeout(Duration::from_secs(10), &mut io.exit).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shell_runs_in_requested_directory_and_reports_exit() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("marker-file"), "").expect("marker");
        let (session, mut io) = TerminalSession::open("s-2".to_string(), &options(dir.path()))
            .expect("open");
        assert!(session.pid().is_some());

        session.write(b"ls\n").expect("write");
        read_until(&mut io, "marker-file").await;

        session.write(b"exit 7\n").expect("write");
        let code = tokio::time::timeout(Duration::from_secs(10), &mut io.exit)
            .await
            .expect("exit timeout")
            .expect("exit code");
        assert_eq!(code, 7);
    }
}
