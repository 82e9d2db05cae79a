//! Ref-counted file watchers, one per project directory.
//!
//! A [`WatchTarget`] owns the notify watcher for a directory and fans coalesced change
//! events out to every [`WatchSubscription`] registered against it. The target is created
//! by the first `acquire` for a directory and closed by the release of its last subscriber.

use crate::lock_unpoisoned;
use alm_core::{CollaboratorFiles, WatchedFile};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::{
    collections::{HashMap, HashSet},
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(150);
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 64;
const MAX_COALESCE_FACTOR: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Changed(WatchedFile),
    Error(String),
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("cannot resolve {path}: {source}")]
    Resolve { path: PathBuf, source: io::Error },
    #[error("watcher init failed: {0}")]
    Init(#[from] notify::Error),
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub files: CollaboratorFiles,
    pub debounce: Duration,
    pub queue_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            files: CollaboratorFiles::default(),
            debounce: DEFAULT_DEBOUNCE,
            queue_capacity: DEFAULT_SUBSCRIBER_QUEUE,
        }
    }
}

enum RawWatchEvent {
    Touched(WatchedFile),
    Failed(String),
}

/// Events that did not fit a subscriber's queue. Changes coalesce per file and only the
/// latest error is kept; the subscription hands these out once its queue runs dry.
#[derive(Default)]
struct Backlog {
    changes: Vec<WatchedFile>,
    error: Option<String>,
}

impl Backlog {
    fn push(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Changed(file) => {
                if !self.changes.contains(&file) {
                    self.changes.push(file);
                }
            }
            WatchEvent::Error(message) => self.error = Some(message),
        }
    }

    fn pop(&mut self) -> Option<WatchEvent> {
        if let Some(message) = self.error.take() {
            return Some(WatchEvent::Error(message));
        }
        if self.changes.is_empty() {
            return None;
        }
        Some(WatchEvent::Changed(self.changes.remove(0)))
    }

    fn holds(&self, event: &WatchEvent) -> bool {
        matches!(event, WatchEvent::Changed(file) if self.changes.contains(file))
    }
}

struct Subscriber {
    files: HashSet<WatchedFile>,
    sender: mpsc::Sender<WatchEvent>,
    backlog: Arc<Mutex<Backlog>>,
}

struct WatchTarget {
    dir: PathBuf,
    instance: u64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl WatchTarget {
    fn deliver(&self, event: WatchEvent) {
        let recipients = {
            let subscribers = lock_unpoisoned(&self.subscribers);
            subscribers
                .iter()
                .filter(|(_, sub)| match &event {
                    WatchEvent::Changed(file) => sub.files.contains(file),
                    WatchEvent::Error(_) => true,
                })
                .map(|(id, sub)| (*id, sub.sender.clone(), sub.backlog.clone()))
                .collect::<Vec<_>>()
        };

        let mut closed = Vec::new();
        for (id, sender, backlog) in recipients {
            if lock_unpoisoned(&backlog).holds(&event) {
                continue;
            }
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
                Err(mpsc::error::TrySendError::Full(event)) => {
                    debug!(event = "watch_subscriber_full", dir = %self.dir.display(), subscriber = id);
                    lock_unpoisoned(&backlog).push(event);
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = lock_unpoisoned(&self.subscribers);
            for id in closed {
                subscribers.remove(&id);
            }
        }
    }

    fn close(&self) {
        lock_unpoisoned(&self.watcher).take();
        if let Some(pump) = lock_unpoisoned(&self.pump).take() {
            pump.abort();
        }
    }
}

struct RegistryInner {
    config: WatchConfig,
    targets: Mutex<HashMap<PathBuf, Arc<WatchTarget>>>,
    instance_counter: AtomicU64,
    subscriber_counter: AtomicU64,
}

impl RegistryInner {
    fn release(&self, dir: &Path, instance: u64, subscriber_id: u64) {
        let mut targets = lock_unpoisoned(&self.targets);
        let Some(target) = targets.get(dir).cloned() else {
            return;
        };
        if target.instance != instance {
            return;
        }
        let remaining = {
            let mut subscribers = lock_unpoisoned(&target.subscribers);
            subscribers.remove(&subscriber_id);
            subscribers.len()
        };
        if remaining > 0 {
            debug!(event = "watch_release", dir = %dir.display(), remaining = remaining);
            return;
        }
        targets.remove(dir);
        drop(targets);
        target.close();
        info!(event = "watch_target_closed", dir = %dir.display(), instance = instance);
    }
}

/// Process-wide registry of watch targets keyed by canonical directory path.
#[derive(Clone)]
pub struct WatchRegistry {
    inner: Arc<RegistryInner>,
}

impl WatchRegistry {
    pub fn new(config: WatchConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                targets: Mutex::new(HashMap::new()),
                instance_counter: AtomicU64::new(0),
                subscriber_counter: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a subscriber for `files` under `dir`, starting a watcher for the
    /// directory when none exists. Must be called from within a tokio runtime.
    pub fn acquire(&self, dir: &Path, files: &[WatchedFile]) -> Result<WatchSubscription, WatchError> {
        let dir = canonical_dir(dir)?;
        let (sender, receiver) = mpsc::channel(self.inner.config.queue_capacity.max(1));
        let subscriber_id = self.inner.subscriber_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let backlog = Arc::new(Mutex::new(Backlog::default()));

        let mut targets = lock_unpoisoned(&self.inner.targets);
        let target = match targets.get(&dir) {
            Some(existing) => existing.clone(),
            None => {
                let created = self.start_target(&dir)?;
                targets.insert(dir.clone(), created.clone());
                created
            }
        };
        let count = {
            let mut subscribers = lock_unpoisoned(&target.subscribers);
            subscribers.insert(
                subscriber_id,
                Subscriber {
                    files: files.iter().copied().collect(),
                    sender,
                    backlog: backlog.clone(),
                },
            );
            subscribers.len()
        };
        drop(targets);

        debug!(
            event = "watch_acquire",
            dir = %dir.display(),
            instance = target.instance,
            subscribers = count
        );

        Ok(WatchSubscription {
            registry: self.inner.clone(),
            dir,
            instance: target.instance,
            subscriber_id,
            receiver,
            backlog,
            released: false,
        })
    }

    fn start_target(&self, dir: &Path) -> Result<Arc<WatchTarget>, WatchError> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<RawWatchEvent>();
        let files = self.inner.config.files.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if !is_content_event(&event.kind) {
                        return;
                    }
                    for path in &event.paths {
                        let file = path
                            .file_name()
                            .and_then(|name| name.to_str())
                            .and_then(|name| files.classify(name));
                        if let Some(file) = file {
                            let _ = raw_tx.send(RawWatchEvent::Touched(file));
                        }
                    }
                }
                Err(err) => {
                    let _ = raw_tx.send(RawWatchEvent::Failed(err.to_string()));
                }
            }
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        let instance = self.inner.instance_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let target = Arc::new(WatchTarget {
            dir: dir.to_path_buf(),
            instance,
            subscribers: Mutex::new(HashMap::new()),
            watcher: Mutex::new(Some(watcher)),
            pump: Mutex::new(None),
        });
        let pump = tokio::spawn(run_pump(
            Arc::downgrade(&target),
            raw_rx,
            self.inner.config.debounce,
        ));
        *lock_unpoisoned(&target.pump) = Some(pump);

        info!(event = "watch_target_started", dir = %dir.display(), instance = instance);
        Ok(target)
    }

    pub fn target_count(&self) -> usize {
        lock_unpoisoned(&self.inner.targets).len()
    }

    pub fn subscriber_count(&self, dir: &Path) -> usize {
        let Ok(dir) = canonical_dir(dir) else {
            return 0;
        };
        lock_unpoisoned(&self.inner.targets)
            .get(&dir)
            .map(|target| lock_unpoisoned(&target.subscribers).len())
            .unwrap_or(0)
    }

    pub fn instance_of(&self, dir: &Path) -> Option<u64> {
        let dir = canonical_dir(dir).ok()?;
        lock_unpoisoned(&self.inner.targets)
            .get(&dir)
            .map(|target| target.instance)
    }

    #[cfg(test)]
    fn inject(&self, dir: &Path, event: WatchEvent) {
        let target = canonical_dir(dir)
            .ok()
            .and_then(|dir| lock_unpoisoned(&self.inner.targets).get(&dir).cloned());
        if let Some(target) = target {
            target.deliver(event);
        }
    }
}

/// A subscriber's registration on a watch target. Releasing it (explicitly or by drop)
/// closes the watcher when it was the last one.
pub struct WatchSubscription {
    registry: Arc<RegistryInner>,
    dir: PathBuf,
    instance: u64,
    subscriber_id: u64,
    receiver: mpsc::Receiver<WatchEvent>,
    backlog: Arc<Mutex<Backlog>>,
    released: bool,
}

impl WatchSubscription {
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        if self.released {
            return None;
        }
        match self.receiver.try_recv() {
            Ok(event) => return Some(event),
            Err(mpsc::error::TryRecvError::Empty) => {}
            Err(mpsc::error::TryRecvError::Disconnected) => return lock_unpoisoned(&self.backlog).pop(),
        }
        if let Some(event) = lock_unpoisoned(&self.backlog).pop() {
            return Some(event);
        }
        self.receiver.recv().await
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.receiver.close();
        self.registry
            .release(&self.dir, self.instance, self.subscriber_id);
    }
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

fn canonical_dir(dir: &Path) -> Result<PathBuf, WatchError> {
    let resolved = std::fs::canonicalize(dir).map_err(|source| WatchError::Resolve {
        path: dir.to_path_buf(),
        source,
    })?;
    if !resolved.is_dir() {
        return Err(WatchError::NotADirectory(resolved));
    }
    Ok(resolved)
}

fn is_content_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

struct PendingChange {
    first_seen: Instant,
    deadline: Instant,
}

/// Coalesces raw notify events per file: a change fires once the file has been quiet for
/// `debounce`, or after `debounce * MAX_COALESCE_FACTOR` of continuous writes.
async fn run_pump(
    target: Weak<WatchTarget>,
    mut raw_rx: mpsc::UnboundedReceiver<RawWatchEvent>,
    debounce: Duration,
) {
    let mut pending: HashMap<WatchedFile, PendingChange> = HashMap::new();
    let max_wait = debounce * MAX_COALESCE_FACTOR;
    loop {
        let next_deadline = pending.values().map(|change| change.deadline).min();
        tokio::select! {
            raw = raw_rx.recv() => {
                let Some(raw) = raw else {
                    break;
                };
                match raw {
                    RawWatchEvent::Touched(file) => {
                        let now = Instant::now();
                        let entry = pending.entry(file).or_insert(PendingChange {
                            first_seen: now,
                            deadline: now + debounce,
                        });
                        entry.deadline = std::cmp::min(now + debounce, entry.first_seen + max_wait);
                    }
                    RawWatchEvent::Failed(message) => {
                        let Some(target) = target.upgrade() else {
                            break;
                        };
                        warn!(event = "watch_error", dir = %target.dir.display(), error = %message);
                        target.deliver(WatchEvent::Error(message));
                    }
                }
            }
            _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                let now = Instant::now();
                let due = pending
                    .iter()
                    .filter(|(_, change)| change.deadline <= now)
                    .map(|(file, _)| *file)
                    .collect::<Vec<_>>();
                let Some(target) = target.upgrade() else {
                    break;
                };
                for file in due {
                    pending.remove(&file);
                    debug!(event = "watch_change", dir = %target.dir.display(), file = %file);
                    target.deliver(WatchEvent::Changed(file));
                }
            }
        }
    }
}
