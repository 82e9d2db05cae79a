use crate::{
    process::{ProcessRunner, Unsubscribe},
    watch::{WatchEvent, WatchRegistry, WatchSubscription},
};
use alm_core::{
    event_ipc::{EventMessage, OutputLine, ProcessState},
    Topic, TopicSelection, WatchedFile,
};
use serde_json::json;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{
    sync::mpsc,
    task::JoinSet,
};
use tracing::{debug, info, warn};

pub const DEFAULT_CONNECTION_QUEUE: usize = 256;

/// What a client asked for when opening the push channel.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub project_dir: PathBuf,
    pub topics: TopicSelection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Opening,
    Streaming,
    Closed,
}

enum ProcessEvent {
    Output(OutputLine),
    Exit(Option<i32>),
}

/// Binds push connections to the shared watch and process registries.
#[derive(Clone)]
pub struct Broadcaster {
    watch: WatchRegistry,
    runner: ProcessRunner,
    conn_counter: Arc<AtomicU64>,
    active: Arc<AtomicUsize>,
}

impl Broadcaster {
    pub fn new(watch: WatchRegistry, runner: ProcessRunner) -> Self {
        Self {
            watch,
            runner,
            conn_counter: Arc::new(AtomicU64::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Opens a connection and returns its outbound message stream. Dropping the receiver
    /// closes the connection and runs its teardown.
    pub fn open(&self, request: SubscribeRequest, capacity: usize) -> mpsc::Receiver<EventMessage> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn_id = format!(
            "conn-{}",
            self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1
        );
        self.active.fetch_add(1, Ordering::SeqCst);
        let connection = Connection {
            conn_id,
            phase: Phase::Opening,
            tasks: JoinSet::new(),
            active: self.active.clone(),
        };
        tokio::spawn(run_connection(
            connection,
            self.watch.clone(),
            self.runner.clone(),
            request,
            tx,
        ));
        rx
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

struct Connection {
    conn_id: String,
    phase: Phase,
    tasks: JoinSet<()>,
    active: Arc<AtomicUsize>,
}

impl Connection {
    fn teardown(&mut self, reason: &str) {
        if self.phase == Phase::Closed {
            return;
        }
        self.phase = Phase::Closed;
        self.tasks.abort_all();
        self.active.fetch_sub(1, Ordering::SeqCst);
        info!(event = "client_disconnected", conn_id = %self.conn_id, reason = reason);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.teardown("dropped");
    }
}

async fn run_connection(
    mut conn: Connection,
    watch: WatchRegistry,
    runner: ProcessRunner,
    request: SubscribeRequest,
    out: mpsc::Sender<EventMessage>,
) {
    let SubscribeRequest { project_dir, topics } = request;
    info!(
        event = "client_connected",
        conn_id = %conn.conn_id,
        project = %project_dir.display(),
        topics = ?topics.names()
    );

    let project = project_dir.display().to_string();
    if out
        .send(EventMessage::connected(&project, &topics.names()))
        .await
        .is_err()
    {
        conn.teardown("closed_during_open");
        return;
    }
    for (raw, reason) in &topics.rejected {
        if out.send(EventMessage::rejected_topic(raw, reason)).await.is_err() {
            conn.teardown("closed_during_open");
            return;
        }
    }

    let files = topics
        .accepted
        .iter()
        .filter_map(Topic::watched_file)
        .collect::<Vec<WatchedFile>>();
    if !files.is_empty() {
        match watch.acquire(&project_dir, &files) {
            Ok(subscription) => {
                conn.tasks.spawn(forward_changes(subscription, out.clone()));
            }
            Err(err) => {
                warn!(event = "watch_acquire_failed", conn_id = %conn.conn_id, error = %err);
                let message = EventMessage::channel_error(
                    "watch",
                    &err.to_string(),
                    json!({ "projectDir": project }),
                );
                if out.send(message).await.is_err() {
                    conn.teardown("closed_during_open");
                    return;
                }
            }
        }
    }

    for topic in &topics.accepted {
        let Some(id) = topic.process_id() else {
            continue;
        };
        if runner.get_status(id).state == ProcessState::NotFound {
            debug!(event = "process_topic_unknown", conn_id = %conn.conn_id, id = id);
            if out
                .send(EventMessage::topic_error(topic.to_string(), "process not found"))
                .await
                .is_err()
            {
                conn.teardown("closed_during_open");
                return;
            }
            continue;
        }
        conn.tasks.spawn(stream_process(
            runner.clone(),
            topic.clone(),
            id.to_string(),
            out.clone(),
        ));
    }

    conn.phase = Phase::Streaming;
    loop {
        tokio::select! {
            _ = out.closed() => break,
            joined = conn.tasks.join_next(), if !conn.tasks.is_empty() => {
                if let Some(Err(err)) = joined {
                    if err.is_panic() {
                        warn!(event = "topic_task_panicked", conn_id = %conn.conn_id);
                    }
                }
            }
        }
    }
    conn.teardown("client_closed");
}

async fn forward_changes(mut subscription: WatchSubscription, out: mpsc::Sender<EventMessage>) {
    while let Some(event) = subscription.recv().await {
        let message = match event {
            WatchEvent::Changed(file) => EventMessage::change(file),
            WatchEvent::Error(detail) => EventMessage::channel_error(
                "watch",
                "file watcher error",
                json!({
                    "projectDir": subscription.dir().display().to_string(),
                    "error": detail,
                }),
            ),
        };
        if out.send(message).await.is_err() {
            break;
        }
    }
    subscription.release();
}

/// Replays buffered output for one process topic, then forwards live lines until exit.
/// Listeners are registered before the snapshot so nothing emitted in between is lost.
async fn stream_process(
    runner: ProcessRunner,
    topic: Topic,
    id: String,
    out: mpsc::Sender<EventMessage>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ProcessEvent>();

    let output_tx = tx.clone();
    let output_guard = runner.on_output(&id, move |line| {
        let _ = output_tx.send(ProcessEvent::Output(line.clone()));
    });
    let exit_guard = runner.on_exit(&id, move |code| {
        let _ = tx.send(ProcessEvent::Exit(code));
    });
    let snapshot = runner.get_output(&id);
    let (mut guards, snapshot): (Vec<Unsubscribe>, Vec<OutputLine>) =
        match (output_guard, exit_guard, snapshot) {
            (Ok(output), Ok(exit), Ok(snapshot)) => (vec![output, exit], snapshot),
            _ => {
                // pruned between the status check and registration
                let _ = out
                    .send(EventMessage::topic_error(topic.to_string(), "process not found"))
                    .await;
                return;
            }
        };

    let count = snapshot.len();
    if out.send(EventMessage::replay_start(&topic, count)).await.is_err() {
        return;
    }
    for line in &snapshot {
        if out.send(EventMessage::output(&topic, line)).await.is_err() {
            return;
        }
    }
    if out.send(EventMessage::replay_end(&topic, count)).await.is_err() {
        return;
    }

    let last_replayed = snapshot.last().map(|line| line.seq).unwrap_or(0);
    while let Some(event) = rx.recv().await {
        match event {
            ProcessEvent::Output(line) => {
                if line.seq <= last_replayed {
                    continue;
                }
                if out.send(EventMessage::output(&topic, &line)).await.is_err() {
                    return;
                }
            }
            ProcessEvent::Exit(code) => {
                let _ = out.send(EventMessage::exit(&topic, code)).await;
                break;
            }
        }
    }
    for guard in &mut guards {
        guard.cancel();
    }
    debug!(event = "process_topic_closed", topic = %topic);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::watch::WatchConfig;
    use alm_core::{event_ipc::EventKind, parse_topic_list};
    use std::{path::Path, time::Duration};
    use tokio::time::timeout;

    fn setup() -> (Broadcaster, ProcessRunner, WatchRegistry) {
        let watch = WatchRegistry::new(WatchConfig {
            debounce: Duration::from_millis(50),
            ..WatchConfig::default()
        });
        let runner = ProcessRunner::new(None);
        (Broadcaster::new(watch.clone(), runner.clone()), runner, watch)
    }

    fn request(dir: &Path, topics: &str) -> SubscribeRequest {
        SubscribeRequest {
            project_dir: dir.to_path_buf(),
            topics: parse_topic_list(topics),
        }
    }

    async fn next(rx: &mut mpsc::Receiver<EventMessage>) -> EventMessage {
        timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("message timeout")
            .expect("channel open")
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached");
    }

    fn spawn(runner: &ProcessRunner, dir: &Path, command: &str) -> String {
        runner
            .spawn(
                command,
                crate::process::SpawnOptions {
                    cwd: Some(dir.to_path_buf()),
                    env: Vec::new(),
                },
            )
            .expect("spawn")
    }

    fn texts(messages: &[EventMessage]) -> Vec<String> {
        messages
            .iter()
            .filter(|msg| msg.kind == EventKind::Output)
            .map(|msg| msg.data["text"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn late_joiner_sees_replay_then_exit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (broadcaster, runner, _watch) = setup();
        let id = spawn(
            &runner,
            dir.path(),
            "printf 'a\\n'; printf 'b\\n'; while [ ! -f go ]; do sleep 0.02; done",
        );
        eventually(|| runner.get_output(&id).map(|lines| lines.len()).unwrap_or(0) == 2).await;

        let mut rx = broadcaster.open(request(dir.path(), &format!("process:{id}")), 64);
        let connected = next(&mut rx).await;
        assert_eq!(connected.topic, "system");
        assert_eq!(connected.kind, EventKind::Connected);

        let topic = format!("process:{id}");
        let start = next(&mut rx).await;
        assert_eq!((start.topic.as_str(), start.kind), (topic.as_str(), EventKind::ReplayStart));
        assert_eq!(start.data["count"], 2);
        assert_eq!(next(&mut rx).await.data["text"], "a");
        assert_eq!(next(&mut rx).await.data["text"], "b");
        let end = next(&mut rx).await;
        assert_eq!(end.kind, EventKind::ReplayEnd);
        assert_eq!(end.data["count"], 2);

        std::fs::write(dir.path().join("go"), "").expect("gate");
        let exit = next(&mut rx).await;
        assert_eq!(exit.kind, EventKind::Exit);
        assert_eq!(exit.data["code"], 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exited_process_replays_and_closes_topic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (broadcaster, runner, _watch) = setup();
        let id = spawn(&runner, dir.path(), "printf 'a\\nb\\n'; exit 4");
        eventually(|| runner.get_status(&id).state == ProcessState::Exited).await;

        let mut rx = broadcaster.open(request(dir.path(), &format!("process:{id}")), 64);
        let mut kinds = Vec::new();
        let mut messages = Vec::new();
        for _ in 0..6 {
            let msg = next(&mut rx).await;
            kinds.push(msg.kind);
            messages.push(msg);
        }
        assert_eq!(
            kinds,
            vec![
                EventKind::Connected,
                EventKind::ReplayStart,
                EventKind::Output,
                EventKind::Output,
                EventKind::ReplayEnd,
                EventKind::Exit,
            ]
        );
        assert_eq!(texts(&messages), vec!["a", "b"]);
        assert_eq!(messages[5].data["code"], 4);

        assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());
        eventually(|| runner.listener_counts(&id) == Some((0, 0))).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_process_topic_errors_and_tickets_stay_live() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("tasks.json"), "[]").expect("tasks");
        let (broadcaster, _runner, watch) = setup();

        let mut rx = broadcaster.open(request(dir.path(), "tickets,process:zz"), 64);
        let connected = next(&mut rx).await;
        assert_eq!(connected.data["topics"], json!(["tickets", "process:zz"]));

        let error = next(&mut rx).await;
        assert_eq!(error.topic, "process:zz");
        assert_eq!(error.kind, EventKind::Error);

        assert_eq!(watch.subscriber_count(dir.path()), 1);
        std::fs::write(dir.path().join("tasks.json"), "[{\"id\":1}]").expect("tasks");
        let change = next(&mut rx).await;
        assert_eq!(change.topic, "tickets");
        assert_eq!(change.kind, EventKind::Change);
        assert_eq!(change.data["file"], "tasks");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_topic_tokens_are_reported_and_excluded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (broadcaster, _runner, _watch) = setup();

        let mut rx = broadcaster.open(request(dir.path(), "progress,bogus"), 64);
        let connected = next(&mut rx).await;
        assert_eq!(connected.data["topics"], json!(["progress"]));
        let error = next(&mut rx).await;
        assert_eq!(error.topic, "error");
        assert_eq!(error.data["topic"], "bogus");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_subscribers_see_every_line_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (broadcaster, runner, _watch) = setup();
        let id = spawn(
            &runner,
            dir.path(),
            "i=1; while [ $i -le 25 ]; do echo $i; i=$((i+1)); done; \
             while [ ! -f go ]; do sleep 0.01; done; \
             while [ $i -le 50 ]; do echo $i; i=$((i+1)); done",
        );
        eventually(|| runner.get_output(&id).map(|lines| lines.len()).unwrap_or(0) == 25).await;

        let receivers = (0..5)
            .map(|_| broadcaster.open(request(dir.path(), &format!("process:{id}")), 16))
            .collect::<Vec<_>>();
        std::fs::write(dir.path().join("go"), "").expect("gate");

        let expected = (1..=50).map(|n| n.to_string()).collect::<Vec<_>>();
        for mut rx in receivers {
            let mut messages = Vec::new();
            loop {
                let msg = next(&mut rx).await;
                let done = msg.kind == EventKind::Exit;
                messages.push(msg);
                if done {
                    break;
                }
            }
            assert_eq!(texts(&messages), expected);
            let starts = messages
                .iter()
                .filter(|msg| msg.kind == EventKind::ReplayStart)
                .count();
            assert_eq!(starts, 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnects_are_independent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (broadcaster, runner, _watch) = setup();
        let id = spawn(
            &runner,
            dir.path(),
            "while [ ! -f go ]; do sleep 0.02; done; echo after",
        );
        let topics = format!("process:{id}");

        let mut first = broadcaster.open(request(dir.path(), &topics), 16);
        let mut second = broadcaster.open(request(dir.path(), &topics), 16);
        for rx in [&mut first, &mut second] {
            assert_eq!(next(rx).await.kind, EventKind::Connected);
            assert_eq!(next(rx).await.kind, EventKind::ReplayStart);
            assert_eq!(next(rx).await.kind, EventKind::ReplayEnd);
        }
        assert_eq!(runner.listener_counts(&id), Some((2, 2)));
        assert_eq!(broadcaster.active_connections(), 2);

        drop(first);
        eventually(|| runner.listener_counts(&id) == Some((1, 1))).await;
        eventually(|| broadcaster.active_connections() == 1).await;

        std::fs::write(dir.path().join("go"), "").expect("gate");
        let output = next(&mut second).await;
        assert_eq!(output.data["text"], "after");
        assert_eq!(next(&mut second).await.kind, EventKind::Exit);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn last_disconnect_releases_watch_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (broadcaster, _runner, watch) = setup();

        let mut first = broadcaster.open(request(dir.path(), "tickets"), 16);
        let mut second = broadcaster.open(request(dir.path(), "progress"), 16);
        next(&mut first).await;
        next(&mut second).await;
        eventually(|| watch.subscriber_count(dir.path()) == 2).await;
        let instance = watch.instance_of(dir.path());
        assert_eq!(watch.target_count(), 1);

        drop(first);
        eventually(|| watch.subscriber_count(dir.path()) == 1).await;
        assert_eq!(watch.instance_of(dir.path()), instance);

        drop(second);
        eventually(|| watch.target_count() == 0).await;
        eventually(|| broadcaster.active_connections() == 0).await;
    }
}
