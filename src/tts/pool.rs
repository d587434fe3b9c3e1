//! Pool of long-lived generation workers.
//!
//! The pool owns N worker processes and a FIFO queue of chunk tasks. Every
//! state change (worker ready, task finished, task enqueued, worker died)
//! is followed by an assignment pass that hands queue heads to idle, ready,
//! healthy workers in index order.
//!
//! All pool state sits behind one mutex that is never held across an
//! await: dispatch is a non-blocking send to the worker's writer task, and
//! replies are one-shot channels resolved from the worker's reader task.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::worker::{
    encode_request, write_line, LineBuffer, WorkerHandle, WorkerLauncher, WorkerMessage,
    WorkerRequest,
};

/// Why a pooled task or the pool itself failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("pool shutdown")]
    Shutdown,
    #[error("worker process exited")]
    WorkerExited,
    #[error("no workers available")]
    NoWorkers,
    /// The worker reported an error for this task.
    #[error("{0}")]
    Generation(String),
    #[error("worker pool failed to become ready: {0}")]
    NotReady(String),
}

pub type TaskResult = Result<PathBuf, PoolError>;

/// Number of workers for a configured maximum: `max(1, min(cpus, max))`.
pub fn pool_size(configured_max: usize) -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    configured_max.min(cpus).max(1)
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct Task {
    id: u64,
    text: String,
    voice: String,
    speed: f32,
    reply: oneshot::Sender<TaskResult>,
}

impl Task {
    fn request(&self) -> WorkerRequest {
        WorkerRequest::Generate {
            id: self.id,
            text: self.text.clone(),
            voice: self.voice.clone(),
            speed: self.speed,
        }
    }

    fn resolve(self, result: TaskResult) {
        // The caller may have stopped waiting (cancelled utterance).
        let _ = self.reply.send(result);
    }
}

struct WorkerSlot {
    ready: bool,
    busy: bool,
    failed: bool,
    current: Option<Task>,
    outbox: Option<mpsc::UnboundedSender<WorkerRequest>>,
    handle: Option<Box<dyn WorkerHandle>>,
}

impl WorkerSlot {
    fn running(outbox: mpsc::UnboundedSender<WorkerRequest>, handle: Box<dyn WorkerHandle>) -> Self {
        Self {
            ready: false,
            busy: false,
            failed: false,
            current: None,
            outbox: Some(outbox),
            handle: Some(handle),
        }
    }

    fn dead() -> Self {
        Self {
            ready: false,
            busy: false,
            failed: true,
            current: None,
            outbox: None,
            handle: None,
        }
    }

    fn is_idle(&self) -> bool {
        self.ready && !self.busy && !self.failed
    }

    /// Take the in-flight task if it is `id`.
    fn finish(&mut self, id: u64) -> Option<Task> {
        if self.current.as_ref().map(|t| t.id) != Some(id) {
            return None;
        }
        self.busy = false;
        self.current.take()
    }

    /// Mark failed, close its stdin, kill it, and hand back its task.
    fn fail(&mut self) -> Option<Task> {
        self.failed = true;
        self.ready = false;
        self.busy = false;
        self.outbox = None;
        if let Some(mut handle) = self.handle.take() {
            handle.kill();
        }
        self.current.take()
    }
}

struct PoolState {
    queue: VecDeque<Task>,
    workers: Vec<WorkerSlot>,
    next_id: u64,
    closed: bool,
}

impl PoolState {
    fn healthy_workers(&self) -> usize {
        self.workers.iter().filter(|w| !w.failed).count()
    }

    /// Greedy, order-preserving assignment followed by starvation check.
    fn pump(&mut self) {
        for index in 0..self.workers.len() {
            if self.queue.is_empty() {
                break;
            }
            let slot = &mut self.workers[index];
            if !slot.is_idle() {
                continue;
            }
            let Some(task) = self.queue.pop_front() else {
                break;
            };

            let sent = slot
                .outbox
                .as_ref()
                .is_some_and(|tx| tx.send(task.request()).is_ok());
            if sent {
                debug!(worker = index, task = task.id, "Task dispatched");
                slot.busy = true;
                slot.current = Some(task);
            } else {
                warn!(worker = index, "Worker writer gone, marking failed");
                slot.fail();
                self.queue.push_front(task);
            }
        }

        if !self.queue.is_empty() && self.healthy_workers() == 0 {
            warn!(queued = self.queue.len(), "No healthy workers left, rejecting queue");
            for task in self.queue.drain(..) {
                task.resolve(Err(PoolError::NoWorkers));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Failed(String),
}

struct PoolShared {
    state: Mutex<PoolState>,
    readiness: watch::Sender<Readiness>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark_ready(&self) {
        self.readiness.send_if_modified(|r| {
            if *r == Readiness::Pending {
                *r = Readiness::Ready;
                true
            } else {
                false
            }
        });
    }

    fn fail_readiness(&self, reason: String) {
        self.readiness.send_if_modified(|r| {
            if *r == Readiness::Pending {
                *r = Readiness::Failed(reason);
                true
            } else {
                false
            }
        });
    }

    fn handle_message(&self, index: usize, message: WorkerMessage) {
        let mut state = self.lock();
        let Some(slot) = state.workers.get_mut(index) else {
            return;
        };
        if slot.failed {
            return;
        }

        match message {
            WorkerMessage::Ready => {
                if !slot.ready {
                    slot.ready = true;
                    info!(worker = index, "Worker ready");
                    self.mark_ready();
                }
            }
            WorkerMessage::Result { id, path } => match slot.finish(id) {
                Some(task) => {
                    debug!(worker = index, task = id, path = %path.display(), "Task complete");
                    task.resolve(Ok(path));
                }
                None => warn!(worker = index, task = id, "Result for unknown task"),
            },
            WorkerMessage::Error { id, message } => match slot.finish(id) {
                Some(task) => {
                    warn!(worker = index, task = id, error = %message, "Task failed");
                    task.resolve(Err(PoolError::Generation(message)));
                }
                None => warn!(worker = index, task = id, "Error for unknown task"),
            },
        }

        state.pump();
    }

    fn worker_exited(&self, index: usize, reason: &str) {
        let mut state = self.lock();
        let Some(slot) = state.workers.get_mut(index) else {
            return;
        };
        if slot.failed {
            return;
        }

        let was_ready = slot.ready;
        warn!(worker = index, reason, "Worker process exited");
        if let Some(task) = slot.fail() {
            task.resolve(Err(PoolError::WorkerExited));
        }
        if !was_ready {
            self.fail_readiness(format!(
                "worker {} exited before becoming ready ({})",
                index, reason
            ));
        }

        state.pump();
    }
}

// ---------------------------------------------------------------------------
// Worker IO tasks
// ---------------------------------------------------------------------------

fn spawn_writer(
    shared: Arc<PoolShared>,
    index: usize,
    mut stdin: Box<dyn AsyncWrite + Send + Unpin>,
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
) {
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            let line = match encode_request(&request) {
                Ok(line) => line,
                Err(e) => {
                    let WorkerRequest::Generate { id, .. } = request;
                    shared.handle_message(
                        index,
                        WorkerMessage::Error {
                            id,
                            message: format!("failed to encode request: {}", e),
                        },
                    );
                    continue;
                }
            };
            if let Err(e) = write_line(&mut stdin, &line).await {
                warn!(worker = index, error = %e, "Failed to write to worker");
                shared.worker_exited(index, "stdin closed");
                break;
            }
        }
        debug!(worker = index, "Worker writer ended");
    });
}

fn spawn_reader(shared: Arc<PoolShared>, index: usize, mut stdout: Box<dyn AsyncRead + Send + Unpin>) {
    tokio::spawn(async move {
        let mut framing = LineBuffer::default();
        let mut buf = vec![0u8; 8192];

        let reason = loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break "stdout closed".to_string(),
                Ok(n) => {
                    for line in framing.push(&buf[..n]) {
                        match serde_json::from_str::<WorkerMessage>(&line) {
                            Ok(message) => shared.handle_message(index, message),
                            Err(_) => debug!(worker = index, line = %line, "Ignoring non-protocol output"),
                        }
                    }
                }
                Err(e) => break e.to_string(),
            }
        };

        shared.worker_exited(index, &reason);
    });
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// A task's eventual result. Resolves exactly once.
pub struct PendingResult {
    id: u64,
    rx: oneshot::Receiver<TaskResult>,
}

impl PendingResult {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingResult {
    type Output = TaskResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(PoolError::Shutdown)))
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub workers: usize,
    pub ready: usize,
    pub busy: usize,
    pub failed: usize,
    pub queued: usize,
}

/// Fixed-size pool of generation workers.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    size: usize,
}

impl WorkerPool {
    /// Launch `size` workers (at least one) and start their IO tasks.
    ///
    /// A worker that fails to launch counts as failed before ready.
    pub fn spawn(size: usize, launcher: &dyn WorkerLauncher) -> Self {
        let size = size.max(1);
        let (readiness, _) = watch::channel(Readiness::Pending);
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                workers: Vec::with_capacity(size),
                next_id: 1,
                closed: false,
            }),
            readiness,
        });

        let mut streams = Vec::new();
        let mut launch_failures = Vec::new();
        {
            let mut state = shared.lock();
            for index in 0..size {
                match launcher.launch(index) {
                    Ok(io) => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        state.workers.push(WorkerSlot::running(tx, io.handle));
                        streams.push((index, io.stdin, io.stdout, rx));
                    }
                    Err(e) => {
                        warn!(worker = index, error = %e, "Failed to launch worker");
                        state.workers.push(WorkerSlot::dead());
                        launch_failures.push(format!("worker {} failed to start: {}", index, e));
                    }
                }
            }
        }
        if let Some(reason) = launch_failures.into_iter().next() {
            shared.fail_readiness(reason);
        }

        // Slots exist before any reader can report "ready".
        for (index, stdin, stdout, rx) in streams {
            spawn_writer(Arc::clone(&shared), index, stdin, rx);
            spawn_reader(Arc::clone(&shared), index, stdout);
        }

        info!(workers = size, "Worker pool started");
        Self { shared, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Resolve once the first worker is ready; fail if a worker dies before
    /// any became ready or the pool is shut down first.
    pub async fn ready(&self) -> Result<(), PoolError> {
        let mut rx = self.shared.readiness.subscribe();
        let readiness = rx
            .wait_for(|r| *r != Readiness::Pending)
            .await
            .map(|r| (*r).clone());
        match readiness {
            Ok(Readiness::Ready) => Ok(()),
            Ok(Readiness::Failed(reason)) => Err(PoolError::NotReady(reason)),
            Ok(Readiness::Pending) | Err(_) => Err(PoolError::Shutdown),
        }
    }

    /// Whether at least one worker has reported ready and the pool is open.
    pub fn is_ready(&self) -> bool {
        let state = self.shared.lock();
        !state.closed && state.workers.iter().any(|w| w.ready && !w.failed)
    }

    /// Queue a chunk for generation.
    pub fn enqueue(&self, text: &str, voice: &str, speed: f32) -> PendingResult {
        let (reply, rx) = oneshot::channel();
        let mut state = self.shared.lock();
        let id = state.next_id;
        state.next_id += 1;

        let task = Task {
            id,
            text: text.to_string(),
            voice: voice.to_string(),
            speed,
            reply,
        };

        if state.closed {
            task.resolve(Err(PoolError::Shutdown));
        } else if state.healthy_workers() == 0 {
            task.resolve(Err(PoolError::NoWorkers));
        } else {
            debug!(task = id, chars = text.chars().count(), "Task queued");
            state.queue.push_back(task);
            state.pump();
        }

        PendingResult { id, rx }
    }

    /// Reject everything pending, mark all workers failed, kill them all.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        state.closed = true;

        let queued = state.queue.len();
        for task in state.queue.drain(..) {
            task.resolve(Err(PoolError::Shutdown));
        }
        let mut in_flight = 0;
        for slot in state.workers.iter_mut() {
            if let Some(task) = slot.fail() {
                in_flight += 1;
                task.resolve(Err(PoolError::Shutdown));
            }
        }
        drop(state);

        self.shared.fail_readiness("pool shut down".to_string());
        info!(queued, in_flight, "Worker pool shut down");
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.shared.lock();
        PoolStatus {
            workers: state.workers.len(),
            ready: state.workers.iter().filter(|w| w.ready && !w.failed).count(),
            busy: state.workers.iter().filter(|w| w.busy).count(),
            failed: state.workers.iter().filter(|w| w.failed).count(),
            queued: state.queue.len(),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
