//! The parallel execution engine.
//!
//! A standalone, reusable worker pool independent of the stage graph: one
//! or more named tasks (unit + input source) are dispatched in stride-sized
//! batches, round-robin, across a set of interchangeable workers (local
//! threads, local processes, remote peers). Results are pulled per task
//! with ordering, timeout and skip control; a bounded in-flight buffer
//! provides backpressure. Per-item failures are captured in place and
//! never abort the pool.

pub mod source;
pub mod wire;
pub mod worker;

#[cfg(feature = "remote")]
pub mod remote;

use crate::errors::{PipeflowError, UsageError};
use crate::item::Item;
use crate::unit::Unit;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use source::{BoxInboxSource, BoxSource, Source};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use worker::{classify_inbox, Dispatcher, ProcessDispatcher, ThreadDispatcher};

/// Default port a remote peer listens on when none is given.
pub const DEFAULT_PEER_PORT: u16 = 4040;

static ENGINE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// The kind of local worker an engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Workers on blocking threads of this process.
    #[default]
    Thread,
    /// Workers in spawned child processes.
    Process,
}

/// A remote peer: an address plus how many worker slots it contributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePeer {
    /// Host name or address.
    pub host: String,
    /// Port, defaulting to [`DEFAULT_PEER_PORT`].
    pub port: Option<u16>,
    /// Number of worker slots this peer contributes.
    pub count: usize,
}

impl RemotePeer {
    /// Creates a peer contributing `count` worker slots.
    #[must_use]
    pub fn new(host: impl Into<String>, count: usize) -> Self {
        Self {
            host: host.into(),
            port: None,
            count,
        }
    }

    /// Sets an explicit port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// The effective port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PEER_PORT)
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine name, used by pipeline descriptions. Auto-generated unless set.
    pub name: String,
    /// Number of local workers.
    pub worker_num: usize,
    /// Kind of local worker.
    pub worker_kind: WorkerKind,
    /// Batch size per dispatch round-trip.
    pub stride: usize,
    /// Bound on dispatched-but-unretrieved items; `None` is unbounded.
    pub buffer: Option<usize>,
    /// Deliver results in submission order rather than completion order.
    pub ordered: bool,
    /// Discard a slot permanently when a timed-out pull abandons it.
    pub skip: bool,
    /// Remote peers contributing worker slots.
    pub remote: Vec<RemotePeer>,
    /// Command line spawned for each process worker.
    pub process_command: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: format!("pool-{}", ENGINE_COUNTER.fetch_add(1, Ordering::Relaxed)),
            worker_num: 2,
            worker_kind: WorkerKind::Thread,
            stride: 1,
            buffer: None,
            ordered: true,
            skip: false,
            remote: Vec::new(),
            process_command: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Creates a default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the engine name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the local worker count.
    #[must_use]
    pub fn with_worker_num(mut self, worker_num: usize) -> Self {
        self.worker_num = worker_num;
        self
    }

    /// Sets the local worker kind.
    #[must_use]
    pub fn with_worker_kind(mut self, kind: WorkerKind) -> Self {
        self.worker_kind = kind;
        self
    }

    /// Sets the dispatch batch size.
    #[must_use]
    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride.max(1);
        self
    }

    /// Bounds the in-flight buffer.
    #[must_use]
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = Some(buffer);
        self
    }

    /// Selects ordered or completion-order delivery.
    #[must_use]
    pub fn with_ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    /// Enables skip-on-timeout.
    #[must_use]
    pub fn with_skip(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }

    /// Adds a remote peer.
    #[must_use]
    pub fn with_remote(mut self, peer: RemotePeer) -> Self {
        self.remote.push(peer);
        self
    }

    /// Sets the process-worker command line.
    #[must_use]
    pub fn with_process_command(mut self, command: Vec<String>) -> Self {
        self.process_command = command;
        self
    }
}

/// Handle to a task registered on an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub usize);

/// Per-task options.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Stage name attributed to captured errors, if the task belongs to one.
    pub stage: Option<String>,
    /// Record consumed-inbox/produced-item pairs for statistics.
    pub track: bool,
}

impl TaskOptions {
    /// Creates empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attributes the task to a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Enables consumed/produced tracking.
    #[must_use]
    pub fn with_track(mut self, track: bool) -> Self {
        self.track = track;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Idle,
    Running,
    Stopped,
}

struct Delivered {
    item: Item,
    // Held until the caller takes the item; releasing it frees a buffer slot.
    _permit: Option<OwnedSemaphorePermit>,
}

struct Completed {
    task: usize,
    seq: u64,
    item: Item,
    permit: Option<OwnedSemaphorePermit>,
    tracked_inbox: Option<Vec<Value>>,
}

enum CollectorMsg {
    Slot(Completed),
    /// The manager exhausted a task's input after dispatching `total` slots.
    InputDone { task: usize, total: u64 },
}

struct JobEntry {
    seq: u64,
    inbox: Vec<Item>,
    permit: Option<OwnedSemaphorePermit>,
}

struct WorkJob {
    task: usize,
    entries: Vec<JobEntry>,
}

struct TaskShared {
    stage: Option<String>,
    unit: Unit,
    track: bool,
    out_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivered>>,
    skip_pending: AtomicUsize,
    tracked: Mutex<Vec<(Vec<Value>, Item)>>,
}

struct PendingTask {
    shared: Arc<TaskShared>,
    input: BoxInboxSource,
    out_tx: mpsc::UnboundedSender<Delivered>,
}

struct EngineInner {
    config: EngineConfig,
    state: Mutex<EngineState>,
    pending: Mutex<Vec<PendingTask>>,
    tasks: DashMap<usize, Arc<TaskShared>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// The worker pool. Cheap to clone; clones share one pool.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.inner.config.name)
            .field("tasks", &self.inner.tasks.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine from a configuration. No workers run until
    /// [`Engine::start`].
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                state: Mutex::new(EngineState::Idle),
                pending: Mutex::new(Vec::new()),
                tasks: DashMap::new(),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// True if two handles refer to the same pool.
    #[must_use]
    pub fn same_pool(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Registers a task before start.
    ///
    /// # Errors
    ///
    /// Returns a usage error once the engine has started or stopped.
    pub fn add_task(
        &self,
        unit: Unit,
        input: BoxInboxSource,
        options: TaskOptions,
    ) -> Result<TaskHandle, PipeflowError> {
        let state = *self.inner.state.lock();
        if state != EngineState::Idle {
            return Err(UsageError::new(
                "Engine::add_task",
                "tasks can only be added before the engine starts",
            )
            .into());
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(TaskShared {
            stage: options.stage,
            unit,
            track: options.track,
            out_rx: tokio::sync::Mutex::new(out_rx),
            skip_pending: AtomicUsize::new(0),
            tracked: Mutex::new(Vec::new()),
        });
        let mut pending = self.inner.pending.lock();
        let handle = TaskHandle(pending.len());
        self.inner.tasks.insert(handle.0, Arc::clone(&shared));
        pending.push(PendingTask {
            shared,
            input,
            out_tx,
        });
        tracing::debug!(engine = %self.inner.config.name, task = handle.0, "task added");
        Ok(handle)
    }

    /// Launches the worker set, the dispatch manager and the collector.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a usage error if already started or stopped, if there are no
    /// tasks or no workers, if process/remote workers are configured with
    /// units that cannot be serialized, or if a process worker fails to
    /// spawn.
    pub fn start(&self) -> Result<(), PipeflowError> {
        let mut state = self.inner.state.lock();
        match *state {
            EngineState::Idle => {}
            EngineState::Running => {
                return Err(
                    UsageError::new("Engine::start", "engine is already started").into(),
                )
            }
            EngineState::Stopped => {
                return Err(UsageError::new("Engine::start", "engine was stopped").into())
            }
        }

        let config = &self.inner.config;
        let mut pending = self.inner.pending.lock();
        if pending.is_empty() {
            return Err(UsageError::new("Engine::start", "no tasks were added").into());
        }
        let worker_total =
            config.worker_num + config.remote.iter().map(|p| p.count).sum::<usize>();
        if worker_total == 0 {
            return Err(UsageError::new("Engine::start", "engine has no workers").into());
        }
        let needs_named = config.worker_kind == WorkerKind::Process || !config.remote.is_empty();
        if needs_named && pending.iter().any(|t| !t.shared.unit.is_named()) {
            return Err(UsageError::new(
                "Engine::start",
                "process and remote workers require fully named units",
            )
            .into());
        }
        #[cfg(not(feature = "remote"))]
        if !config.remote.is_empty() {
            return Err(UsageError::new(
                "Engine::start",
                "remote peers require the 'remote' feature",
            )
            .into());
        }

        // Build dispatchers first so a failed process spawn aborts cleanly.
        let mut dispatchers: Vec<Box<dyn Dispatcher>> = Vec::with_capacity(worker_total);
        for _ in 0..config.worker_num {
            match config.worker_kind {
                WorkerKind::Thread => dispatchers.push(Box::new(ThreadDispatcher)),
                WorkerKind::Process => {
                    dispatchers.push(Box::new(ProcessDispatcher::spawn(&config.process_command)?));
                }
            }
        }
        #[cfg(feature = "remote")]
        for peer in &config.remote {
            for _ in 0..peer.count {
                dispatchers.push(Box::new(remote::RemoteDispatcher::new(peer)));
            }
        }

        let semaphore = config.buffer.map(|n| Arc::new(Semaphore::new(n)));
        let (jobs_tx, jobs_rx) = mpsc::channel::<WorkJob>(worker_total.max(1) * 2);
        let jobs_rx = Arc::new(tokio::sync::Mutex::new(jobs_rx));
        let (results_tx, results_rx) = mpsc::unbounded_channel::<CollectorMsg>();

        let mut handles = Vec::new();
        let mut manager_tasks = Vec::new();
        let mut routes = Vec::new();
        for task in pending.drain(..) {
            routes.push(Route {
                shared: Arc::clone(&task.shared),
                tx: Some(task.out_tx),
                next_seq: 0,
                held: BTreeMap::new(),
                expected: None,
                routed: 0,
            });
            manager_tasks.push(ManagedInput {
                shared: task.shared,
                input: task.input,
                seq: 0,
                finished: false,
            });
        }
        drop(pending);

        let units: Arc<Vec<Arc<TaskShared>>> = Arc::new(
            manager_tasks
                .iter()
                .map(|t| Arc::clone(&t.shared))
                .collect(),
        );
        for dispatcher in dispatchers {
            handles.push(tokio::spawn(worker_loop(
                Arc::clone(&jobs_rx),
                Arc::clone(&units),
                dispatcher,
                results_tx.clone(),
            )));
        }
        handles.push(tokio::spawn(manager_loop(
            manager_tasks,
            config.stride,
            semaphore,
            jobs_tx,
            results_tx,
        )));
        handles.push(tokio::spawn(collector_loop(
            results_rx,
            routes,
            config.ordered,
        )));

        *self.inner.handles.lock() = handles;
        *state = EngineState::Running;
        tracing::info!(
            engine = %self.inner.config.name,
            workers = worker_total,
            stride = config.stride,
            "engine started"
        );
        Ok(())
    }

    /// Retrieves the next result for a task.
    ///
    /// `Ok(None)` is end-of-stream. A timeout surfaces as
    /// [`PipeflowError::Timeout`] without consuming the slot, unless the
    /// engine was configured with `skip`, in which case the slot is
    /// discarded permanently and the following call observes the next item.
    ///
    /// # Errors
    ///
    /// Usage error before start or after stop; timeout as described.
    pub async fn next(
        &self,
        task: TaskHandle,
        timeout: Option<Duration>,
    ) -> Result<Option<Item>, PipeflowError> {
        match *self.inner.state.lock() {
            EngineState::Running => {}
            EngineState::Idle => {
                return Err(
                    UsageError::new("Engine::next", "engine is not started").into()
                )
            }
            EngineState::Stopped => {
                return Err(UsageError::new(
                    "Engine::next",
                    "engine was stopped; its workers are torn down",
                )
                .into())
            }
        }
        let shared = self.task(task)?;
        let mut rx = shared.out_rx.lock().await;
        loop {
            let delivered = match timeout {
                None => rx.recv().await,
                Some(wait) => match tokio::time::timeout(wait, rx.recv()).await {
                    Ok(delivered) => delivered,
                    Err(_) => {
                        if self.inner.config.skip {
                            shared.skip_pending.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                engine = %self.inner.config.name,
                                task = task.0,
                                "slot skipped after timeout"
                            );
                        }
                        return Err(PipeflowError::Timeout(wait));
                    }
                },
            };
            match delivered {
                None => return Ok(None),
                Some(delivered) => {
                    if shared.skip_pending.load(Ordering::Relaxed) > 0 {
                        shared.skip_pending.fetch_sub(1, Ordering::Relaxed);
                        // Dropping the delivery releases its buffer slot.
                        continue;
                    }
                    return Ok(Some(delivered.item));
                }
            }
        }
    }

    /// Wraps a task's output as a pull source, for chaining one task's
    /// results into another task's input.
    #[must_use]
    pub fn task_source(&self, task: TaskHandle) -> BoxSource {
        Box::new(TaskSource {
            engine: self.clone(),
            task,
        })
    }

    /// Takes the consumed/produced pairs recorded for a tracked task.
    #[must_use]
    pub fn tracked(&self, task: TaskHandle) -> Vec<(Vec<Value>, Item)> {
        self.inner
            .tasks
            .get(&task.0)
            .map(|shared| std::mem::take(&mut *shared.tracked.lock()))
            .unwrap_or_default()
    }

    /// Releases the pool.
    ///
    /// `ends` names the terminal tasks whose consumers are done pulling.
    /// Cooperative: in-flight work is no longer awaited, not forcibly
    /// aborted elsewhere.
    ///
    /// # Errors
    ///
    /// Usage error when called twice, before start, with no `ends`, or
    /// with an unknown handle.
    pub fn stop(&self, ends: &[TaskHandle]) -> Result<(), PipeflowError> {
        let mut state = self.inner.state.lock();
        match *state {
            EngineState::Running => {}
            EngineState::Idle => {
                return Err(
                    UsageError::new("Engine::stop", "engine was never started").into()
                )
            }
            EngineState::Stopped => {
                return Err(
                    UsageError::new("Engine::stop", "engine was already stopped").into()
                )
            }
        }
        if ends.is_empty() {
            return Err(
                UsageError::new("Engine::stop", "at least one terminal task is required").into(),
            );
        }
        for end in ends {
            if !self.inner.tasks.contains_key(&end.0) {
                return Err(UsageError::new(
                    "Engine::stop",
                    format!("unknown task handle {}", end.0),
                )
                .into());
            }
        }
        for handle in self.inner.handles.lock().drain(..) {
            handle.abort();
        }
        *state = EngineState::Stopped;
        tracing::info!(engine = %self.inner.config.name, "engine stopped");
        Ok(())
    }

    fn task(&self, task: TaskHandle) -> Result<Arc<TaskShared>, PipeflowError> {
        self.inner
            .tasks
            .get(&task.0)
            .map(|entry| Arc::clone(&entry))
            .ok_or_else(|| {
                UsageError::new("Engine::next", format!("unknown task handle {}", task.0))
                    .into()
            })
    }
}

struct ManagedInput {
    shared: Arc<TaskShared>,
    input: BoxInboxSource,
    seq: u64,
    finished: bool,
}

/// Pulls stride-sized batches from each task's input in round-robin order
/// and hands them to the worker queue, acquiring one buffer permit per
/// dispatched inbox. When a task's input runs dry the collector is told the
/// final dispatch count so it can close that task's output stream.
async fn manager_loop(
    mut tasks: Vec<ManagedInput>,
    stride: usize,
    semaphore: Option<Arc<Semaphore>>,
    jobs_tx: mpsc::Sender<WorkJob>,
    results: mpsc::UnboundedSender<CollectorMsg>,
) {
    loop {
        let mut all_finished = true;
        for (index, task) in tasks.iter_mut().enumerate() {
            if task.finished {
                continue;
            }
            all_finished = false;
            let mut entries = Vec::with_capacity(stride);
            for _ in 0..stride {
                match task.input.pull().await {
                    Some(inbox) => {
                        let permit = match &semaphore {
                            Some(semaphore) => {
                                match Arc::clone(semaphore).acquire_owned().await {
                                    Ok(permit) => Some(permit),
                                    Err(_) => return,
                                }
                            }
                            None => None,
                        };
                        entries.push(JobEntry {
                            seq: task.seq,
                            inbox,
                            permit,
                        });
                        task.seq += 1;
                    }
                    None => {
                        task.finished = true;
                        let _ = results.send(CollectorMsg::InputDone {
                            task: index,
                            total: task.seq,
                        });
                        tracing::debug!(task = index, dispatched = task.seq, "task input exhausted");
                        break;
                    }
                }
            }
            if !entries.is_empty()
                && jobs_tx
                    .send(WorkJob {
                        task: index,
                        entries,
                    })
                    .await
                    .is_err()
            {
                return;
            }
        }
        if all_finished {
            break;
        }
    }
    tracing::debug!("manager finished dispatching");
}

/// One worker: drains the shared job queue, runs unit calls through its
/// dispatcher, and reports per-slot results.
async fn worker_loop(
    jobs: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkJob>>>,
    tasks: Arc<Vec<Arc<TaskShared>>>,
    mut dispatcher: Box<dyn Dispatcher>,
    results: mpsc::UnboundedSender<CollectorMsg>,
) {
    loop {
        let job = { jobs.lock().await.recv().await };
        let Some(job) = job else { break };
        let Some(shared) = tasks.get(job.task) else {
            continue;
        };
        let stage = shared.stage.as_deref();

        // Split pass-through slots (markers, upstream failures) from slots
        // that need a unit call; only the latter reach the dispatcher.
        let mut slots: Vec<(u64, Option<OwnedSemaphorePermit>, SlotWork)> = Vec::new();
        let mut inboxes: Vec<Vec<Value>> = Vec::new();
        for entry in job.entries {
            match classify_inbox(entry.inbox, stage) {
                Ok(values) => {
                    slots.push((entry.seq, entry.permit, SlotWork::Execute(inboxes.len())));
                    inboxes.push(values);
                }
                Err(item) => {
                    slots.push((entry.seq, entry.permit, SlotWork::Forward(item)));
                }
            }
        }
        let mut computed = if inboxes.is_empty() {
            Vec::new()
        } else {
            dispatcher
                .dispatch(&shared.unit, stage, inboxes.clone())
                .await
        };

        for (seq, permit, work) in slots {
            let (item, tracked_inbox) = match work {
                SlotWork::Forward(item) => (item, None),
                SlotWork::Execute(at) => {
                    let item = if at < computed.len() {
                        std::mem::replace(&mut computed[at], Item::Exhausted)
                    } else {
                        Item::Failure(Box::new(crate::item::CapturedError::new(
                            "worker returned too few results",
                        )))
                    };
                    let tracked = shared.track.then(|| inboxes_at(&inboxes, at));
                    (item, tracked)
                }
            };
            if results
                .send(CollectorMsg::Slot(Completed {
                    task: job.task,
                    seq,
                    item,
                    permit,
                    tracked_inbox,
                }))
                .is_err()
            {
                return;
            }
        }
    }
}

enum SlotWork {
    Forward(Item),
    Execute(usize),
}

fn inboxes_at(inboxes: &[Vec<Value>], at: usize) -> Vec<Value> {
    inboxes.get(at).cloned().unwrap_or_default()
}

struct Route {
    shared: Arc<TaskShared>,
    // Dropped once every dispatched slot has been routed; readers then see
    // end-of-stream even while other tasks are still running.
    tx: Option<mpsc::UnboundedSender<Delivered>>,
    next_seq: u64,
    held: BTreeMap<u64, Delivered>,
    expected: Option<u64>,
    routed: u64,
}

/// Routes completed slots to their task's output, holding out-of-order
/// results until their turn when ordered delivery is on. A task's output
/// sender is dropped as soon as the manager has reported its input exhausted
/// and every dispatched slot has been routed.
async fn collector_loop(
    mut results: mpsc::UnboundedReceiver<CollectorMsg>,
    mut routes: Vec<Route>,
    ordered: bool,
) {
    while let Some(msg) = results.recv().await {
        let task = match &msg {
            CollectorMsg::Slot(completed) => completed.task,
            CollectorMsg::InputDone { task, .. } => *task,
        };
        let Some(route) = routes.get_mut(task) else {
            continue;
        };
        match msg {
            CollectorMsg::InputDone { total, .. } => route.expected = Some(total),
            CollectorMsg::Slot(completed) => {
                if let Some(inbox) = completed.tracked_inbox {
                    route
                        .shared
                        .tracked
                        .lock()
                        .push((inbox, completed.item.clone()));
                }
                let delivered = Delivered {
                    item: completed.item,
                    _permit: completed.permit,
                };
                if ordered {
                    route.held.insert(completed.seq, delivered);
                    while let Some(ready) = route.held.remove(&route.next_seq) {
                        route.next_seq += 1;
                        route.routed += 1;
                        if let Some(tx) = &route.tx {
                            // A closed receiver still counts as routed so the
                            // slot drains and its permit releases.
                            let _ = tx.send(ready);
                        }
                    }
                } else {
                    route.routed += 1;
                    if let Some(tx) = &route.tx {
                        let _ = tx.send(delivered);
                    }
                }
            }
        }
        if route.expected == Some(route.routed) {
            route.tx = None;
        }
    }
    tracing::debug!("collector finished");
}

struct TaskSource {
    engine: Engine,
    task: TaskHandle,
}

#[async_trait::async_trait]
impl Source for TaskSource {
    async fn pull(&mut self) -> Option<Item> {
        loop {
            match self.engine.next(self.task, None).await {
                Ok(item) => return item,
                Err(PipeflowError::Timeout(_)) => continue,
                Err(err) => {
                    tracing::debug!(error = %err, "task source closed");
                    return None;
                }
            }
        }
    }
}
