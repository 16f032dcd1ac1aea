//! Pipeline stages.
//!
//! A stage wraps one [`Unit`], binds it to an executor (a shared worker
//! pool, or inline synchronous execution), connects to one or more
//! upstream sources, and reshapes item cardinality across its boundary
//! with the `consume`/`produce`/`spawn` parameters. Stages follow a strict
//! lifecycle: `Detached → Connected → Started → Finished`, with `stop`
//! and `disconnect` returning resources; calling an operation from the
//! wrong state is a usage error, never a silent no-op.

pub mod reshape;
pub mod tee;

use crate::engine::source::{
    BoxInboxSource, BoxSource, SequenceSource, SingleInbox, Source, ZipInbox,
};
use crate::engine::worker::{classify_inbox, execute_inbox};
use crate::engine::{Engine, TaskHandle, TaskOptions};
use crate::errors::{PipeflowError, UsageError};
use crate::item::Item;
use crate::unit::Unit;
use parking_lot::Mutex;
use reshape::{ConsumeSource, ReplaySource, ReplayWindow, WindowStep};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tee::{TapId, TapPull, TeeBuffer};

static STAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Lifecycle state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Created, not yet wired to any upstream.
    Detached,
    /// Upstream sources bound; not yet pulling.
    Connected,
    /// Dispatching; iterable.
    Started,
    /// Every tap has consumed the whole output stream.
    Finished,
    /// Stopped; engine resources released by the owner.
    Stopped,
}

/// Stage configuration.
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Stage name; must be unique within a pipeline for persistence.
    pub name: String,
    /// Upstream items (or parallel sources) grouped per unit call.
    pub consume: usize,
    /// Output window replay count.
    pub produce: usize,
    /// Input window replay count, for aligning with a produce sibling.
    pub spawn: usize,
    /// Per-pull wait budget against a bound pool.
    pub timeout: Option<Duration>,
    /// Re-raise captured failures on the delivering pull instead of
    /// passing them downstream in-band.
    pub debug: bool,
    /// Record consumed/produced pairs for pipeline statistics.
    pub track: bool,
}

impl StageConfig {
    /// Creates a configuration with no reshaping.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            consume: 1,
            produce: 1,
            spawn: 1,
            timeout: None,
            debug: false,
            track: false,
        }
    }

    /// Sets the consume group size.
    #[must_use]
    pub fn with_consume(mut self, consume: usize) -> Self {
        self.consume = consume.max(1);
        self
    }

    /// Sets the produce replay count.
    #[must_use]
    pub fn with_produce(mut self, produce: usize) -> Self {
        self.produce = produce.max(1);
        self
    }

    /// Sets the spawn replay count.
    #[must_use]
    pub fn with_spawn(mut self, spawn: usize) -> Self {
        self.spawn = spawn.max(1);
        self
    }

    /// Sets the per-pull timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enables debug re-raising of captured failures.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Enables consumed/produced tracking.
    #[must_use]
    pub fn with_track(mut self, track: bool) -> Self {
        self.track = track;
        self
    }
}

/// Where a stage executes its unit.
///
/// The inline executor is an explicit value, not a process-wide default:
/// a stage built with `Executor::Inline` runs its unit synchronously at
/// pull time, with the same observable contract as a pool of one.
#[derive(Debug, Clone)]
pub enum Executor {
    /// Synchronous execution at pull time.
    Inline,
    /// Delegation to a shared worker pool.
    Pool(Engine),
}

impl Executor {
    /// The stride batch unit reshaping adapters align to.
    #[must_use]
    pub fn stride(&self) -> usize {
        match self {
            Self::Inline => 1,
            Self::Pool(engine) => engine.config().stride,
        }
    }
}

/// One upstream of a stage: another stage, or a raw input sequence.
pub enum UpstreamSource {
    /// Pull from another stage, registering a dedicated tap on it.
    Stage(Stage),
    /// Pull from an in-memory sequence.
    Sequence(Vec<Value>),
}

impl From<Stage> for UpstreamSource {
    fn from(stage: Stage) -> Self {
        Self::Stage(stage)
    }
}

impl From<Vec<Value>> for UpstreamSource {
    fn from(values: Vec<Value>) -> Self {
        Self::Sequence(values)
    }
}

enum FlowKind {
    Pool { engine: Engine, task: TaskHandle },
    Inline { input: BoxInboxSource },
}

struct StageRuntime {
    kind: FlowKind,
    window: Option<ReplayWindow>,
}

struct StageInner {
    id: u64,
    unit: Unit,
    executor: Executor,
    config: StageConfig,
    state: Mutex<StageState>,
    pending_input: Mutex<Option<BoxInboxSource>>,
    flow: tokio::sync::Mutex<Option<StageRuntime>>,
    tee: Mutex<TeeBuffer>,
    task: Mutex<Option<TaskHandle>>,
    default_tap: Mutex<Option<TapId>>,
    tracked_inline: Mutex<Vec<(Vec<Value>, Item)>>,
}

/// A pipeline stage. Cheap to clone; clones share one stage.
#[derive(Clone)]
pub struct Stage {
    inner: Arc<StageInner>,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.name)
            .field("state", &*self.inner.state.lock())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Stage {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Stage {}

impl Stage {
    /// Creates a detached stage.
    #[must_use]
    pub fn new(unit: Unit, executor: Executor, config: StageConfig) -> Self {
        Self {
            inner: Arc::new(StageInner {
                id: STAGE_COUNTER.fetch_add(1, Ordering::Relaxed),
                unit,
                executor,
                config,
                state: Mutex::new(StageState::Detached),
                pending_input: Mutex::new(None),
                flow: tokio::sync::Mutex::new(None),
                tee: Mutex::new(TeeBuffer::new()),
                task: Mutex::new(None),
                default_tap: Mutex::new(None),
                tracked_inline: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Stable numeric handle for this stage.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StageState {
        *self.inner.state.lock()
    }

    /// The stage configuration.
    #[must_use]
    pub fn config(&self) -> &StageConfig {
        &self.inner.config
    }

    /// The wrapped unit.
    #[must_use]
    pub fn unit(&self) -> &Unit {
        &self.inner.unit
    }

    /// The bound executor.
    #[must_use]
    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    /// The engine task registered at start, for pool stages.
    #[must_use]
    pub fn task_handle(&self) -> Option<TaskHandle> {
        *self.inner.task.lock()
    }

    /// Binds the stage to its upstream sources.
    ///
    /// A stage accepts at most one connect per lifetime until
    /// [`Stage::disconnect`]. Several sources are zipped, one item from
    /// each per unit call; a single source with `consume > 1` is grouped
    /// through the stride-aligned consume adapter; `spawn > 1` replays
    /// each source's stride windows.
    ///
    /// # Errors
    ///
    /// Usage error when not detached, with no sources, or when an
    /// upstream stage no longer accepts taps.
    pub fn connect(&self, sources: Vec<UpstreamSource>) -> Result<(), PipeflowError> {
        {
            let state = self.inner.state.lock();
            if *state != StageState::Detached {
                return Err(UsageError::new(
                    "Stage::connect",
                    format!(
                        "stage '{}' is already connected; disconnect first",
                        self.name()
                    ),
                )
                .into());
            }
        }
        if sources.is_empty() {
            return Err(UsageError::new(
                "Stage::connect",
                "at least one upstream source is required",
            )
            .into());
        }

        let stride = self.inner.executor.stride();
        let mut streams: Vec<BoxSource> = Vec::with_capacity(sources.len());
        for source in sources {
            let stream: BoxSource = match source {
                UpstreamSource::Sequence(values) => Box::new(SequenceSource::new(values)),
                UpstreamSource::Stage(upstream) => {
                    let tap = upstream.register_tap()?;
                    Box::new(StageTapSource {
                        stage: upstream,
                        tap,
                    })
                }
            };
            let stream: BoxSource = if self.inner.config.spawn > 1 {
                Box::new(ReplaySource::new(stream, stride, self.inner.config.spawn))
            } else {
                stream
            };
            streams.push(stream);
        }

        let input: BoxInboxSource = if streams.len() > 1 {
            Box::new(ZipInbox::new(streams))
        } else {
            let only = streams
                .pop()
                .ok_or_else(|| PipeflowError::Internal("no upstream stream".to_string()))?;
            if self.inner.config.consume > 1 {
                Box::new(ConsumeSource::new(only, stride, self.inner.config.consume))
            } else {
                Box::new(SingleInbox::new(only))
            }
        };

        *self.inner.pending_input.lock() = Some(input);
        *self.inner.state.lock() = StageState::Connected;
        tracing::debug!(stage = %self.name(), "stage connected");
        Ok(())
    }

    /// Registers a dedicated output tap, used by downstream consumers.
    ///
    /// # Errors
    ///
    /// Usage error once the stage has started: a late tap would miss
    /// already-consumed items.
    pub fn register_tap(&self) -> Result<TapId, PipeflowError> {
        let state = *self.inner.state.lock();
        if !matches!(state, StageState::Detached | StageState::Connected) {
            return Err(UsageError::new(
                "Stage::register_tap",
                format!("stage '{}' has already started", self.name()),
            )
            .into());
        }
        Ok(self.inner.tee.lock().register())
    }

    /// Begins dispatch.
    ///
    /// For a pool stage this registers the task on the shared engine; the
    /// engine's own [`Engine::start`] launches the workers and dispatch,
    /// which is what lets several stages join one pool before it runs.
    ///
    /// # Errors
    ///
    /// Usage error when not connected, or when the bound engine has
    /// already started.
    pub fn start(&self) -> Result<(), PipeflowError> {
        {
            let state = self.inner.state.lock();
            if *state != StageState::Connected {
                return Err(UsageError::new(
                    "Stage::start",
                    format!("stage '{}' must be connected first", self.name()),
                )
                .into());
            }
        }
        let input = self
            .inner
            .pending_input
            .lock()
            .take()
            .ok_or_else(|| PipeflowError::Internal("connected stage has no input".to_string()))?;

        let kind = match &self.inner.executor {
            Executor::Inline => FlowKind::Inline { input },
            Executor::Pool(engine) => {
                let options = TaskOptions::new()
                    .with_stage(self.name())
                    .with_track(self.inner.config.track);
                let task = engine.add_task(self.inner.unit.clone(), input, options)?;
                *self.inner.task.lock() = Some(task);
                FlowKind::Pool {
                    engine: engine.clone(),
                    task,
                }
            }
        };
        let window = (self.inner.config.produce > 1).then(|| {
            ReplayWindow::new(self.inner.executor.stride(), self.inner.config.produce)
        });

        let mut flow = self.inner.flow.try_lock().map_err(|_| {
            PipeflowError::Internal("stage runtime is busy during start".to_string())
        })?;
        *flow = Some(StageRuntime { kind, window });
        drop(flow);

        if self.inner.tee.lock().tap_count() == 0 {
            let tap = self.inner.tee.lock().register();
            *self.inner.default_tap.lock() = Some(tap);
        }
        *self.inner.state.lock() = StageState::Started;
        tracing::debug!(stage = %self.name(), "stage started");
        Ok(())
    }

    /// Pulls the next item for the stage's own (sink) tap.
    ///
    /// # Errors
    ///
    /// Usage error if downstream consumers own the output, plus
    /// everything [`Stage::pull`] reports.
    pub async fn next(&self) -> Result<Option<Item>, PipeflowError> {
        let tap = *self.inner.default_tap.lock();
        let tap = tap.ok_or_else(|| {
            PipeflowError::from(UsageError::new(
                "Stage::next",
                format!(
                    "output of stage '{}' is claimed by downstream consumers",
                    self.name()
                ),
            ))
        })?;
        self.pull(tap).await
    }

    /// Pulls the next item for a tap. `Ok(None)` is end-of-stream.
    ///
    /// # Errors
    ///
    /// [`PipeflowError::Timeout`] when a bound pool pull exceeds the
    /// configured budget; [`PipeflowError::ItemFailure`] on the pull that
    /// would deliver a captured failure when `debug` is set (iteration
    /// continues on the following pull); usage error outside
    /// `Started`/`Finished`.
    pub async fn pull(&self, tap: TapId) -> Result<Option<Item>, PipeflowError> {
        match self.state() {
            StageState::Started => {}
            StageState::Finished => return Ok(None),
            state => {
                return Err(UsageError::new(
                    "Stage::pull",
                    format!("stage '{}' is not started (state {state:?})", self.name()),
                )
                .into())
            }
        }
        let mut flow = self.inner.flow.lock().await;
        let Some(runtime) = flow.as_mut() else {
            return Ok(None);
        };
        loop {
            let served = self.inner.tee.lock().pull(tap);
            match served {
                TapPull::Ready(Item::Failure(error)) if self.inner.config.debug => {
                    return Err(PipeflowError::ItemFailure(*error));
                }
                TapPull::Ready(item) => return Ok(Some(item)),
                TapPull::Done => {
                    self.maybe_finish();
                    return Ok(None);
                }
                TapPull::NeedsMore => match self.produce_one(runtime).await? {
                    Some(item) => self.inner.tee.lock().push(item),
                    None => self.inner.tee.lock().end(),
                },
            }
        }
    }

    async fn produce_one(
        &self,
        runtime: &mut StageRuntime,
    ) -> Result<Option<Item>, PipeflowError> {
        match &mut runtime.window {
            None => self.pull_raw(&mut runtime.kind).await,
            Some(window) => loop {
                match window.step() {
                    WindowStep::Yield(item) => return Ok(Some(item)),
                    WindowStep::Finished => return Ok(None),
                    WindowStep::Need => {
                        let item = self.pull_raw(&mut runtime.kind).await?;
                        window.feed(item);
                    }
                }
            },
        }
    }

    async fn pull_raw(&self, kind: &mut FlowKind) -> Result<Option<Item>, PipeflowError> {
        match kind {
            FlowKind::Pool { engine, task } => {
                engine.next(*task, self.inner.config.timeout).await
            }
            FlowKind::Inline { input } => {
                let Some(inbox) = input.pull().await else {
                    return Ok(None);
                };
                let item = match classify_inbox(inbox, Some(self.name())) {
                    Err(passthrough) => passthrough,
                    Ok(values) => {
                        let item = execute_inbox(&self.inner.unit, Some(self.name()), &values);
                        if self.inner.config.track {
                            self.inner
                                .tracked_inline
                                .lock()
                                .push((values, item.clone()));
                        }
                        item
                    }
                };
                Ok(Some(item))
            }
        }
    }

    fn maybe_finish(&self) {
        if self.inner.tee.lock().all_done() {
            let mut state = self.inner.state.lock();
            if *state == StageState::Started {
                *state = StageState::Finished;
                tracing::debug!(stage = %self.name(), "stage finished");
            }
        }
    }

    /// Releases the stage.
    ///
    /// Engine resources are released by whoever owns the terminal
    /// reference to the pool: the pipeline controller stops each distinct
    /// engine once with its terminal tasks; standalone users call
    /// [`Engine::stop`] themselves.
    ///
    /// # Errors
    ///
    /// Usage error unless started or finished.
    pub fn stop(&self) -> Result<(), PipeflowError> {
        let mut state = self.inner.state.lock();
        match *state {
            StageState::Started | StageState::Finished => {
                *state = StageState::Stopped;
                tracing::debug!(stage = %self.name(), "stage stopped");
                Ok(())
            }
            other => Err(UsageError::new(
                "Stage::stop",
                format!("stage '{}' cannot stop from state {other:?}", self.name()),
            )
            .into()),
        }
    }

    /// Returns the stage to detached, ready for a fresh connect.
    ///
    /// Legal from `Connected`, from `Finished` for inline stages, and
    /// from `Stopped`; a pool-bound stage must be stopped first, and a
    /// started stage cannot disconnect mid-iteration.
    ///
    /// # Errors
    ///
    /// Usage error otherwise.
    pub fn disconnect(&self) -> Result<(), PipeflowError> {
        let mut state = self.inner.state.lock();
        let allowed = match *state {
            StageState::Connected | StageState::Stopped => true,
            StageState::Finished => matches!(self.inner.executor, Executor::Inline),
            _ => false,
        };
        if !allowed {
            return Err(UsageError::new(
                "Stage::disconnect",
                format!(
                    "stage '{}' cannot disconnect from state {:?}",
                    self.name(),
                    *state
                ),
            )
            .into());
        }
        *self.inner.pending_input.lock() = None;
        if let Ok(mut flow) = self.inner.flow.try_lock() {
            *flow = None;
        }
        *self.inner.tee.lock() = TeeBuffer::new();
        *self.inner.task.lock() = None;
        *self.inner.default_tap.lock() = None;
        *state = StageState::Detached;
        tracing::debug!(stage = %self.name(), "stage disconnected");
        Ok(())
    }

    /// Takes the consumed/produced pairs recorded for a tracked stage.
    #[must_use]
    pub fn tracked(&self) -> Vec<(Vec<Value>, Item)> {
        match (&self.inner.executor, *self.inner.task.lock()) {
            (Executor::Pool(engine), Some(task)) => engine.tracked(task),
            _ => std::mem::take(&mut *self.inner.tracked_inline.lock()),
        }
    }
}

/// Adapts one tap of an upstream stage as a pull source.
struct StageTapSource {
    stage: Stage,
    tap: TapId,
}

#[async_trait::async_trait]
impl Source for StageTapSource {
    async fn pull(&mut self) -> Option<Item> {
        loop {
            match self.stage.pull(self.tap).await {
                Ok(item) => return item,
                Err(PipeflowError::Timeout(_)) => continue,
                // An upstream in debug mode re-raises; downstream still
                // sees the failure in-band, nested one more layer at its
                // own boundary.
                Err(PipeflowError::ItemFailure(error)) => {
                    return Some(Item::Failure(Box::new(error)))
                }
                Err(err) => {
                    tracing::warn!(
                        stage = %self.stage.name(),
                        error = %err,
                        "upstream tap closed"
                    );
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::unit::{StepInput, StepRegistry};
    use serde_json::json;

    fn registry() -> StepRegistry {
        let registry = StepRegistry::with_builtins();
        registry
            .register("square", |input: &StepInput<'_>| {
                let n = input
                    .first()?
                    .as_i64()
                    .ok_or_else(|| anyhow::anyhow!("cannot square a non-number"))?;
                Ok(json!(n * n))
            })
            .unwrap();
        registry
            .register("sum", |input: &StepInput<'_>| {
                let total: i64 = input.inbox.iter().filter_map(Value::as_i64).sum();
                Ok(json!(total))
            })
            .unwrap();
        registry
    }

    fn inline_stage(registry: &StepRegistry, step: &str, name: &str) -> Stage {
        Stage::new(
            Unit::new(registry.get(step).unwrap()),
            Executor::Inline,
            StageConfig::new(name),
        )
    }

    async fn drain(stage: &Stage) -> Vec<Item> {
        let mut out = Vec::new();
        loop {
            match stage.next().await {
                Ok(Some(item)) => out.push(item),
                Ok(None) => break,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        out
    }

    fn values(items: Vec<Item>) -> Vec<Value> {
        items.into_iter().filter_map(Item::into_value).collect()
    }

    #[tokio::test]
    async fn test_inline_stage_over_sequence() {
        let registry = registry();
        let stage = inline_stage(&registry, "square", "square");
        stage
            .connect(vec![vec![json!(1), json!(2), json!(3)].into()])
            .unwrap();
        stage.start().unwrap();

        assert_eq!(values(drain(&stage).await), vec![json!(1), json!(4), json!(9)]);
        assert_eq!(stage.state(), StageState::Finished);
    }

    #[tokio::test]
    async fn test_lifecycle_is_strict() {
        let registry = registry();
        let stage = inline_stage(&registry, "square", "square");

        assert!(stage.start().is_err());
        assert!(stage.next().await.is_err());
        stage.connect(vec![vec![json!(1)].into()]).unwrap();
        // Second connect without a disconnect is refused.
        assert!(stage.connect(vec![vec![json!(2)].into()]).is_err());
        assert!(stage.disconnect().is_ok());
        stage.connect(vec![vec![json!(1)].into()]).unwrap();
        stage.start().unwrap();
        // Mid-iteration disconnect is refused.
        assert!(stage.disconnect().is_err());
        let _ = drain(&stage).await;
        assert!(stage.disconnect().is_ok());
        assert_eq!(stage.state(), StageState::Detached);
    }

    #[tokio::test]
    async fn test_chained_inline_stages() {
        let registry = registry();
        registry
            .register("double", |input: &StepInput<'_>| {
                Ok(json!(input.first()?.as_i64().unwrap_or(0) * 2))
            })
            .unwrap();
        let square = inline_stage(&registry, "square", "square");
        let double = inline_stage(&registry, "double", "double");

        square
            .connect(vec![vec![json!(1), json!(2)].into()])
            .unwrap();
        double.connect(vec![square.clone().into()]).unwrap();
        square.start().unwrap();
        double.start().unwrap();

        assert_eq!(values(drain(&double).await), vec![json!(2), json!(8)]);
        // The squares are claimed by the double stage.
        assert!(square.next().await.is_err());
    }

    #[tokio::test]
    async fn test_consume_groups_items() {
        let registry = registry();
        let stage = Stage::new(
            Unit::new(registry.get("sum").unwrap()),
            Executor::Inline,
            StageConfig::new("sum").with_consume(2),
        );
        stage
            .connect(vec![vec![json!(1), json!(2), json!(3), json!(4)].into()])
            .unwrap();
        stage.start().unwrap();
        assert_eq!(values(drain(&stage).await), vec![json!(3), json!(7)]);
    }

    #[tokio::test]
    async fn test_zip_of_parallel_sources() {
        let registry = registry();
        let stage = Stage::new(
            Unit::new(registry.get("sum").unwrap()),
            Executor::Inline,
            StageConfig::new("sum"),
        );
        stage
            .connect(vec![
                vec![json!(1), json!(2)].into(),
                vec![json!(10), json!(20)].into(),
            ])
            .unwrap();
        stage.start().unwrap();
        assert_eq!(values(drain(&stage).await), vec![json!(11), json!(22)]);
    }

    #[tokio::test]
    async fn test_tee_feeds_two_consumers() {
        let registry = registry();
        let source = inline_stage(&registry, "identity", "source");
        let left = inline_stage(&registry, "square", "left");
        let right = inline_stage(&registry, "square", "right");

        source
            .connect(vec![vec![json!(2), json!(3)].into()])
            .unwrap();
        left.connect(vec![source.clone().into()]).unwrap();
        right.connect(vec![source.clone().into()]).unwrap();
        source.start().unwrap();
        left.start().unwrap();
        right.start().unwrap();

        assert_eq!(values(drain(&left).await), vec![json!(4), json!(9)]);
        assert_eq!(values(drain(&right).await), vec![json!(4), json!(9)]);
    }

    #[tokio::test]
    async fn test_failure_wraps_per_stage_and_nests() {
        let registry = registry();
        let square = inline_stage(&registry, "square", "square");
        let double = inline_stage(&registry, "identity", "forward");

        square
            .connect(vec![vec![json!(1), json!("a")].into()])
            .unwrap();
        double.connect(vec![square.clone().into()]).unwrap();
        square.start().unwrap();
        double.start().unwrap();

        let items = drain(&double).await;
        assert_eq!(items[0], Item::Value(json!(1)));
        let error = items[1].as_failure().unwrap();
        assert_eq!(error.depth(), 1);
        assert_eq!(error.stage.as_deref(), Some("forward"));
        assert_eq!(error.origin().stage.as_deref(), Some("square"));
    }

    #[tokio::test]
    async fn test_debug_reraises_then_continues() {
        let registry = registry();
        let stage = Stage::new(
            Unit::new(registry.get("square").unwrap()),
            Executor::Inline,
            StageConfig::new("square").with_debug(true),
        );
        stage
            .connect(vec![vec![json!(1), json!("a"), json!(3)].into()])
            .unwrap();
        stage.start().unwrap();

        assert_eq!(stage.next().await.unwrap(), Some(Item::Value(json!(1))));
        assert!(matches!(
            stage.next().await,
            Err(PipeflowError::ItemFailure(_))
        ));
        assert_eq!(stage.next().await.unwrap(), Some(Item::Value(json!(9))));
        assert_eq!(stage.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pool_stage_matches_inline() {
        let registry = registry();
        let engine = Engine::new(EngineConfig::new().with_worker_num(2));
        let stage = Stage::new(
            Unit::new(registry.get("square").unwrap()),
            Executor::Pool(engine.clone()),
            StageConfig::new("square"),
        );
        stage
            .connect(vec![vec![json!(1), json!(2), json!(3)].into()])
            .unwrap();
        stage.start().unwrap();
        engine.start().unwrap();

        assert_eq!(
            values(drain(&stage).await),
            vec![json!(1), json!(4), json!(9)]
        );
        stage.stop().unwrap();
        engine
            .stop(&[stage.task_handle().unwrap()])
            .unwrap();
        stage.disconnect().unwrap();
    }

    #[tokio::test]
    async fn test_tracking_inline() {
        let registry = registry();
        let stage = Stage::new(
            Unit::new(registry.get("square").unwrap()),
            Executor::Inline,
            StageConfig::new("square").with_track(true),
        );
        stage.connect(vec![vec![json!(3)].into()]).unwrap();
        stage.start().unwrap();
        let _ = drain(&stage).await;

        let tracked = stage.tracked();
        assert_eq!(tracked, vec![(vec![json!(3)], Item::Value(json!(9)))]);
    }

    #[tokio::test]
    async fn test_spawn_aligns_with_produce_sibling() {
        let registry = registry();
        // One branch doubles cardinality via produce, the sibling keeps up
        // via spawn, and a zip downstream sees aligned pairs.
        let produced = Stage::new(
            Unit::new(registry.get("identity").unwrap()),
            Executor::Inline,
            StageConfig::new("produced").with_produce(2),
        );
        let spawned = Stage::new(
            Unit::new(registry.get("identity").unwrap()),
            Executor::Inline,
            StageConfig::new("spawned").with_spawn(2),
        );
        let zip = Stage::new(
            Unit::new(registry.get("sum").unwrap()),
            Executor::Inline,
            StageConfig::new("zip"),
        );

        let input = vec![json!(1), json!(2)];
        produced.connect(vec![input.clone().into()]).unwrap();
        spawned.connect(vec![input.into()]).unwrap();
        zip.connect(vec![produced.clone().into(), spawned.clone().into()])
            .unwrap();
        produced.start().unwrap();
        spawned.start().unwrap();
        zip.start().unwrap();

        let out = drain(&zip).await;
        // Each window is repeated consecutively on both branches, so the
        // zip sees matching pairs throughout.
        let sums: Vec<Value> = out
            .iter()
            .filter_map(|i| i.as_value().cloned())
            .collect();
        assert_eq!(sums, vec![json!(2), json!(2), json!(4), json!(4)]);
    }

    #[test]
    fn test_stage_identity_is_by_handle() {
        let registry = registry();
        let a = inline_stage(&registry, "square", "same");
        let b = inline_stage(&registry, "square", "same");
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }
}
