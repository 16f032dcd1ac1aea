//! The pipeline controller.
//!
//! A [`Pipeline`] owns a [`StageDag`] and drives it through one run:
//! connect the topology to its inputs, start stages and their engines,
//! pump the sink stages to completion, and release everything in reverse
//! order. Runs can be paused and resumed, and a finished run leaves
//! per-stage tracking data behind in [`PipelineStats`].

pub mod description;

use crate::dag::{StageDag, StageId};
use crate::errors::{PipeflowError, UsageError};
use crate::item::Item;
use crate::stage::{Executor, Stage};
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Lifecycle state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Topology declared, inputs not bound.
    Unconnected,
    /// Inputs bound, nothing running.
    Connected,
    /// Stages and engines running, sinks not being pumped.
    Started,
    /// Sinks are being pumped to completion.
    Running,
    /// Pumping suspended; resume or stop.
    Paused,
    /// Run finished and resources released.
    Stopped,
}

/// Statistics for one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    /// Wall-clock time between start and stop.
    pub run_time: Duration,
    /// When the run started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run was stopped.
    pub finished_at: Option<DateTime<Utc>>,
    /// Consumed/produced pairs per tracked stage, keyed by stage name.
    pub tracked: HashMap<String, Vec<(Vec<Value>, Item)>>,
}

/// A runnable flow of stages.
pub struct Pipeline {
    name: String,
    run_id: Option<Uuid>,
    dag: StageDag,
    state: PipelineState,
    puller: Option<JoinHandle<()>>,
    pause: watch::Sender<bool>,
    run_started: Option<Instant>,
    stats: PipelineStats,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("run_id", &self.run_id)
            .field("stages", &self.dag.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            name: name.into(),
            run_id: None,
            dag: StageDag::new(),
            state: PipelineState::Unconnected,
            puller: None,
            pause,
            run_started: None,
            stats: PipelineStats::default(),
        }
    }

    /// The pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The identifier of the current run, if one has started.
    #[must_use]
    pub fn run_id(&self) -> Option<Uuid> {
        self.run_id
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// The owned topology.
    #[must_use]
    pub fn dag(&self) -> &StageDag {
        &self.dag
    }

    /// Adds a stage to the topology.
    ///
    /// # Errors
    ///
    /// Usage error once the pipeline is connected.
    pub fn add_stage(&mut self, stage: Stage) -> Result<StageId, PipeflowError> {
        self.require_state("Pipeline::add_stage", PipelineState::Unconnected)?;
        Ok(self.dag.add_stage(stage))
    }

    /// Adds a producer-to-consumer edge.
    ///
    /// # Errors
    ///
    /// Usage error once connected; cycle error per [`StageDag::add_edge`].
    pub fn add_edge(&mut self, producer: StageId, consumer: StageId) -> Result<(), PipeflowError> {
        self.require_state("Pipeline::add_edge", PipelineState::Unconnected)?;
        self.dag.add_edge(producer, consumer)
    }

    /// Adds a linear chain of edges.
    ///
    /// # Errors
    ///
    /// Same as [`Pipeline::add_edge`].
    pub fn add_pipe(&mut self, chain: &[StageId]) -> Result<(), PipeflowError> {
        self.require_state("Pipeline::add_pipe", PipelineState::Unconnected)?;
        self.dag.add_pipe(chain)
    }

    /// Binds the topology to its input sequences, one per input stage.
    ///
    /// # Errors
    ///
    /// Usage error when already connected, plus everything
    /// [`StageDag::connect`] reports.
    pub fn connect(&mut self, inputs: Vec<Vec<Value>>) -> Result<(), PipeflowError> {
        self.require_state("Pipeline::connect", PipelineState::Unconnected)?;
        self.dag.connect(inputs)?;
        self.state = PipelineState::Connected;
        Ok(())
    }

    /// Starts every stage producers-first, then each distinct engine once.
    ///
    /// Connects first when still unconnected. After this the sink stages
    /// are iterable; [`Pipeline::run`] pumps them in the background.
    ///
    /// # Errors
    ///
    /// Usage error from any other state, plus stage and engine start
    /// errors.
    pub fn start(&mut self, inputs: Vec<Vec<Value>>) -> Result<(), PipeflowError> {
        match self.state {
            PipelineState::Unconnected => self.connect(inputs)?,
            PipelineState::Connected => {
                if !inputs.is_empty() {
                    return Err(UsageError::new(
                        "Pipeline::start",
                        "inputs were already bound by connect",
                    )
                    .into());
                }
            }
            state => {
                return Err(UsageError::new(
                    "Pipeline::start",
                    format!("cannot start from state {state:?}"),
                )
                .into())
            }
        }

        for id in self.dag.topological() {
            if let Some(stage) = self.dag.get(id) {
                stage.start()?;
            }
        }
        for engine in self.distinct_engines() {
            engine.start()?;
        }

        let run_id = Uuid::new_v4();
        self.run_id = Some(run_id);
        self.run_started = Some(Instant::now());
        self.stats = PipelineStats {
            started_at: Some(Utc::now()),
            ..PipelineStats::default()
        };
        self.state = PipelineState::Started;
        tracing::info!(pipeline = %self.name, %run_id, "pipeline started");
        Ok(())
    }

    /// Pumps every sink stage to end-of-stream in a background task.
    ///
    /// # Errors
    ///
    /// Usage error unless started.
    pub fn run(&mut self) -> Result<(), PipeflowError> {
        self.require_state("Pipeline::run", PipelineState::Started)?;
        let sinks: Vec<Stage> = self
            .dag
            .outputs()
            .into_iter()
            .filter_map(|id| self.dag.get(id).cloned())
            .collect();
        let pause = self.pause.subscribe();
        let name = self.name.clone();
        let _ = self.pause.send(false);
        self.puller = Some(tokio::spawn(async move {
            let mut pulls: FuturesUnordered<_> = sinks
                .into_iter()
                .map(|sink| drain_sink(sink, pause.clone()))
                .collect();
            let mut total = 0_usize;
            while let Some(count) = pulls.next().await {
                total += count;
            }
            tracing::info!(pipeline = %name, items = total, "pipeline run complete");
        }));
        self.state = PipelineState::Running;
        Ok(())
    }

    /// Suspends pumping at the next item boundary.
    ///
    /// # Errors
    ///
    /// Usage error unless running.
    pub fn pause(&mut self) -> Result<(), PipeflowError> {
        self.require_state("Pipeline::pause", PipelineState::Running)?;
        let _ = self.pause.send(true);
        self.state = PipelineState::Paused;
        Ok(())
    }

    /// Resumes a paused run.
    ///
    /// # Errors
    ///
    /// Usage error unless paused.
    pub fn resume(&mut self) -> Result<(), PipeflowError> {
        self.require_state("Pipeline::resume", PipelineState::Paused)?;
        let _ = self.pause.send(false);
        self.state = PipelineState::Running;
        Ok(())
    }

    /// Waits until every sink reaches end-of-stream.
    ///
    /// Leaves the pipeline in the started state, ready for
    /// [`Pipeline::stop`].
    ///
    /// # Errors
    ///
    /// Usage error unless running.
    pub async fn wait(&mut self) -> Result<(), PipeflowError> {
        self.require_state("Pipeline::wait", PipelineState::Running)?;
        if let Some(puller) = self.puller.take() {
            puller
                .await
                .map_err(|err| PipeflowError::Internal(format!("sink pump failed: {err}")))?;
        }
        self.state = PipelineState::Started;
        Ok(())
    }

    /// Stops the run: sinks stop being pumped, stages stop consumers
    /// first, and each distinct engine is released once. Harvests
    /// tracking data into the run statistics.
    ///
    /// A running pipeline must be paused (or waited on) first.
    ///
    /// # Errors
    ///
    /// Usage error from any state but started or paused.
    pub fn stop(&mut self) -> Result<(), PipeflowError> {
        if !matches!(
            self.state,
            PipelineState::Started | PipelineState::Paused
        ) {
            return Err(UsageError::new(
                "Pipeline::stop",
                format!("cannot stop from state {:?}", self.state),
            )
            .into());
        }
        if let Some(puller) = self.puller.take() {
            puller.abort();
        }

        let order = self.dag.topological();
        for id in order.iter().rev() {
            if let Some(stage) = self.dag.get(*id) {
                stage.stop()?;
            }
        }
        for (engine, tasks) in self.engine_tasks() {
            engine.stop(&tasks)?;
        }
        for id in &order {
            if let Some(stage) = self.dag.get(*id) {
                if stage.config().track {
                    self.stats
                        .tracked
                        .insert(stage.name().to_string(), stage.tracked());
                }
            }
        }

        self.stats.finished_at = Some(Utc::now());
        self.stats.run_time = self
            .run_started
            .take()
            .map(|started| started.elapsed())
            .unwrap_or_default();
        self.state = PipelineState::Stopped;
        tracing::info!(pipeline = %self.name, run_time = ?self.stats.run_time, "pipeline stopped");
        Ok(())
    }

    /// Statistics for the current or most recent run.
    #[must_use]
    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    fn require_state(
        &self,
        operation: &str,
        expected: PipelineState,
    ) -> Result<(), PipeflowError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(UsageError::new(
                operation,
                format!("requires state {expected:?}, found {:?}", self.state),
            )
            .into())
        }
    }

    fn distinct_engines(&self) -> Vec<crate::engine::Engine> {
        let mut engines: Vec<crate::engine::Engine> = Vec::new();
        for stage in self.dag.stages() {
            if let Executor::Pool(engine) = stage.executor() {
                if !engines.iter().any(|seen| seen.same_pool(engine)) {
                    engines.push(engine.clone());
                }
            }
        }
        engines
    }

    fn engine_tasks(&self) -> Vec<(crate::engine::Engine, Vec<crate::engine::TaskHandle>)> {
        let mut groups: Vec<(crate::engine::Engine, Vec<crate::engine::TaskHandle>)> = Vec::new();
        for stage in self.dag.stages() {
            let Executor::Pool(engine) = stage.executor() else {
                continue;
            };
            let Some(task) = stage.task_handle() else {
                continue;
            };
            match groups.iter_mut().find(|(seen, _)| seen.same_pool(engine)) {
                Some((_, tasks)) => tasks.push(task),
                None => groups.push((engine.clone(), vec![task])),
            }
        }
        groups
    }
}

async fn drain_sink(sink: Stage, mut paused: watch::Receiver<bool>) -> usize {
    let mut count = 0_usize;
    loop {
        while *paused.borrow() {
            if paused.changed().await.is_err() {
                return count;
            }
        }
        match sink.next().await {
            Ok(Some(_)) => count += 1,
            Ok(None) => return count,
            Err(PipeflowError::Timeout(_)) => {}
            Err(err) => {
                // Debug-mode sinks re-raise failures; the slot is consumed,
                // so pumping continues.
                tracing::warn!(stage = %sink.name(), error = %err, "sink pull failed");
                count += 1;
            }
        }
    }
}

#[cfg(test)]
mod integration_tests;
