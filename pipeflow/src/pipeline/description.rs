//! Pipeline persistence.
//!
//! A [`PipelineDescription`] is a declarative, serializable snapshot of a
//! pipeline's topology: engines by name, stages by name with their unit
//! and reshaping parameters, and producer-consumer edges. Loading
//! rebuilds runnable stages against a [`StepRegistry`], so only units
//! composed of registry-named steps can be persisted.

use super::Pipeline;
use crate::engine::wire::UnitSpec;
use crate::engine::{Engine, EngineConfig, RemotePeer, WorkerKind};
use crate::errors::{PipeflowError, UsageError};
use crate::stage::{Executor, Stage, StageConfig};
use crate::unit::StepRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// A named engine configuration, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineDescription {
    /// Engine name stages refer to.
    pub name: String,
    /// Kind of local worker.
    #[serde(default)]
    pub worker_kind: WorkerKind,
    /// Number of local workers.
    pub worker_num: usize,
    /// Batch size per dispatch round-trip.
    pub stride: usize,
    /// Bound on dispatched-but-unretrieved items.
    #[serde(default)]
    pub buffer: Option<usize>,
    /// Submission-order delivery.
    pub ordered: bool,
    /// Discard timed-out slots permanently.
    pub skip: bool,
    /// Remote peers contributing worker slots.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remote: Vec<RemotePeer>,
    /// Command line for process workers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub process_command: Vec<String>,
}

impl EngineDescription {
    /// Snapshots an engine configuration.
    #[must_use]
    pub fn describe(config: &EngineConfig) -> Self {
        Self {
            name: config.name.clone(),
            worker_kind: config.worker_kind,
            worker_num: config.worker_num,
            stride: config.stride,
            buffer: config.buffer,
            ordered: config.ordered,
            skip: config.skip,
            remote: config.remote.clone(),
            process_command: config.process_command.clone(),
        }
    }

    /// Rebuilds the configuration.
    #[must_use]
    pub fn build(&self) -> EngineConfig {
        EngineConfig {
            name: self.name.clone(),
            worker_num: self.worker_num,
            worker_kind: self.worker_kind,
            stride: self.stride,
            buffer: self.buffer,
            ordered: self.ordered,
            skip: self.skip,
            remote: self.remote.clone(),
            process_command: self.process_command.clone(),
        }
    }
}

/// A stage, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescription {
    /// Stage name, unique within the pipeline.
    pub name: String,
    /// The unit, as registry-named bound steps.
    pub unit: UnitSpec,
    /// Name of the bound engine; `None` means inline execution.
    #[serde(default)]
    pub engine: Option<String>,
    /// Consume group size.
    pub consume: usize,
    /// Produce replay count.
    pub produce: usize,
    /// Spawn replay count.
    pub spawn: usize,
    /// Per-pull timeout in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Re-raise captured failures on delivery.
    pub debug: bool,
    /// Record consumed/produced pairs.
    pub track: bool,
}

/// A complete, serializable pipeline topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDescription {
    /// Pipeline name.
    pub name: String,
    /// Engines, keyed by name from the stages.
    pub engines: Vec<EngineDescription>,
    /// Stages in insertion order.
    pub stages: Vec<StageDescription>,
    /// Producer-to-consumer edges as stage name pairs.
    pub edges: Vec<(String, String)>,
}

impl PipelineDescription {
    /// Serializes to pretty JSON.
    ///
    /// # Errors
    ///
    /// [`PipeflowError::Serialization`] on encoding failure.
    pub fn to_json(&self) -> Result<String, PipeflowError> {
        serde_json::to_string_pretty(self)
            .map_err(|err| PipeflowError::Serialization(err.to_string()))
    }

    /// Parses a description from JSON.
    ///
    /// # Errors
    ///
    /// [`PipeflowError::Serialization`] on malformed input.
    pub fn from_json(body: &str) -> Result<Self, PipeflowError> {
        serde_json::from_str(body).map_err(|err| PipeflowError::Serialization(err.to_string()))
    }

    /// Writes the description to a JSON file.
    ///
    /// # Errors
    ///
    /// Serialization or IO errors.
    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<(), PipeflowError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Reads a description from a JSON file.
    ///
    /// # Errors
    ///
    /// Serialization or IO errors.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, PipeflowError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

impl Pipeline {
    /// Snapshots the pipeline topology.
    ///
    /// # Errors
    ///
    /// Usage error when stage names collide, or when any stage's unit
    /// contains a step without a registry name.
    pub fn save(&self) -> Result<PipelineDescription, PipeflowError> {
        let mut engines: Vec<(Engine, EngineDescription)> = Vec::new();
        let mut stages = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for stage in self.dag().stages() {
            if !seen.insert(stage.name().to_string()) {
                return Err(UsageError::new(
                    "Pipeline::save",
                    format!("duplicate stage name '{}'", stage.name()),
                )
                .into());
            }
            let engine = match stage.executor() {
                Executor::Inline => None,
                Executor::Pool(engine) => {
                    let config = engine.config();
                    match engines.iter().find(|(pool, _)| pool.same_pool(engine)) {
                        Some((_, described)) => Some(described.name.clone()),
                        None => {
                            if engines.iter().any(|(_, d)| d.name == config.name) {
                                return Err(UsageError::new(
                                    "Pipeline::save",
                                    format!("duplicate engine name '{}'", config.name),
                                )
                                .into());
                            }
                            let described = EngineDescription::describe(config);
                            let name = described.name.clone();
                            engines.push((engine.clone(), described));
                            Some(name)
                        }
                    }
                }
            };
            let config = stage.config();
            stages.push(StageDescription {
                name: config.name.clone(),
                unit: UnitSpec::from_unit(stage.unit())?,
                engine,
                consume: config.consume,
                produce: config.produce,
                spawn: config.spawn,
                timeout_ms: config
                    .timeout
                    .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
                debug: config.debug,
                track: config.track,
            });
        }

        Ok(PipelineDescription {
            name: self.name().to_string(),
            engines: engines.into_iter().map(|(_, d)| d).collect(),
            stages,
            edges: self.dag().named_edges(),
        })
    }

    /// Rebuilds an unconnected pipeline from a description.
    ///
    /// Each named engine becomes one shared pool; stages resolve their
    /// units against the registry.
    ///
    /// # Errors
    ///
    /// [`PipeflowError::UnknownStep`] for unregistered step names;
    /// [`PipeflowError::UnknownEngine`] or
    /// [`PipeflowError::UnknownStage`] for dangling references;
    /// cycle errors if the edge list does not form a dag.
    pub fn load(
        description: &PipelineDescription,
        registry: &StepRegistry,
    ) -> Result<Self, PipeflowError> {
        let engines: HashMap<&str, Engine> = description
            .engines
            .iter()
            .map(|spec| (spec.name.as_str(), Engine::new(spec.build())))
            .collect();

        let mut pipeline = Self::new(description.name.clone());
        let mut handles = HashMap::new();
        for spec in &description.stages {
            let executor = match &spec.engine {
                None => Executor::Inline,
                Some(name) => engines
                    .get(name.as_str())
                    .cloned()
                    .map(Executor::Pool)
                    .ok_or_else(|| PipeflowError::UnknownEngine(name.clone()))?,
            };
            let mut config = StageConfig::new(spec.name.clone())
                .with_consume(spec.consume)
                .with_produce(spec.produce)
                .with_spawn(spec.spawn)
                .with_debug(spec.debug)
                .with_track(spec.track);
            if let Some(ms) = spec.timeout_ms {
                config = config.with_timeout(Duration::from_millis(ms));
            }
            let stage = Stage::new(spec.unit.build(registry)?, executor, config);
            let id = pipeline.add_stage(stage)?;
            handles.insert(spec.name.clone(), id);
        }
        for (producer, consumer) in &description.edges {
            let from = *handles
                .get(producer)
                .ok_or_else(|| PipeflowError::UnknownStage(producer.clone()))?;
            let to = *handles
                .get(consumer)
                .ok_or_else(|| PipeflowError::UnknownStage(consumer.clone()))?;
            pipeline.add_edge(from, to)?;
        }
        Ok(pipeline)
    }
}
