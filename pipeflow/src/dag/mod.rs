//! The stage topology.
//!
//! A [`StageDag`] owns stages and the directed acyclic graph between
//! them. Acyclicity is enforced eagerly at every edge insertion, so a
//! topological order always exists and downstream wiring can proceed
//! producers first.

use crate::errors::{CycleError, PipeflowError, UsageError};
use crate::graph::Graph;
use crate::stage::{Stage, UpstreamSource};
use serde_json::Value;
use std::collections::HashMap;

/// Opaque handle to a stage inside a [`StageDag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageId(u64);

/// A directed acyclic graph of stages.
#[derive(Debug, Default)]
pub struct StageDag {
    graph: Graph<StageId>,
    stages: HashMap<StageId, Stage>,
}

impl StageDag {
    /// Creates an empty dag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true when the dag holds no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Adds an isolated stage, returning its handle. Adding the same
    /// stage twice yields the same handle.
    pub fn add_stage(&mut self, stage: Stage) -> StageId {
        let id = StageId(stage.id());
        self.graph.add_node(id);
        self.stages.entry(id).or_insert(stage);
        id
    }

    /// Resolves a handle.
    #[must_use]
    pub fn get(&self, id: StageId) -> Option<&Stage> {
        self.stages.get(&id)
    }

    /// Resolves a stage back to its handle.
    #[must_use]
    pub fn find(&self, stage: &Stage) -> Option<StageId> {
        let id = StageId(stage.id());
        self.stages.contains_key(&id).then_some(id)
    }

    /// Adds a producer-to-consumer edge.
    ///
    /// # Errors
    ///
    /// [`PipeflowError::UnknownStage`] for a stale handle;
    /// [`PipeflowError::Cycle`] when the edge would close a cycle, in
    /// which case the dag is left unchanged.
    pub fn add_edge(&mut self, producer: StageId, consumer: StageId) -> Result<(), PipeflowError> {
        for id in [producer, consumer] {
            if !self.stages.contains_key(&id) {
                return Err(PipeflowError::UnknownStage(format!("{id:?}")));
            }
        }
        if producer == consumer || self.graph.has_path(&consumer, &producer) {
            let mut path: Vec<String> = self
                .graph
                .find_path(&consumer, &producer)
                .unwrap_or_else(|| vec![consumer, producer])
                .iter()
                .map(|id| self.stage_name(*id))
                .collect();
            path.push(self.stage_name(consumer));
            return Err(CycleError::new(path).into());
        }
        self.graph.add_edge(producer, consumer);
        Ok(())
    }

    /// Adds a linear chain of edges through the given stages.
    ///
    /// # Errors
    ///
    /// Same as [`StageDag::add_edge`]; on failure the edges added so far
    /// in this call are rolled back.
    pub fn add_pipe(&mut self, chain: &[StageId]) -> Result<(), PipeflowError> {
        let mut added = Vec::new();
        for pair in chain.windows(2) {
            if let Err(err) = self.add_edge(pair[0], pair[1]) {
                for (from, to) in added {
                    self.graph.del_edge(&from, &to);
                }
                return Err(err);
            }
            added.push((pair[0], pair[1]));
        }
        Ok(())
    }

    /// Removes a stage.
    ///
    /// A stage that still has producers feeding it is only removed when
    /// `forced`, which also detaches every edge touching it.
    ///
    /// # Errors
    ///
    /// [`PipeflowError::UnknownStage`] for a stale handle; usage error for
    /// an unforced removal of a consumer stage.
    pub fn del_stage(&mut self, id: StageId, forced: bool) -> Result<(), PipeflowError> {
        if !self.stages.contains_key(&id) {
            return Err(PipeflowError::UnknownStage(format!("{id:?}")));
        }
        if !forced && !self.graph.incoming(&id).is_empty() {
            return Err(UsageError::new(
                "StageDag::del_stage",
                format!(
                    "stage '{}' still has producers; remove with force to detach them",
                    self.stage_name(id)
                ),
            )
            .into());
        }
        self.graph.del_node(&id);
        self.stages.remove(&id);
        Ok(())
    }

    /// The stages with no upstream, in insertion order.
    #[must_use]
    pub fn inputs(&self) -> Vec<StageId> {
        self.graph
            .nodes()
            .into_iter()
            .filter(|id| self.graph.incoming(id).is_empty())
            .collect()
    }

    /// The stages with no downstream, in insertion order.
    #[must_use]
    pub fn outputs(&self) -> Vec<StageId> {
        self.graph
            .nodes()
            .into_iter()
            .filter(|id| self.graph.outgoing(id).is_empty())
            .collect()
    }

    /// The stages in a producers-first order.
    #[must_use]
    pub fn topological(&self) -> Vec<StageId> {
        self.graph.topological()
    }

    /// Wires every stage to its upstream, producers first.
    ///
    /// Input stages (no upstream edges) are bound to the given sequences,
    /// one per input stage in insertion order; every other stage is bound
    /// to the output taps of its direct producers.
    ///
    /// # Errors
    ///
    /// Usage error when the sequence count does not match the input
    /// stages, plus everything [`Stage::connect`] reports.
    pub fn connect(&self, inputs: Vec<Vec<Value>>) -> Result<(), PipeflowError> {
        let entry_points = self.inputs();
        if entry_points.len() != inputs.len() {
            return Err(UsageError::new(
                "StageDag::connect",
                format!(
                    "{} input sequence(s) supplied for {} input stage(s)",
                    inputs.len(),
                    entry_points.len()
                ),
            )
            .into());
        }
        let mut sequences: HashMap<StageId, Vec<Value>> =
            entry_points.into_iter().zip(inputs).collect();

        for id in self.topological() {
            let stage = self
                .stages
                .get(&id)
                .ok_or_else(|| PipeflowError::UnknownStage(format!("{id:?}")))?;
            let sources: Vec<UpstreamSource> = if let Some(values) = sequences.remove(&id) {
                vec![UpstreamSource::Sequence(values)]
            } else {
                self.graph
                    .incoming(&id)
                    .iter()
                    .map(|up| {
                        self.stages
                            .get(up)
                            .cloned()
                            .map(UpstreamSource::Stage)
                            .ok_or_else(|| PipeflowError::UnknownStage(format!("{up:?}")))
                    })
                    .collect::<Result<_, _>>()?
            };
            stage.connect(sources)?;
        }
        Ok(())
    }

    /// Iterates the stages in insertion order.
    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.graph
            .nodes()
            .into_iter()
            .filter_map(move |id| self.stages.get(&id))
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// The producer-consumer edges as stage name pairs.
    #[must_use]
    pub fn named_edges(&self) -> Vec<(String, String)> {
        self.graph
            .edges()
            .into_iter()
            .map(|(from, to)| (self.stage_name(from), self.stage_name(to)))
            .collect()
    }

    fn stage_name(&self, id: StageId) -> String {
        self.stages
            .get(&id)
            .map_or_else(|| format!("{id:?}"), |s| s.name().to_string())
    }
}
