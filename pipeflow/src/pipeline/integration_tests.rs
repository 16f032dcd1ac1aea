//! End-to-end pipeline runs mixing executors, reshaping and persistence.

use super::{Pipeline, PipelineState};
use crate::engine::{Engine, EngineConfig};
use crate::errors::PipeflowError;
use crate::stage::{Executor, Stage, StageConfig};
use crate::unit::{StepInput, StepRegistry, Unit};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::BTreeSet;

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
        .register("double", |input: &StepInput<'_>| {
            Ok(json!(input.first()?.as_i64().unwrap_or(0) * 2))
        })
        .unwrap();
    registry
}

fn stage(registry: &StepRegistry, step: &str, name: &str, executor: Executor) -> Stage {
    Stage::new(
        Unit::new(registry.get(step).unwrap()),
        executor,
        StageConfig::new(name).with_track(true),
    )
}

fn tracked_values(pipeline: &Pipeline, stage: &str) -> Vec<Value> {
    pipeline.stats().tracked[stage]
        .iter()
        .filter_map(|(_, item)| item.as_value().cloned())
        .collect()
}

/// Runs the square, double, report chain over 1..=4. The report stage is a
/// pass-through sink that records whatever reaches the end of the line.
async fn run_square_double_report(executor_for: impl Fn(&str) -> Executor) -> Pipeline {
    let registry = registry();
    let mut pipeline = Pipeline::new("square-double-report");
    let square = pipeline
        .add_stage(stage(&registry, "square", "square", executor_for("square")))
        .unwrap();
    let double = pipeline
        .add_stage(stage(&registry, "double", "double", executor_for("double")))
        .unwrap();
    let report = pipeline
        .add_stage(stage(&registry, "identity", "report", executor_for("report")))
        .unwrap();
    pipeline.add_pipe(&[square, double, report]).unwrap();

    pipeline
        .start(vec![vec![json!(1), json!(2), json!(3), json!(4)]])
        .unwrap();
    pipeline.run().unwrap();
    pipeline.wait().await.unwrap();
    pipeline.stop().unwrap();
    pipeline
}

#[tokio::test]
async fn test_three_stage_flow_inline() {
    let pipeline = run_square_double_report(|_| Executor::Inline).await;
    assert_eq!(
        tracked_values(&pipeline, "double"),
        vec![json!(2), json!(8), json!(18), json!(32)]
    );
    assert_eq!(
        tracked_values(&pipeline, "report"),
        vec![json!(2), json!(8), json!(18), json!(32)]
    );
}

#[tokio::test]
async fn test_three_stage_flow_on_shared_pool() {
    let engine = Engine::new(EngineConfig::new().with_worker_num(2));
    let pipeline = run_square_double_report(|_| Executor::Pool(engine.clone())).await;
    // Submission-order pools keep the stream ordered end to end.
    assert_eq!(
        tracked_values(&pipeline, "report"),
        vec![json!(2), json!(8), json!(18), json!(32)]
    );
}

#[tokio::test]
async fn test_unordered_pool_preserves_the_set() {
    let engine = Engine::new(
        EngineConfig::new()
            .with_worker_num(4)
            .with_ordered(false),
    );
    let registry = registry();
    let mut pipeline = Pipeline::new("unordered");
    pipeline
        .add_stage(stage(&registry, "square", "square", Executor::Pool(engine)))
        .unwrap();
    pipeline
        .start(vec![vec![json!(1), json!(2), json!(3), json!(4)]])
        .unwrap();
    pipeline.run().unwrap();
    pipeline.wait().await.unwrap();
    pipeline.stop().unwrap();

    let squares: BTreeSet<i64> = tracked_values(&pipeline, "square")
        .iter()
        .filter_map(Value::as_i64)
        .collect();
    assert_eq!(squares, BTreeSet::from([1, 4, 9, 16]));
}

#[tokio::test]
async fn test_failures_flow_in_band_through_the_pipeline() {
    let registry = registry();
    let mut pipeline = Pipeline::new("faulty");
    let square = pipeline
        .add_stage(stage(&registry, "square", "square", Executor::Inline))
        .unwrap();
    let double = pipeline
        .add_stage(stage(&registry, "double", "double", Executor::Inline))
        .unwrap();
    pipeline.add_edge(square, double).unwrap();

    pipeline
        .start(vec![vec![json!(1), json!("a"), json!(3)]])
        .unwrap();
    pipeline.run().unwrap();
    pipeline.wait().await.unwrap();
    pipeline.stop().unwrap();

    let tracked = &pipeline.stats().tracked["square"];
    assert_eq!(tracked.len(), 3);
    assert!(tracked[1].1.is_failure());
    // The healthy neighbours were unaffected.
    assert_eq!(
        tracked_values(&pipeline, "square"),
        vec![json!(1), json!(9)]
    );
}

#[tokio::test]
async fn test_diamond_topology_tees_and_rejoins() {
    let registry = registry();
    let mut pipeline = Pipeline::new("diamond");
    registry
        .register("sum", |input: &StepInput<'_>| {
            let total: i64 = input.inbox.iter().filter_map(Value::as_i64).sum();
            Ok(json!(total))
        })
        .unwrap();

    let source = pipeline
        .add_stage(stage(&registry, "identity", "source", Executor::Inline))
        .unwrap();
    let squares = pipeline
        .add_stage(stage(&registry, "square", "squares", Executor::Inline))
        .unwrap();
    let doubles = pipeline
        .add_stage(stage(&registry, "double", "doubles", Executor::Inline))
        .unwrap();
    let join = pipeline
        .add_stage(stage(&registry, "sum", "join", Executor::Inline))
        .unwrap();
    pipeline.add_pipe(&[source, squares, join]).unwrap();
    pipeline.add_pipe(&[source, doubles, join]).unwrap();

    pipeline.start(vec![vec![json!(2), json!(3)]]).unwrap();
    pipeline.run().unwrap();
    pipeline.wait().await.unwrap();
    pipeline.stop().unwrap();

    // n*n + 2n for each input.
    assert_eq!(tracked_values(&pipeline, "join"), vec![json!(8), json!(15)]);
}

#[tokio::test]
async fn test_saved_pipeline_runs_after_reload() {
    let registry = registry();
    let mut original = Pipeline::new("reloadable");
    let square = original
        .add_stage(stage(&registry, "square", "square", Executor::Inline))
        .unwrap();
    let double = original
        .add_stage(stage(&registry, "double", "double", Executor::Inline))
        .unwrap();
    original.add_edge(square, double).unwrap();

    let description = original.save().unwrap();
    let mut reloaded = Pipeline::load(&description, &registry).unwrap();
    assert_eq!(reloaded.state(), PipelineState::Unconnected);

    reloaded.start(vec![vec![json!(3)]]).unwrap();
    reloaded.run().unwrap();
    reloaded.wait().await.unwrap();
    reloaded.stop().unwrap();
    assert_eq!(tracked_values(&reloaded, "double"), vec![json!(18)]);
}

#[tokio::test]
async fn test_cycles_cannot_enter_a_pipeline() {
    let registry = registry();
    let mut pipeline = Pipeline::new("cyclic");
    let a = pipeline
        .add_stage(stage(&registry, "identity", "a", Executor::Inline))
        .unwrap();
    let b = pipeline
        .add_stage(stage(&registry, "identity", "b", Executor::Inline))
        .unwrap();
    pipeline.add_edge(a, b).unwrap();
    assert!(matches!(
        pipeline.add_edge(b, a),
        Err(PipeflowError::Cycle(_))
    ));
}

#[tokio::test]
async fn test_consume_stage_inside_a_pipeline() {
    let registry = registry();
    registry
        .register("sum", |input: &StepInput<'_>| {
            let total: i64 = input.inbox.iter().filter_map(Value::as_i64).sum();
            Ok(json!(total))
        })
        .unwrap();
    let mut pipeline = Pipeline::new("grouped");
    pipeline
        .add_stage(Stage::new(
            Unit::new(registry.get("sum").unwrap()),
            Executor::Inline,
            StageConfig::new("pairs").with_consume(2).with_track(true),
        ))
        .unwrap();

    pipeline
        .start(vec![vec![json!(1), json!(2), json!(3), json!(4), json!(5)]])
        .unwrap();
    pipeline.run().unwrap();
    pipeline.wait().await.unwrap();
    pipeline.stop().unwrap();

    // The odd tail is padded, so the last group sums alone.
    assert_eq!(
        tracked_values(&pipeline, "pairs"),
        vec![json!(3), json!(7), json!(5)]
    );
}
