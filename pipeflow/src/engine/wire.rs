//! Wire protocol shared by process and remote workers.
//!
//! One request carries a fully named unit description plus a batch of
//! inboxes; the reply carries one outcome per inbox, in order. Process
//! workers speak this as JSON lines over stdin/stdout; remote peers accept
//! the same request body over HTTP. [`serve_worker`] is the loop an
//! embedding binary runs to act as either kind of peer.

use crate::errors::{PipeflowError, UsageError};
use crate::item::CapturedError;
use crate::unit::{BoundStep, StepRegistry, Unit};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// A single named step with its bound arguments, as persisted or wired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundStepSpec {
    /// Registry name of the step.
    pub step: String,
    /// Bound positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Bound keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

/// A serializable unit description: an ordered list of named bound steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSpec {
    /// The composed steps, in call order.
    pub steps: Vec<BoundStepSpec>,
}

impl UnitSpec {
    /// Describes a unit.
    ///
    /// # Errors
    ///
    /// Returns a usage error if any step lacks a registry name.
    pub fn from_unit(unit: &Unit) -> Result<Self, PipeflowError> {
        let mut steps = Vec::with_capacity(unit.steps().len());
        for bound in unit.steps() {
            let Some(name) = bound.step.name() else {
                return Err(UsageError::new(
                    "UnitSpec::from_unit",
                    "unit contains an inline step without a registry name",
                )
                .into());
            };
            steps.push(BoundStepSpec {
                step: name.to_string(),
                args: bound.args.clone(),
                kwargs: bound.kwargs.clone(),
            });
        }
        Ok(Self { steps })
    }

    /// Rebuilds the unit against a registry.
    ///
    /// # Errors
    ///
    /// Returns [`PipeflowError::UnknownStep`] for unregistered names.
    pub fn build(&self, registry: &StepRegistry) -> Result<Unit, PipeflowError> {
        let mut steps = Vec::with_capacity(self.steps.len());
        for spec in &self.steps {
            let step = registry.get(&spec.step)?;
            steps.push(
                BoundStep::new(step)
                    .with_args(spec.args.clone())
                    .with_kwargs(spec.kwargs.clone()),
            );
        }
        Ok(Unit::from_steps(steps))
    }
}

/// A batch execution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// The unit to apply.
    pub unit: UnitSpec,
    /// One inbox per requested call.
    pub inboxes: Vec<Vec<Value>>,
}

/// Outcome of one inbox in a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecuteOutcome {
    /// The call succeeded.
    Ok {
        /// The computed value.
        value: Value,
    },
    /// The call raised; the condition was captured.
    Err {
        /// The captured error.
        error: CapturedError,
    },
}

/// A batch execution reply, one outcome per requested inbox, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteReply {
    /// The outcomes.
    pub results: Vec<ExecuteOutcome>,
}

impl ExecuteReply {
    /// Executes a request against a registry, capturing per-inbox errors.
    #[must_use]
    pub fn answer(request: &ExecuteRequest, registry: &StepRegistry) -> Self {
        let unit = match request.unit.build(registry) {
            Ok(unit) => unit,
            Err(err) => {
                let error = CapturedError::new(format!("worker cannot build unit: {err}"));
                return Self {
                    results: request
                        .inboxes
                        .iter()
                        .map(|_| ExecuteOutcome::Err {
                            error: error.clone(),
                        })
                        .collect(),
                };
            }
        };
        let results = request
            .inboxes
            .iter()
            .map(|inbox| match unit.call(inbox) {
                Ok(value) => ExecuteOutcome::Ok { value },
                Err(error) => ExecuteOutcome::Err { error },
            })
            .collect();
        Self { results }
    }
}

/// Serves execute requests as JSON lines until EOF.
///
/// Run this over stdin/stdout to act as a process worker, or feed it a
/// socket to serve as a minimal remote peer.
///
/// # Errors
///
/// Returns the underlying IO error if reading or writing fails; malformed
/// request lines are answered with an empty reply and logged instead.
pub async fn serve_worker<R, W>(
    reader: R,
    mut writer: W,
    registry: &StepRegistry,
) -> std::io::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<ExecuteRequest>(&line) {
            Ok(request) => ExecuteReply::answer(&request, registry),
            Err(err) => {
                tracing::warn!(error = %err, "worker received malformed request");
                ExecuteReply {
                    results: Vec::new(),
                }
            }
        };
        let mut body = serde_json::to_string(&reply)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        body.push('\n');
        writer.write_all(body.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Step, StepInput};
    use serde_json::json;

    fn registry() -> StepRegistry {
        let registry = StepRegistry::with_builtins();
        registry
            .register("square", |input: &StepInput<'_>| {
                let n = input
                    .first()?
                    .as_i64()
                    .ok_or_else(|| anyhow::anyhow!("not a number"))?;
                Ok(json!(n * n))
            })
            .unwrap();
        registry
    }

    #[test]
    fn test_unit_spec_round_trip() {
        let registry = registry();
        let unit = Unit::from_steps(vec![
            BoundStep::new(registry.get("square").unwrap()).with_args(vec![json!(1)]),
        ]);
        let spec = UnitSpec::from_unit(&unit).unwrap();
        let rebuilt = spec.build(&registry).unwrap();
        assert_eq!(rebuilt, unit);
    }

    #[test]
    fn test_unnamed_unit_is_rejected() {
        let unit = Unit::new(Step::inline(|input: &StepInput<'_>| {
            Ok(input.first()?.clone())
        }));
        assert!(matches!(
            UnitSpec::from_unit(&unit),
            Err(PipeflowError::Usage(_))
        ));
    }

    #[test]
    fn test_answer_captures_per_inbox_errors() {
        let registry = registry();
        let unit = Unit::new(registry.get("square").unwrap());
        let request = ExecuteRequest {
            unit: UnitSpec::from_unit(&unit).unwrap(),
            inboxes: vec![vec![json!(2)], vec![json!("a")], vec![json!(3)]],
        };
        let reply = ExecuteReply::answer(&request, &registry);
        assert_eq!(reply.results.len(), 3);
        assert!(matches!(&reply.results[0], ExecuteOutcome::Ok { value } if *value == json!(4)));
        assert!(matches!(&reply.results[1], ExecuteOutcome::Err { .. }));
        assert!(matches!(&reply.results[2], ExecuteOutcome::Ok { value } if *value == json!(9)));
    }

    #[tokio::test]
    async fn test_serve_worker_answers_lines() {
        let registry = registry();
        let unit = Unit::new(registry.get("square").unwrap());
        let request = ExecuteRequest {
            unit: UnitSpec::from_unit(&unit).unwrap(),
            inboxes: vec![vec![json!(4)]],
        };
        let mut input = serde_json::to_string(&request).unwrap();
        input.push('\n');

        let mut output = Vec::new();
        serve_worker(input.as_bytes(), &mut output, &registry)
            .await
            .unwrap();

        let reply: ExecuteReply = serde_json::from_slice(&output).unwrap();
        assert!(matches!(&reply.results[0], ExecuteOutcome::Ok { value } if *value == json!(16)));
    }
}
