//! Worker dispatchers.
//!
//! Local threads, local processes and remote peers are interchangeable
//! members of one pool: each exposes the same submit-batch/collect-results
//! contract through [`Dispatcher`], selected when the engine is built.

use crate::engine::wire::{ExecuteOutcome, ExecuteReply, ExecuteRequest, UnitSpec};
use crate::errors::PipeflowError;
use crate::item::{CapturedError, Item};
use crate::unit::Unit;
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// One worker's execution backend: submit a batch of inboxes, get one
/// result item per inbox, in order.
#[async_trait]
pub trait Dispatcher: Send {
    /// Executes the unit over a batch of value inboxes.
    ///
    /// Implementations must return exactly one item per inbox and must
    /// capture any raised condition as [`Item::Failure`] rather than
    /// propagating it.
    async fn dispatch(
        &mut self,
        unit: &Unit,
        stage: Option<&str>,
        inboxes: Vec<Vec<Value>>,
    ) -> Vec<Item>;
}

/// Runs one inbox through the unit, capturing failure as an item.
pub(crate) fn execute_inbox(unit: &Unit, stage: Option<&str>, inbox: &[Value]) -> Item {
    match unit.call(inbox) {
        Ok(value) => Item::Value(value),
        Err(mut error) => {
            if let Some(stage) = stage {
                error = error.with_stage(stage);
            }
            Item::Failure(Box::new(error))
        }
    }
}

/// Splits an inbox into the values a unit call should receive, or the item
/// to forward without calling the unit.
///
/// An upstream failure short-circuits, re-wrapped one layer when a stage
/// name is present; an all-exhausted inbox passes through as the marker.
pub(crate) fn classify_inbox(inbox: Vec<Item>, stage: Option<&str>) -> Result<Vec<Value>, Item> {
    for item in &inbox {
        if let Item::Failure(error) = item {
            let error = match stage {
                Some(stage) => error.as_ref().clone().wrapped(stage),
                None => error.as_ref().clone(),
            };
            return Err(Item::Failure(Box::new(error)));
        }
    }
    let values: Vec<Value> = inbox.into_iter().filter_map(Item::into_value).collect();
    if values.is_empty() {
        Err(Item::Exhausted)
    } else {
        Ok(values)
    }
}

/// Executes unit calls on a blocking thread of the local process.
#[derive(Debug, Default)]
pub struct ThreadDispatcher;

#[async_trait]
impl Dispatcher for ThreadDispatcher {
    async fn dispatch(
        &mut self,
        unit: &Unit,
        stage: Option<&str>,
        inboxes: Vec<Vec<Value>>,
    ) -> Vec<Item> {
        let count = inboxes.len();
        let unit = unit.clone();
        let stage = stage.map(str::to_owned);
        let handle = tokio::task::spawn_blocking(move || {
            inboxes
                .iter()
                .map(|inbox| execute_inbox(&unit, stage.as_deref(), inbox))
                .collect::<Vec<Item>>()
        });
        match handle.await {
            Ok(items) => items,
            Err(err) => {
                let error = CapturedError::new(format!("worker thread failed: {err}"));
                (0..count)
                    .map(|_| Item::Failure(Box::new(error.clone())))
                    .collect()
            }
        }
    }
}

/// Executes unit calls in a spawned child process speaking the JSON-lines
/// wire protocol on stdin/stdout.
///
/// The child command is supplied by the caller (typically the embedding
/// binary re-invoked in a worker mode that calls
/// [`crate::engine::wire::serve_worker`]). Only fully named units can be
/// dispatched here.
pub struct ProcessDispatcher {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ProcessDispatcher {
    /// Spawns the worker child process.
    ///
    /// # Errors
    ///
    /// Returns a usage error for an empty command and an IO error if the
    /// spawn fails.
    pub fn spawn(command: &[String]) -> Result<Self, PipeflowError> {
        let Some((program, args)) = command.split_first() else {
            return Err(crate::errors::UsageError::new(
                "ProcessDispatcher::spawn",
                "process workers require a worker command",
            )
            .into());
        };
        let mut child = Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            PipeflowError::Internal("worker child has no stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            PipeflowError::Internal("worker child has no stdout".to_string())
        })?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    async fn round_trip(&mut self, request: &ExecuteRequest) -> Result<ExecuteReply, String> {
        let mut body =
            serde_json::to_string(request).map_err(|e| format!("encode request: {e}"))?;
        body.push('\n');
        self.stdin
            .write_all(body.as_bytes())
            .await
            .map_err(|e| format!("write to worker process: {e}"))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| format!("flush to worker process: {e}"))?;

        let mut line = String::new();
        let read = self
            .stdout
            .read_line(&mut line)
            .await
            .map_err(|e| format!("read from worker process: {e}"))?;
        if read == 0 {
            return Err("worker process closed its stdout".to_string());
        }
        serde_json::from_str(&line).map_err(|e| format!("decode reply: {e}"))
    }
}

impl Drop for ProcessDispatcher {
    fn drop(&mut self) {
        // kill_on_drop reaps the child; start_kill here avoids a zombie
        // when the runtime is already gone.
        let _ = self.child.start_kill();
    }
}

#[async_trait]
impl Dispatcher for ProcessDispatcher {
    async fn dispatch(
        &mut self,
        unit: &Unit,
        stage: Option<&str>,
        inboxes: Vec<Vec<Value>>,
    ) -> Vec<Item> {
        let count = inboxes.len();
        let spec = match UnitSpec::from_unit(unit) {
            Ok(spec) => spec,
            Err(err) => return failure_batch(count, stage, format!("{err}")),
        };
        let request = ExecuteRequest {
            unit: spec,
            inboxes,
        };
        match self.round_trip(&request).await {
            Ok(reply) if reply.results.len() == count => {
                reply_to_items(reply, stage)
            }
            Ok(reply) => {
                tracing::warn!(
                    expected = count,
                    got = reply.results.len(),
                    "worker process returned a short reply"
                );
                failure_batch(count, stage, "worker process returned a short reply".into())
            }
            Err(message) => {
                tracing::warn!(error = %message, "worker process failed");
                failure_batch(count, stage, message)
            }
        }
    }
}

/// Converts a wire reply into items, attributing errors to the stage.
pub(crate) fn reply_to_items(reply: ExecuteReply, stage: Option<&str>) -> Vec<Item> {
    reply
        .results
        .into_iter()
        .map(|outcome| match outcome {
            ExecuteOutcome::Ok { value } => Item::Value(value),
            ExecuteOutcome::Err { mut error } => {
                if let (Some(stage), None) = (stage, &error.stage) {
                    error = error.with_stage(stage);
                }
                Item::Failure(Box::new(error))
            }
        })
        .collect()
}

/// A batch of identical failures, one per requested inbox.
pub(crate) fn failure_batch(count: usize, stage: Option<&str>, message: String) -> Vec<Item> {
    let mut error = CapturedError::new(message);
    if let Some(stage) = stage {
        error = error.with_stage(stage);
    }
    (0..count)
        .map(|_| Item::Failure(Box::new(error.clone())))
        .collect()
}
