//! Units: composable step callables.
//!
//! A step is a plain callable taking an inbox (the upstream results) plus
//! its bound positional and keyword arguments. A [`Unit`] composes an
//! ordered sequence of bound steps into one callable: step *i*'s output is
//! threaded into step *i + 1* as a one-element inbox. Steps registered by
//! name in a [`StepRegistry`] are what make units serializable and
//! dispatchable to process or remote workers.

use crate::errors::{PipeflowError, UsageError};
use crate::item::CapturedError;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Input to a single step invocation.
#[derive(Debug)]
pub struct StepInput<'a> {
    /// The upstream results this call consumes. One element per consumed
    /// item or upstream source; exactly one inside a unit chain.
    pub inbox: &'a [Value],
    /// Positional arguments bound at construction time.
    pub args: &'a [Value],
    /// Keyword arguments bound at construction time.
    pub kwargs: &'a Map<String, Value>,
}

impl StepInput<'_> {
    /// Borrows the first inbox slot, the common case for chained steps.
    pub fn first(&self) -> anyhow::Result<&Value> {
        self.inbox
            .first()
            .ok_or_else(|| anyhow::anyhow!("empty inbox"))
    }
}

/// The step-callable contract.
pub type StepFn = dyn Fn(&StepInput<'_>) -> anyhow::Result<Value> + Send + Sync;

/// A step callable, optionally carrying a registry name.
///
/// Named steps compare equal by name; inline steps compare by function
/// identity. Only fully named units can be persisted or sent to process
/// and remote workers.
#[derive(Clone)]
pub struct Step {
    name: Option<String>,
    func: Arc<StepFn>,
}

impl Step {
    /// Creates a named step. Prefer registering through a [`StepRegistry`].
    pub fn named<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&StepInput<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: Some(name.into()),
            func: Arc::new(func),
        }
    }

    /// Creates an anonymous inline step.
    pub fn inline<F>(func: F) -> Self
    where
        F: Fn(&StepInput<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: None,
            func: Arc::new(func),
        }
    }

    /// The registry name, if this step has one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Invokes the step.
    pub fn call(&self, input: &StepInput<'_>) -> anyhow::Result<Value> {
        (self.func)(input)
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Step {
    fn eq(&self, other: &Self) -> bool {
        match (&self.name, &other.name) {
            (Some(a), Some(b)) => a == b,
            (None, None) => Arc::ptr_eq(&self.func, &other.func),
            _ => false,
        }
    }
}

/// A step with its bound positional and keyword arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStep {
    /// The step callable.
    pub step: Step,
    /// Bound positional arguments, appended to every call.
    pub args: Vec<Value>,
    /// Bound keyword arguments, appended to every call.
    pub kwargs: Map<String, Value>,
}

impl BoundStep {
    /// Binds a step with no arguments.
    #[must_use]
    pub fn new(step: Step) -> Self {
        Self {
            step,
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// Sets the positional arguments.
    #[must_use]
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Sets the keyword arguments.
    #[must_use]
    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }
}

impl From<Step> for BoundStep {
    fn from(step: Step) -> Self {
        Self::new(step)
    }
}

/// An ordered sequence of bound steps composed into one callable.
///
/// Two units with pairwise-equal steps and bound arguments compare equal
/// but remain distinct instances; there is no interning.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    steps: Vec<BoundStep>,
}

impl Unit {
    /// Wraps a single bound step.
    #[must_use]
    pub fn new(step: impl Into<BoundStep>) -> Self {
        Self {
            steps: vec![step.into()],
        }
    }

    /// Builds a unit from a sequence of bound steps.
    #[must_use]
    pub fn from_steps(steps: Vec<BoundStep>) -> Self {
        Self { steps }
    }

    /// Builds a unit from existing units, flattening rather than nesting.
    #[must_use]
    pub fn from_units<I: IntoIterator<Item = Unit>>(units: I) -> Self {
        Self {
            steps: units.into_iter().flat_map(|u| u.steps).collect(),
        }
    }

    /// The composed steps, in call order.
    #[must_use]
    pub fn steps(&self) -> &[BoundStep] {
        &self.steps
    }

    /// True if every step carries a registry name, making the unit
    /// serializable and remotable.
    #[must_use]
    pub fn is_named(&self) -> bool {
        self.steps.iter().all(|s| s.step.name().is_some())
    }

    /// Calls the unit on an inbox, threading each step's output into the
    /// next as a one-element inbox.
    ///
    /// # Errors
    ///
    /// A failing step aborts the call; the returned [`CapturedError`]
    /// records the step's position.
    pub fn call(&self, inbox: &[Value]) -> Result<Value, CapturedError> {
        let mut current: Option<Value> = None;
        for (position, bound) in self.steps.iter().enumerate() {
            let staged;
            let slot: &[Value] = match &current {
                None => inbox,
                Some(value) => {
                    staged = [value.clone()];
                    &staged
                }
            };
            let input = StepInput {
                inbox: slot,
                args: &bound.args,
                kwargs: &bound.kwargs,
            };
            match bound.step.call(&input) {
                Ok(value) => current = Some(value),
                Err(err) => {
                    return Err(CapturedError::new(err.to_string()).with_step(position));
                }
            }
        }
        current.ok_or_else(|| CapturedError::new("unit has no steps"))
    }
}

impl From<BoundStep> for Unit {
    fn from(step: BoundStep) -> Self {
        Self::new(step)
    }
}

impl From<Vec<BoundStep>> for Unit {
    fn from(steps: Vec<BoundStep>) -> Self {
        Self::from_steps(steps)
    }
}

impl From<Vec<Unit>> for Unit {
    fn from(units: Vec<Unit>) -> Self {
        Self::from_units(units)
    }
}

/// A registry of named step callables.
///
/// Cloning is cheap; clones share the same table.
#[derive(Clone, Default)]
pub struct StepRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<StepFn>>>>,
}

impl StepRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry preloaded with the built-in steps.
    ///
    /// Currently: `identity`, which returns its first inbox slot unchanged.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        let _ = registry.register("identity", |input: &StepInput<'_>| {
            Ok(input.first()?.clone())
        });
        registry
    }

    /// Registers a step under a stable name.
    ///
    /// # Errors
    ///
    /// Returns a usage error if the name is already taken.
    pub fn register<F>(&self, name: impl Into<String>, func: F) -> Result<(), PipeflowError>
    where
        F: Fn(&StepInput<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut table = self.inner.write();
        if table.contains_key(&name) {
            return Err(UsageError::new(
                "StepRegistry::register",
                format!("step '{name}' is already registered"),
            )
            .into());
        }
        table.insert(name, Arc::new(func));
        Ok(())
    }

    /// Looks up a step by name.
    ///
    /// # Errors
    ///
    /// Returns [`PipeflowError::UnknownStep`] if absent.
    pub fn get(&self, name: &str) -> Result<Step, PipeflowError> {
        let table = self.inner.read();
        table
            .get(name)
            .map(|func| Step {
                name: Some(name.to_string()),
                func: Arc::clone(func),
            })
            .ok_or_else(|| PipeflowError::UnknownStep(name.to_string()))
    }

    /// Returns the registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn square() -> Step {
        Step::named("square", |input: &StepInput<'_>| {
            let n = input
                .first()?
                .as_i64()
                .ok_or_else(|| anyhow::anyhow!("not a number"))?;
            Ok(json!(n * n))
        })
    }

    fn add() -> Step {
        Step::named("add", |input: &StepInput<'_>| {
            let n = input
                .first()?
                .as_i64()
                .ok_or_else(|| anyhow::anyhow!("not a number"))?;
            let amount = input
                .args
                .first()
                .and_then(Value::as_i64)
                .unwrap_or_default();
            Ok(json!(n + amount))
        })
    }

    #[test]
    fn test_single_step_call() {
        let unit = Unit::new(square());
        assert_eq!(unit.call(&[json!(3)]).unwrap(), json!(9));
    }

    #[test]
    fn test_threading_between_steps() {
        let unit = Unit::from_steps(vec![
            BoundStep::new(square()),
            BoundStep::new(add()).with_args(vec![json!(1)]),
        ]);
        // 3^2 + 1
        assert_eq!(unit.call(&[json!(3)]).unwrap(), json!(10));
    }

    #[test]
    fn test_failure_records_step_position() {
        let stringify = Step::named("stringify", |input: &StepInput<'_>| {
            Ok(json!(input.first()?.to_string()))
        });
        let unit = Unit::from_steps(vec![BoundStep::new(square()), BoundStep::new(square())]);
        let err = unit.call(&[json!("a")]).unwrap_err();
        assert_eq!(err.step, Some(0));

        let unit = Unit::from_steps(vec![BoundStep::new(stringify), BoundStep::new(square())]);
        let err = unit.call(&[json!(2)]).unwrap_err();
        assert_eq!(err.step, Some(1));
    }

    #[test]
    fn test_flattening_never_nests() {
        let inner = Unit::from_steps(vec![BoundStep::new(square()), BoundStep::new(add())]);
        let flat = Unit::from_units(vec![inner.clone(), Unit::new(square())]);
        assert_eq!(flat.steps().len(), 3);
    }

    #[test]
    fn test_structural_equality() {
        let a = Unit::from_steps(vec![
            BoundStep::new(square()),
            BoundStep::new(add()).with_args(vec![json!(1)]),
        ]);
        let b = Unit::from_steps(vec![
            BoundStep::new(square()),
            BoundStep::new(add()).with_args(vec![json!(1)]),
        ]);
        let c = Unit::from_steps(vec![
            BoundStep::new(square()),
            BoundStep::new(add()).with_args(vec![json!(2)]),
        ]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_inline_steps_compare_by_identity() {
        let f = Step::inline(|input: &StepInput<'_>| Ok(input.first()?.clone()));
        let g = Step::inline(|input: &StepInput<'_>| Ok(input.first()?.clone()));
        assert_eq!(f, f.clone());
        assert_ne!(f, g);
    }

    #[test]
    fn test_registry_round_trip() {
        let registry = StepRegistry::with_builtins();
        registry
            .register("triple", |input: &StepInput<'_>| {
                let n = input.first()?.as_i64().unwrap_or(0);
                Ok(json!(n * 3))
            })
            .unwrap();

        let step = registry.get("triple").unwrap();
        assert_eq!(step.name(), Some("triple"));
        let unit = Unit::new(step);
        assert!(unit.is_named());
        assert_eq!(unit.call(&[json!(2)]).unwrap(), json!(6));

        assert!(registry.register("triple", |_: &StepInput<'_>| Ok(json!(0))).is_err());
        assert!(matches!(
            registry.get("missing"),
            Err(PipeflowError::UnknownStep(_))
        ));
    }

    #[test]
    fn test_unnamed_unit_detected() {
        let unit = Unit::new(Step::inline(|input: &StepInput<'_>| {
            Ok(input.first()?.clone())
        }));
        assert!(!unit.is_named());
    }
}
