use std::cell::Cell;
use std::collections::BTreeMap;
use std::collections::btree_map;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Named validation errors produced by a validator: error key to payload.
///
/// Payloads are arbitrary JSON so validators can carry details such as
/// `{"requiredLength": 8, "actualLength": 3}` next to the key.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationErrors(BTreeMap<String, Value>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn single(key: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self::new().with(key, payload)
    }

    /// Adds `key` unless it is already present.
    pub fn with(mut self, key: impl Into<String>, payload: impl Into<Value>) -> Self {
        self.0.entry(key.into()).or_insert_with(|| payload.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merges `other` into `self`. On a key collision the entry already present
    /// (the earlier registered validator) is kept.
    pub fn merge_first_wins(&mut self, other: ValidationErrors) {
        for (key, payload) in other.0 {
            self.0.entry(key).or_insert(payload);
        }
    }

    pub(super) fn into_option(self) -> Option<Self> {
        (!self.0.is_empty()).then_some(self)
    }
}

impl<K, V> FromIterator<(K, V)> for ValidationErrors
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |errors, (key, payload)| errors.with(key, payload))
    }
}

impl<'a> IntoIterator for &'a ValidationErrors {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Synchronous rule. Returns `None` when the value is valid.
///
/// Group validators receive the group's aggregate value: a JSON object
/// snapshot of its enabled children.
pub trait Validator: Send + Sync {
    fn validate(&self, value: &Value) -> Option<ValidationErrors>;
}

impl<F> Validator for F
where
    F: Fn(&Value) -> Option<ValidationErrors> + Send + Sync,
{
    fn validate(&self, value: &Value) -> Option<ValidationErrors> {
        (self)(value)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum AsyncValidatorError {
    #[error("async validator failed: {0}")]
    Failed(String),
    #[error("async validator timed out after {0:?}")]
    TimedOut(Duration),
    #[error("async validator panicked: {0}")]
    Panicked(String),
}

impl AsyncValidatorError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// `Ok(None)` is valid, `Ok(Some(_))` carries validation errors and `Err` is an
/// execution failure resolved by the node's [`FailurePolicy`](super::FailurePolicy).
pub type AsyncOutcome = Result<Option<ValidationErrors>, AsyncValidatorError>;

pub type BoxedValidationFuture = Pin<Box<dyn Future<Output = AsyncOutcome> + Send + 'static>>;

pub trait AsyncValidator: Send + Sync {
    fn validate(&self, value: Value, token: RunToken) -> BoxedValidationFuture;
}

impl<F, Fut> AsyncValidator for F
where
    F: Fn(Value, RunToken) -> Fut + Send + Sync,
    Fut: Future<Output = AsyncOutcome> + Send + 'static,
{
    fn validate(&self, value: Value, token: RunToken) -> BoxedValidationFuture {
        Box::pin((self)(value, token))
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Generation(pub u64);

impl Generation {
    pub(super) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Handed to every async validator of a run. Turns cancelled once the run is
/// superseded by a newer generation, or its node is disabled or removed.
#[derive(Clone)]
pub struct RunToken {
    generation: Generation,
    cancelled: Arc<AtomicBool>,
}

impl RunToken {
    pub(super) fn new(generation: Generation) -> Self {
        Self {
            generation,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(super) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl Debug for RunToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunToken")
            .field("generation", &self.generation)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

pub(super) type SyncValidatorFn = Arc<dyn Validator>;
pub(super) type AsyncValidatorFn = Arc<dyn AsyncValidator>;

thread_local! {
    static EVALUATION_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as evaluating validators until dropped.
pub(super) struct EvaluationGuard(());

impl EvaluationGuard {
    pub(super) fn enter() -> Self {
        EVALUATION_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self(())
    }
}

impl Drop for EvaluationGuard {
    fn drop(&mut self) {
        EVALUATION_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

pub(super) fn is_evaluating() -> bool {
    EVALUATION_DEPTH.with(|depth| depth.get() > 0)
}

/// Runs `validators` in registration order and merges their errors,
/// first registered key wins.
pub fn validate_sync(validators: &[Arc<dyn Validator>], value: &Value) -> Option<ValidationErrors> {
    let _guard = EvaluationGuard::enter();
    let mut merged = ValidationErrors::new();
    for validator in validators {
        if let Some(errors) = validator.validate(value) {
            merged.merge_first_wins(errors);
        }
    }
    merged.into_option()
}
