use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{Either, join_all, select};
use futures_timer::Delay;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::controller::{FormTree, TreeInner};
use super::node::{FieldPath, NodeId, NodeMeta};
use super::validation::{
    AsyncOutcome, AsyncValidatorError, AsyncValidatorFn, BoxedValidationFuture, Generation,
    RunToken, ValidationErrors,
};

/// Error key written by a fail-closed node whose async validator failed or
/// timed out.
pub const ASYNC_FAILURE_KEY: &str = "asyncValidatorFailed";

/// How an async validator that errors or times out is counted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The failure becomes an [`ASYNC_FAILURE_KEY`] error.
    #[default]
    FailClosed,
    /// The failing validator counts as valid.
    FailOpen,
}

/// The single in-flight run of a node.
pub(super) struct PendingRun {
    pub(super) generation: Generation,
    pub(super) token: RunToken,
    pub(super) validator_count: usize,
}

/// Supersedes whatever run the node has in flight. Any completion issued for
/// an older generation is discarded on commit.
pub(super) fn cancel_pending(meta: &mut NodeMeta, path: &FieldPath) {
    meta.generation = meta.generation.next();
    if let Some(run) = meta.pending.take() {
        run.token.cancel();
        tracing::debug!(
            path = %path,
            generation = run.generation.0,
            validators = run.validator_count,
            "cancelled pending async validation"
        );
    }
}

pub(super) fn begin_run(meta: &mut NodeMeta, path: &FieldPath, value: Value) -> ScheduledRun {
    cancel_pending(meta, path);
    let generation = meta.generation;
    let token = RunToken::new(generation);
    meta.pending = Some(PendingRun {
        generation,
        token: token.clone(),
        validator_count: meta.async_validators.len(),
    });
    tracing::trace!(
        path = %path,
        generation = generation.0,
        debounce_ms = meta.debounce.as_millis() as u64,
        "scheduled async validation"
    );
    ScheduledRun {
        node: meta.id,
        path: path.clone(),
        generation,
        token,
        value,
        validators: meta.async_validators.clone(),
        debounce: meta.debounce,
        timeout: meta.timeout,
        failure_policy: meta.failure_policy,
        issued_at: Instant::now(),
    }
}

/// Everything a run needs once it leaves the tree lock.
pub(super) struct ScheduledRun {
    pub(super) node: NodeId,
    pub(super) path: FieldPath,
    pub(super) generation: Generation,
    token: RunToken,
    value: Value,
    validators: Vec<AsyncValidatorFn>,
    debounce: Duration,
    timeout: Duration,
    failure_policy: FailurePolicy,
    issued_at: Instant,
}

pub(super) enum RunResult {
    Superseded,
    Completed(Option<ValidationErrors>),
}

impl ScheduledRun {
    async fn execute(&self) -> RunResult {
        // The debounce window counts from the write that issued this run.
        let remaining = self.debounce.saturating_sub(self.issued_at.elapsed());
        if !remaining.is_zero() {
            Delay::new(remaining).await;
        }
        if self.token.is_cancelled() {
            tracing::debug!(
                path = %self.path,
                generation = self.generation.0,
                "async validation superseded during debounce"
            );
            return RunResult::Superseded;
        }

        let checks = self.validators.iter().map(|validator| {
            guarded_check(
                validator,
                self.value.clone(),
                self.token.clone(),
                self.timeout,
            )
        });
        let outcomes = join_all(checks).await;
        if self.token.is_cancelled() {
            tracing::debug!(
                path = %self.path,
                generation = self.generation.0,
                "discarding stale async validation result"
            );
            return RunResult::Superseded;
        }
        RunResult::Completed(resolve_outcomes(
            outcomes,
            self.failure_policy,
            &self.path,
        ))
    }
}

/// One validator call bounded by `timeout`. A panic while creating or polling
/// the validator future resolves as an execution failure.
async fn guarded_check(
    validator: &AsyncValidatorFn,
    value: Value,
    token: RunToken,
    timeout: Duration,
) -> AsyncOutcome {
    let pending = match panic::catch_unwind(AssertUnwindSafe(|| validator.validate(value, token))) {
        Ok(pending) => pending,
        Err(payload) => return Err(panic_failure(payload)),
    };
    with_timeout(pending, timeout).await
}

async fn with_timeout(pending: BoxedValidationFuture, timeout: Duration) -> AsyncOutcome {
    let checked = AssertUnwindSafe(pending)
        .catch_unwind()
        .map(|result| result.unwrap_or_else(|payload| Err(panic_failure(payload))));
    match select(checked, Delay::new(timeout)).await {
        Either::Left((outcome, _)) => outcome,
        Either::Right(((), _)) => Err(AsyncValidatorError::TimedOut(timeout)),
    }
}

fn panic_failure(payload: Box<dyn Any + Send>) -> AsyncValidatorError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned());
    AsyncValidatorError::Panicked(message)
}

/// Merges async outcomes in registration order, first key wins, applying
/// `policy` to execution failures.
pub(super) fn resolve_outcomes(
    outcomes: Vec<AsyncOutcome>,
    policy: FailurePolicy,
    path: &FieldPath,
) -> Option<ValidationErrors> {
    let mut merged = ValidationErrors::new();
    for outcome in outcomes {
        match outcome {
            Ok(Some(errors)) => merged.merge_first_wins(errors),
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(path = %path, %error, ?policy, "async validator failed");
                if policy == FailurePolicy::FailClosed {
                    merged.merge_first_wins(ValidationErrors::single(
                        ASYNC_FAILURE_KEY,
                        error.to_string(),
                    ));
                }
            }
        }
    }
    merged.into_option()
}

/// A debounced async validation of one node, ready to be polled by any
/// executor. Dropping it is equivalent to cancelling it, except the node stays
/// pending until a newer generation replaces it.
pub struct ValidationRun {
    path: FieldPath,
    generation: Generation,
    future: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
}

impl ValidationRun {
    pub(super) fn new(run: ScheduledRun, tree: Weak<TreeInner>) -> Self {
        let path = run.path.clone();
        let generation = run.generation;
        let future = Box::pin(async move {
            let RunResult::Completed(errors) = run.execute().await else {
                return;
            };
            let Some(inner) = tree.upgrade() else {
                tracing::debug!(path = %run.path, "tree dropped before async validation finished");
                return;
            };
            let tree = FormTree::from_inner(inner);
            if let Err(error) = tree.commit_run(run.node, &run.path, run.generation, errors) {
                tracing::warn!(path = %run.path, %error, "failed to commit async validation");
            }
        });
        Self {
            path,
            generation,
            future,
        }
    }

    pub fn path(&self) -> &FieldPath {
        &self.path
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }
}

impl Future for ValidationRun {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.as_mut().poll(cx)
    }
}

impl Debug for ValidationRun {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationRun")
            .field("path", &self.path)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Hands issued runs to an executor. Without a spawner runs are queued on the
/// tree and driven by [`FormTree::settle`].
pub trait RunSpawner: Send + Sync + 'static {
    fn spawn(&self, run: ValidationRun);
}

impl<F> RunSpawner for F
where
    F: Fn(ValidationRun) + Send + Sync + 'static,
{
    fn spawn(&self, run: ValidationRun) {
        (self)(run)
    }
}

pub(super) type SharedSpawner = Arc<dyn RunSpawner>;
