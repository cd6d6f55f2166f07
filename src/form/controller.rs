use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::model::FieldLens;
use super::node::{FieldPath, ListNode, Node, NodeId, NodeKind, NodeSpec};
use super::runner::{
    FailurePolicy, RunSpawner, ScheduledRun, SharedSpawner, ValidationRun, begin_run,
    cancel_pending,
};
use super::status::{Status, SubmitGate};
use super::validation::{Generation, ValidationErrors, is_evaluating, validate_sync};

/// What a group does with patch keys that match none of its children.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchMode {
    /// Unknown keys are ignored.
    #[default]
    Permissive,
    /// Unknown keys reject the whole write with [`EngineError::UnknownField`].
    Strict,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeOptions {
    pub patch_mode: PatchMode,
    pub failure_policy: FailurePolicy,
    pub debounce_ms: u64,
    pub async_timeout_ms: u64,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            patch_mode: PatchMode::Permissive,
            failure_policy: FailurePolicy::FailClosed,
            debounce_ms: 300,
            async_timeout_ms: 5_000,
        }
    }
}

impl TreeOptions {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn async_timeout(&self) -> Duration {
        Duration::from_millis(self.async_timeout_ms)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("validation tree lock poisoned while {0}")]
    StatePoisoned(&'static str),
    #[error("validation tree accessed from inside a validator while {0}")]
    ReentrantAccess(&'static str),
    #[error("validation tree has been disposed")]
    Disposed,
    #[error("no node at path `{0}`")]
    UnknownPath(FieldPath),
    #[error("node at `{0}` is not a group")]
    NotAGroup(FieldPath),
    #[error("patch names unknown field `{0}`")]
    UnknownField(FieldPath),
    #[error("group at `{0}` expects an object value")]
    NotAnObject(FieldPath),
    #[error("group already has a child at `{0}`")]
    DuplicateChild(FieldPath),
    #[error("child name `{0}` must be non-empty and free of `.`")]
    InvalidName(String),
    #[error("node at `{0}` is not a list")]
    NotAList(FieldPath),
    #[error("list at `{0}` expects an array value")]
    NotAnArray(FieldPath),
    #[error("index {index} is out of bounds for list `{path}` of length {len}")]
    IndexOutOfBounds {
        path: FieldPath,
        index: usize,
        len: usize,
    },
    #[error("failed to convert value at `{path}`: {message}")]
    ValueConversion { path: FieldPath, message: String },
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TreeEvent {
    ValueChanged { path: FieldPath },
    StatusChanged { path: FieldPath, status: Status },
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeSnapshot {
    pub kind: NodeKind,
    pub value: Value,
    pub status: Status,
    pub errors: Option<ValidationErrors>,
    pub touched: bool,
    pub dirty: bool,
    pub disabled: bool,
    pub generation: Generation,
    pub pending: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FormSnapshot {
    pub value: Value,
    pub status: Status,
    pub gate: SubmitGate,
    pub submit_count: u32,
    pub nodes: BTreeMap<FieldPath, NodeSnapshot>,
}

pub(super) struct TreeState {
    root: Node,
    disposed: bool,
    submit_count: u32,
}

pub(super) struct TreeInner {
    options: TreeOptions,
    state: RwLock<TreeState>,
    spawner: Option<SharedSpawner>,
    scheduled: Mutex<Vec<ValidationRun>>,
    subscribers: Mutex<Vec<UnboundedSender<TreeEvent>>>,
}

/// Side effects collected under the state lock and released after it.
#[derive(Default)]
struct Effects {
    runs: Vec<ScheduledRun>,
    events: Vec<TreeEvent>,
}

/// The validation tree and its public surface.
///
/// Cloning is cheap and every clone addresses the same tree. Writes are
/// synchronous: when a write returns, every affected node and all of its
/// ancestors up to the root carry their new status. Only async validators
/// complete later, through [`ValidationRun`]s.
#[derive(Clone)]
pub struct FormTree {
    inner: Arc<TreeInner>,
}

impl FormTree {
    pub fn new(root: NodeSpec, options: TreeOptions) -> Self {
        Self::build(root, options, None)
    }

    pub fn with_spawner(root: NodeSpec, options: TreeOptions, spawner: impl RunSpawner) -> Self {
        Self::build(root, options, Some(Arc::new(spawner)))
    }

    fn build(root: NodeSpec, options: TreeOptions, spawner: Option<SharedSpawner>) -> Self {
        let mut root = Node::from_spec(root, &options);
        let mut fx = Effects::default();
        revalidate_subtree(&mut root, &FieldPath::root(), &mut fx);

        let tree = Self {
            inner: Arc::new(TreeInner {
                options,
                state: RwLock::new(TreeState {
                    root,
                    disposed: false,
                    submit_count: 0,
                }),
                spawner,
                scheduled: Mutex::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
            }),
        };
        if let Err(error) = tree.dispatch(fx) {
            tracing::error!(%error, "failed to issue initial async validation");
        }
        tree
    }

    pub(super) fn from_inner(inner: Arc<TreeInner>) -> Self {
        Self { inner }
    }

    pub fn options(&self) -> TreeOptions {
        self.inner.options
    }

    /// Receives every value and status change from now on.
    pub fn subscribe(&self) -> EngineResult<UnboundedReceiver<TreeEvent>> {
        let (sender, receiver) = unbounded();
        lock(&self.inner.subscribers, "registering subscriber")?.push(sender);
        Ok(receiver)
    }

    pub fn set_value(&self, path: impl Into<FieldPath>, value: impl Into<Value>) -> EngineResult<()> {
        let path = path.into();
        let value = value.into();
        let mut fx = Effects::default();
        {
            let mut state = self.write_state("setting value")?;
            let node = state
                .root
                .get(&path)
                .ok_or_else(|| EngineError::UnknownPath(path.clone()))?;
            check_patch(node, &value, &path, self.inner.options.patch_mode)?;

            let node = state
                .root
                .get_mut(&path)
                .ok_or_else(|| EngineError::UnknownPath(path.clone()))?;
            apply_value(node, value, &path, &mut fx);
            revalidate_ancestors(&mut state.root, &path, &mut fx);
            for depth in (0..path.depth()).rev() {
                fx.events.push(TreeEvent::ValueChanged {
                    path: path.prefix(depth),
                });
            }
        }
        self.dispatch(fx)
    }

    pub fn set<L>(&self, lens: L, value: L::Value) -> EngineResult<()>
    where
        L: FieldLens,
    {
        let path = FieldPath::from(lens.key());
        let value = serde_json::to_value(value).map_err(|error| EngineError::ValueConversion {
            path: path.clone(),
            message: error.to_string(),
        })?;
        self.set_value(path, value)
    }

    pub fn get<L>(&self, lens: L) -> EngineResult<L::Value>
    where
        L: FieldLens,
    {
        self.value_as(lens.key())
    }

    /// Deserializes the raw value at `path`, disabled descendants included.
    pub fn value_as<T>(&self, path: impl Into<FieldPath>) -> EngineResult<T>
    where
        T: DeserializeOwned,
    {
        let path = path.into();
        let value = self.raw_value(path.clone())?;
        serde_json::from_value(value).map_err(|error| EngineError::ValueConversion {
            path,
            message: error.to_string(),
        })
    }

    /// Value at `path`; groups leave disabled descendants out.
    pub fn value(&self, path: impl Into<FieldPath>) -> EngineResult<Value> {
        self.with_node(path, "reading value", |node| node.value())
    }

    pub fn raw_value(&self, path: impl Into<FieldPath>) -> EngineResult<Value> {
        self.with_node(path, "reading raw value", |node| node.raw_value())
    }

    pub fn status(&self, path: impl Into<FieldPath>) -> EngineResult<Status> {
        self.with_node(path, "reading status", |node| node.meta().status)
    }

    pub fn root_status(&self) -> EngineResult<Status> {
        self.status(FieldPath::root())
    }

    /// Errors of the node's own validators. A group only reports its
    /// cross-field errors, never those of its descendants.
    pub fn errors(&self, path: impl Into<FieldPath>) -> EngineResult<Option<ValidationErrors>> {
        self.with_node(path, "reading errors", |node| node.meta().errors.clone())
    }

    pub fn get_error(&self, path: impl Into<FieldPath>, key: &str) -> EngineResult<Option<Value>> {
        self.with_node(path, "reading error", |node| {
            node.meta()
                .errors
                .as_ref()
                .and_then(|errors| errors.get(key).cloned())
        })
    }

    pub fn has_error(&self, path: impl Into<FieldPath>, key: &str) -> EngineResult<bool> {
        Ok(self.get_error(path, key)?.is_some())
    }

    /// Own errors once the node was touched or a submit was attempted.
    pub fn visible_errors(
        &self,
        path: impl Into<FieldPath>,
    ) -> EngineResult<Option<ValidationErrors>> {
        let path = path.into();
        let state = self.read_state("reading visible errors")?;
        let node = state
            .root
            .get(&path)
            .ok_or_else(|| EngineError::UnknownPath(path.clone()))?;
        let meta = node.meta();
        if !meta.touched && state.submit_count == 0 {
            return Ok(None);
        }
        Ok(meta.errors.clone())
    }

    pub fn is_touched(&self, path: impl Into<FieldPath>) -> EngineResult<bool> {
        self.with_node(path, "reading touched flag", |node| node.meta().touched)
    }

    pub fn is_dirty(&self, path: impl Into<FieldPath>) -> EngineResult<bool> {
        self.with_node(path, "reading dirty flag", Node::is_dirty)
    }

    pub fn is_disabled(&self, path: impl Into<FieldPath>) -> EngineResult<bool> {
        self.with_node(path, "reading disabled flag", |node| node.meta().disabled)
    }

    /// Marks the node and its ancestors touched.
    pub fn mark_touched(&self, path: impl Into<FieldPath>) -> EngineResult<()> {
        let path = path.into();
        let mut state = self.write_state("marking touched")?;
        if state.root.get(&path).is_none() {
            return Err(EngineError::UnknownPath(path));
        }
        for depth in 0..=path.depth() {
            if let Some(node) = state.root.get_mut(&path.prefix(depth)) {
                node.meta_mut().touched = true;
            }
        }
        Ok(())
    }

    pub fn mark_all_touched(&self) -> EngineResult<()> {
        let mut state = self.write_state("marking all touched")?;
        state
            .root
            .visit_mut(&mut |node| node.meta_mut().touched = true);
        Ok(())
    }

    pub fn mark_dirty(&self, path: impl Into<FieldPath>) -> EngineResult<()> {
        let path = path.into();
        let mut state = self.write_state("marking dirty")?;
        let node = state
            .root
            .get_mut(&path)
            .ok_or(EngineError::UnknownPath(path))?;
        node.meta_mut().marked_dirty = true;
        Ok(())
    }

    /// Restores initial values under `path`, clears touched and dirty, and
    /// validates again.
    pub fn reset(&self, path: impl Into<FieldPath>) -> EngineResult<()> {
        let path = path.into();
        let mut fx = Effects::default();
        {
            let mut state = self.write_state("resetting")?;
            let node = state
                .root
                .get_mut(&path)
                .ok_or_else(|| EngineError::UnknownPath(path.clone()))?;
            node.visit_mut(&mut |node| {
                if let Node::Field(field) = node {
                    field.value = field.initial.clone();
                }
                let meta = node.meta_mut();
                meta.touched = false;
                meta.marked_dirty = false;
            });
            revalidate_subtree(node, &path, &mut fx);
            revalidate_ancestors(&mut state.root, &path, &mut fx);
            if path.is_root() {
                state.submit_count = 0;
            }
            fx.events.push(TreeEvent::ValueChanged { path });
        }
        self.dispatch(fx)
    }

    /// Disables the subtree at `path`: its runs are cancelled and it stops
    /// contributing to any ancestor's status and value.
    pub fn disable(&self, path: impl Into<FieldPath>) -> EngineResult<()> {
        let path = path.into();
        let mut fx = Effects::default();
        {
            let mut state = self.write_state("disabling")?;
            let node = state
                .root
                .get_mut(&path)
                .ok_or_else(|| EngineError::UnknownPath(path.clone()))?;
            node.visit_mut(&mut |node| {
                let meta = node.meta_mut();
                meta.disabled = true;
                cancel_pending(meta, &path);
                meta.own_status = Status::Valid;
                meta.errors = None;
            });
            refresh_subtree(node, &path, &mut fx);
            revalidate_ancestors(&mut state.root, &path, &mut fx);
        }
        self.dispatch(fx)
    }

    pub fn enable(&self, path: impl Into<FieldPath>) -> EngineResult<()> {
        let path = path.into();
        let mut fx = Effects::default();
        {
            let mut state = self.write_state("enabling")?;
            let node = state
                .root
                .get_mut(&path)
                .ok_or_else(|| EngineError::UnknownPath(path.clone()))?;
            node.visit_mut(&mut |node| node.meta_mut().disabled = false);
            revalidate_subtree(node, &path, &mut fx);
            revalidate_ancestors(&mut state.root, &path, &mut fx);
        }
        self.dispatch(fx)
    }

    /// Adds a child to the group at `group` and validates it. A child added
    /// under a disabled group starts disabled. Names containing `.` are
    /// rejected since string paths could never address them.
    pub fn add_child(
        &self,
        group: impl Into<FieldPath>,
        name: impl Into<String>,
        spec: NodeSpec,
    ) -> EngineResult<()> {
        let group_path = group.into();
        let name = name.into();
        if name.is_empty() || name.contains('.') {
            return Err(EngineError::InvalidName(name));
        }
        let child_path = group_path.join(name.clone());
        let mut fx = Effects::default();
        {
            let mut state = self.write_state("adding child")?;
            let options = self.inner.options;
            let node = state
                .root
                .get_mut(&group_path)
                .ok_or_else(|| EngineError::UnknownPath(group_path.clone()))?;
            let Node::Group(group) = node else {
                return Err(EngineError::NotAGroup(group_path));
            };
            if group.children.contains_key(&name) {
                return Err(EngineError::DuplicateChild(child_path));
            }

            let mut child = Node::from_spec(spec, &options);
            if group.meta.disabled {
                child.visit_mut(&mut |node| node.meta_mut().disabled = true);
            }
            revalidate_subtree(&mut child, &child_path, &mut fx);
            group.children.insert(name, child);
            revalidate_ancestors(&mut state.root, &child_path, &mut fx);
            fx.events.push(TreeEvent::ValueChanged { path: group_path });
        }
        self.dispatch(fx)
    }

    /// Detaches a child, cancelling every run in its subtree before returning
    /// its raw value.
    pub fn remove_child(
        &self,
        group: impl Into<FieldPath>,
        name: impl AsRef<str>,
    ) -> EngineResult<Value> {
        let group_path = group.into();
        let child_path = group_path.join(name.as_ref());
        let mut fx = Effects::default();
        let removed = {
            let mut state = self.write_state("removing child")?;
            let node = state
                .root
                .get_mut(&group_path)
                .ok_or_else(|| EngineError::UnknownPath(group_path.clone()))?;
            let Node::Group(group) = node else {
                return Err(EngineError::NotAGroup(group_path));
            };
            let mut removed = group
                .children
                .remove(name.as_ref())
                .ok_or_else(|| EngineError::UnknownPath(child_path.clone()))?;
            removed.visit_mut(&mut |node| cancel_pending(node.meta_mut(), &child_path));
            revalidate_ancestors(&mut state.root, &child_path, &mut fx);
            fx.events.push(TreeEvent::ValueChanged { path: group_path });
            removed.raw_value()
        };
        self.dispatch(fx)?;
        Ok(removed)
    }

    /// Appends an item to the list at `list` and returns its index.
    pub fn push(&self, list: impl Into<FieldPath>, spec: NodeSpec) -> EngineResult<usize> {
        self.insert_item(list.into(), None, spec)
    }

    /// Inserts an item at `index`, shifting later items up by one. In-flight
    /// runs of shifted items keep running and commit at the new index.
    pub fn insert(
        &self,
        list: impl Into<FieldPath>,
        index: usize,
        spec: NodeSpec,
    ) -> EngineResult<()> {
        self.insert_item(list.into(), Some(index), spec).map(|_| ())
    }

    /// Removes the item at `index`, cancelling its runs, and returns its raw
    /// value. Later items shift down by one.
    pub fn remove_at(&self, list: impl Into<FieldPath>, index: usize) -> EngineResult<Value> {
        self.edit_list(list.into(), "removing list item", |list, path, _| {
            let len = list.items.len();
            if index >= len {
                return Err(EngineError::IndexOutOfBounds {
                    path: path.clone(),
                    index,
                    len,
                });
            }
            let mut removed = list.items.remove(index);
            let item_path = path.join(index.to_string());
            removed.visit_mut(&mut |node| cancel_pending(node.meta_mut(), &item_path));
            Ok(removed.raw_value())
        })
    }

    /// Removes every item of the list, cancelling their runs.
    pub fn clear(&self, list: impl Into<FieldPath>) -> EngineResult<()> {
        self.edit_list(list.into(), "clearing list", |list, path, _| {
            for mut item in list.items.drain(..) {
                item.visit_mut(&mut |node| cancel_pending(node.meta_mut(), path));
            }
            Ok(())
        })
    }

    pub fn list_len(&self, list: impl Into<FieldPath>) -> EngineResult<usize> {
        let path = list.into();
        self.with_node(path.clone(), "reading list length", |node| match node {
            Node::List(list) => Ok(list.items.len()),
            _ => Err(EngineError::NotAList(path)),
        })?
    }

    /// Runs every validator of the tree again, bottom-up.
    pub fn validate(&self) -> EngineResult<Status> {
        let mut fx = Effects::default();
        let status = {
            let mut state = self.write_state("validating tree")?;
            revalidate_subtree(&mut state.root, &FieldPath::root(), &mut fx);
            state.root.meta().status
        };
        self.dispatch(fx)?;
        Ok(status)
    }

    /// [`validate`](Self::validate) followed by [`settle`](Self::settle).
    pub async fn validate_async(&self) -> EngineResult<Status> {
        self.validate()?;
        self.settle().await?;
        self.root_status()
    }

    pub fn submit_gate(&self) -> EngineResult<SubmitGate> {
        Ok(SubmitGate::from(self.root_status()?))
    }

    /// Counts a submit attempt, marks every node touched and calls `f` with
    /// the tree value only when the gate is [`SubmitGate::Ready`].
    pub fn submit(&self, f: impl FnOnce(&Value)) -> EngineResult<SubmitGate> {
        let (gate, value) = {
            let mut state = self.write_state("submitting")?;
            state.submit_count = state.submit_count.saturating_add(1);
            state
                .root
                .visit_mut(&mut |node| node.meta_mut().touched = true);
            (
                SubmitGate::from(state.root.meta().status),
                state.root.value(),
            )
        };
        if gate == SubmitGate::Ready {
            f(&value);
        }
        Ok(gate)
    }

    /// Paths of nodes with an async run in flight.
    pub fn in_flight(&self) -> EngineResult<Vec<FieldPath>> {
        let state = self.read_state("listing in-flight runs")?;
        let mut paths = Vec::new();
        state.root.visit(&FieldPath::root(), &mut |path, node| {
            if node.meta().pending.is_some() {
                paths.push(path.clone());
            }
        });
        Ok(paths)
    }

    pub fn node_state(&self, path: impl Into<FieldPath>) -> EngineResult<NodeSnapshot> {
        self.with_node(path, "reading node state", node_snapshot)
    }

    pub fn snapshot(&self) -> EngineResult<FormSnapshot> {
        let state = self.read_state("creating snapshot")?;
        let mut nodes = BTreeMap::new();
        state.root.visit(&FieldPath::root(), &mut |path, node| {
            nodes.insert(path.clone(), node_snapshot(node));
        });
        let status = state.root.meta().status;
        Ok(FormSnapshot {
            value: state.root.value(),
            status,
            gate: SubmitGate::from(status),
            submit_count: state.submit_count,
            nodes,
        })
    }

    /// Runs issued while no spawner is configured. The caller becomes
    /// responsible for polling them.
    pub fn take_scheduled(&self) -> EngineResult<Vec<ValidationRun>> {
        Ok(std::mem::take(&mut *lock(
            &self.inner.scheduled,
            "taking scheduled runs",
        )?))
    }

    /// Drives queued runs concurrently until none are left. Runs handed to a
    /// spawner are not awaited.
    pub async fn settle(&self) -> EngineResult<()> {
        loop {
            let runs = self.take_scheduled()?;
            if runs.is_empty() {
                return Ok(());
            }
            join_all(runs).await;
        }
    }

    /// Tears the tree down: cancels every run and rejects any further use.
    pub fn dispose(&self) -> EngineResult<()> {
        {
            let mut state = write_lock(&self.inner.state, "disposing")?;
            if state.disposed {
                return Ok(());
            }
            state.disposed = true;
            state
                .root
                .visit_mut(&mut |node| cancel_pending(node.meta_mut(), &FieldPath::root()));
        }
        lock(&self.inner.scheduled, "dropping scheduled runs")?.clear();
        lock(&self.inner.subscribers, "closing subscribers")?.clear();
        tracing::debug!("validation tree disposed");
        Ok(())
    }

    pub fn is_disposed(&self) -> EngineResult<bool> {
        Ok(read_lock(&self.inner.state, "reading disposed flag")?.disposed)
    }

    /// Applies the result of an async run if it is still the node's current
    /// generation. Returns whether it was applied.
    pub(super) fn commit_run(
        &self,
        node_id: NodeId,
        path: &FieldPath,
        generation: Generation,
        errors: Option<ValidationErrors>,
    ) -> EngineResult<bool> {
        let mut fx = Effects::default();
        {
            let mut state = write_lock(&self.inner.state, "committing async validation")?;
            if state.disposed {
                return Ok(false);
            }
            // List items move when earlier items are inserted or removed.
            let path = match state.root.get(path) {
                Some(node) if node.meta().id == node_id => path.clone(),
                _ => match state.root.path_of(node_id) {
                    Some(current) => current,
                    None => {
                        tracing::debug!(path = %path, "node removed before async validation finished");
                        return Ok(false);
                    }
                },
            };
            let Some(node) = state.root.get_mut(&path) else {
                return Ok(false);
            };
            let meta = node.meta_mut();
            let current = meta.generation == generation
                && meta
                    .pending
                    .as_ref()
                    .is_some_and(|run| run.generation == generation && !run.token.is_cancelled());
            if !current {
                tracing::debug!(
                    path = %path,
                    generation = generation.0,
                    current = meta.generation.0,
                    "discarding stale async validation result"
                );
                return Ok(false);
            }

            meta.pending = None;
            meta.own_status = if errors.is_some() {
                Status::Invalid
            } else {
                Status::Valid
            };
            meta.errors = errors;
            refresh_chain(&mut state.root, &path, &mut fx);
        }
        self.dispatch(fx)?;
        Ok(true)
    }

    fn with_node<R>(
        &self,
        path: impl Into<FieldPath>,
        context: &'static str,
        f: impl FnOnce(&Node) -> R,
    ) -> EngineResult<R> {
        let path = path.into();
        let state = self.read_state(context)?;
        let node = state
            .root
            .get(&path)
            .ok_or(EngineError::UnknownPath(path))?;
        Ok(f(node))
    }

    fn insert_item(
        &self,
        path: FieldPath,
        index: Option<usize>,
        spec: NodeSpec,
    ) -> EngineResult<usize> {
        let options = self.inner.options;
        self.edit_list(path, "inserting list item", |list, path, fx| {
            let len = list.items.len();
            let index = index.unwrap_or(len);
            if index > len {
                return Err(EngineError::IndexOutOfBounds {
                    path: path.clone(),
                    index,
                    len,
                });
            }
            let mut item = Node::from_spec(spec, &options);
            if list.meta.disabled {
                item.visit_mut(&mut |node| node.meta_mut().disabled = true);
            }
            revalidate_subtree(&mut item, &path.join(index.to_string()), fx);
            list.items.insert(index, item);
            Ok(index)
        })
    }

    /// Applies `edit` to the list at `path`, then revalidates the list and its
    /// ancestors.
    fn edit_list<R>(
        &self,
        path: FieldPath,
        context: &'static str,
        edit: impl FnOnce(&mut ListNode, &FieldPath, &mut Effects) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let mut fx = Effects::default();
        let result = {
            let mut state = self.write_state(context)?;
            let node = state
                .root
                .get_mut(&path)
                .ok_or_else(|| EngineError::UnknownPath(path.clone()))?;
            let Node::List(list) = node else {
                return Err(EngineError::NotAList(path));
            };
            let result = edit(list, &path, &mut fx)?;
            revalidate_chain(&mut state.root, &path, &mut fx);
            fx.events.push(TreeEvent::ValueChanged { path });
            result
        };
        self.dispatch(fx)?;
        Ok(result)
    }

    fn read_state(&self, context: &'static str) -> EngineResult<RwLockReadGuard<'_, TreeState>> {
        if is_evaluating() {
            return Err(EngineError::ReentrantAccess(context));
        }
        let state = read_lock(&self.inner.state, context)?;
        if state.disposed {
            return Err(EngineError::Disposed);
        }
        Ok(state)
    }

    fn write_state(&self, context: &'static str) -> EngineResult<RwLockWriteGuard<'_, TreeState>> {
        if is_evaluating() {
            return Err(EngineError::ReentrantAccess(context));
        }
        let state = write_lock(&self.inner.state, context)?;
        if state.disposed {
            return Err(EngineError::Disposed);
        }
        Ok(state)
    }

    fn dispatch(&self, fx: Effects) -> EngineResult<()> {
        let runs = fx
            .runs
            .into_iter()
            .map(|run| ValidationRun::new(run, Arc::downgrade(&self.inner)))
            .collect::<Vec<_>>();
        match &self.inner.spawner {
            Some(spawner) => {
                for run in runs {
                    spawner.spawn(run);
                }
            }
            None if !runs.is_empty() => {
                lock(&self.inner.scheduled, "queueing validation runs")?.extend(runs);
            }
            None => {}
        }

        if !fx.events.is_empty() {
            let mut subscribers = lock(&self.inner.subscribers, "publishing tree events")?;
            subscribers.retain(|subscriber| {
                fx.events
                    .iter()
                    .all(|event| subscriber.unbounded_send(event.clone()).is_ok())
            });
        }
        Ok(())
    }
}

fn node_snapshot(node: &Node) -> NodeSnapshot {
    let meta = node.meta();
    NodeSnapshot {
        kind: node.kind(),
        value: node.value(),
        status: meta.status,
        errors: meta.errors.clone(),
        touched: meta.touched,
        dirty: node.is_dirty(),
        disabled: meta.disabled,
        generation: meta.generation,
        pending: meta.pending.is_some(),
    }
}

/// Re-runs the node's own validators against its current value. Sync errors,
/// its own or an invalid child's, short-circuit the async validators;
/// otherwise a new run is issued.
fn revalidate_node(node: &mut Node, path: &FieldPath, fx: &mut Effects) {
    if node.meta().disabled {
        let meta = node.meta_mut();
        cancel_pending(meta, path);
        meta.own_status = Status::Valid;
        meta.errors = None;
        return;
    }

    let value = node.value();
    let blocked = node.has_invalid_child();
    let meta = node.meta_mut();
    match validate_sync(&meta.validators, &value) {
        Some(errors) => {
            cancel_pending(meta, path);
            meta.errors = Some(errors);
            meta.own_status = Status::Invalid;
        }
        None if meta.async_validators.is_empty() || blocked => {
            cancel_pending(meta, path);
            meta.errors = None;
            meta.own_status = Status::Valid;
        }
        None => {
            fx.runs.push(begin_run(meta, path, value));
            meta.errors = None;
            meta.own_status = Status::Pending;
        }
    }
}

fn refresh_status(node: &mut Node, path: &FieldPath, fx: &mut Effects) {
    let status = node.aggregate_status();
    let meta = node.meta_mut();
    if meta.status != status {
        meta.status = status;
        fx.events.push(TreeEvent::StatusChanged {
            path: path.clone(),
            status,
        });
    }
}

fn refresh_subtree(node: &mut Node, path: &FieldPath, fx: &mut Effects) {
    for (segment, child) in node.children_mut() {
        refresh_subtree(child, &path.join(segment), fx);
    }
    refresh_status(node, path, fx);
}

fn revalidate_subtree(node: &mut Node, path: &FieldPath, fx: &mut Effects) {
    for (segment, child) in node.children_mut() {
        revalidate_subtree(child, &path.join(segment), fx);
    }
    revalidate_node(node, path, fx);
    refresh_status(node, path, fx);
}

/// Ancestors of `path`, nearest first: their aggregate value changed, so their
/// own validators run again before their status is refreshed.
fn revalidate_ancestors(root: &mut Node, path: &FieldPath, fx: &mut Effects) {
    if let Some(parent) = path.parent() {
        revalidate_chain(root, &parent, fx);
    }
}

/// `path` itself and then every ancestor.
fn revalidate_chain(root: &mut Node, path: &FieldPath, fx: &mut Effects) {
    for depth in (0..=path.depth()).rev() {
        let current = path.prefix(depth);
        if let Some(node) = root.get_mut(&current) {
            revalidate_node(node, &current, fx);
            refresh_status(node, &current, fx);
        }
    }
}

/// Refreshes the aggregated status of `path` and every ancestor after an
/// async commit. An ancestor whose run is in flight while a child turned
/// `Invalid` has that run cancelled.
fn refresh_chain(root: &mut Node, path: &FieldPath, fx: &mut Effects) {
    for depth in (0..=path.depth()).rev() {
        let current = path.prefix(depth);
        if let Some(node) = root.get_mut(&current) {
            if depth < path.depth() && node.meta().pending.is_some() && node.has_invalid_child() {
                let meta = node.meta_mut();
                cancel_pending(meta, &current);
                meta.own_status = Status::Valid;
            }
            refresh_status(node, &current, fx);
        }
    }
}

/// Rejects a write before anything is applied.
fn check_patch(node: &Node, value: &Value, path: &FieldPath, mode: PatchMode) -> EngineResult<()> {
    match node {
        Node::Field(_) => Ok(()),
        Node::Group(group) => {
            let Value::Object(entries) = value else {
                return Err(EngineError::NotAnObject(path.clone()));
            };
            for (name, value) in entries {
                match group.children.get(name) {
                    Some(child) => check_patch(child, value, &path.join(name.clone()), mode)?,
                    None if mode == PatchMode::Strict => {
                        return Err(EngineError::UnknownField(path.join(name.clone())));
                    }
                    None => {}
                }
            }
            Ok(())
        }
        Node::List(list) => {
            let Value::Array(entries) = value else {
                return Err(EngineError::NotAnArray(path.clone()));
            };
            for (index, value) in entries.iter().enumerate() {
                match list.items.get(index) {
                    Some(item) => check_patch(item, value, &path.join(index.to_string()), mode)?,
                    None if mode == PatchMode::Strict => {
                        return Err(EngineError::UnknownField(path.join(index.to_string())));
                    }
                    None => {}
                }
            }
            Ok(())
        }
    }
}

fn apply_value(node: &mut Node, value: Value, path: &FieldPath, fx: &mut Effects) {
    match node {
        Node::Field(field) => field.value = value,
        Node::Group(group) => {
            if let Value::Object(entries) = value {
                for (name, value) in entries {
                    match group.children.get_mut(&name) {
                        Some(child) => apply_value(child, value, &path.join(name), fx),
                        None => {
                            tracing::debug!(path = %path, field = %name, "ignoring unknown patch key")
                        }
                    }
                }
            }
        }
        Node::List(list) => {
            if let Value::Array(entries) = value {
                let len = list.items.len();
                if entries.len() > len {
                    tracing::debug!(path = %path, len, extra = entries.len() - len, "ignoring patch entries past the end of the list");
                }
                for (index, (item, value)) in list.items.iter_mut().zip(entries).enumerate() {
                    apply_value(item, value, &path.join(index.to_string()), fx);
                }
            }
        }
    }
    revalidate_node(node, path, fx);
    refresh_status(node, path, fx);
    fx.events.push(TreeEvent::ValueChanged { path: path.clone() });
}

pub(super) fn read_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> EngineResult<RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| EngineError::StatePoisoned(context))
}

pub(super) fn write_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> EngineResult<RwLockWriteGuard<'a, T>> {
    lock.write().map_err(|_| EngineError::StatePoisoned(context))
}

fn lock<'a, T>(mutex: &'a Mutex<T>, context: &'static str) -> EngineResult<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| EngineError::StatePoisoned(context))
}
