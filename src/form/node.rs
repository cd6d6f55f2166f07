use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Map, Value};

use super::controller::{EngineError, EngineResult, TreeOptions};
use super::model::{FieldKey, FieldLens, FormModel};
use super::runner::{FailurePolicy, PendingRun};
use super::status::{Status, aggregate};
use super::validation::{
    AsyncValidator, AsyncValidatorFn, Generation, SyncValidatorFn, ValidationErrors, Validator,
};

static NODE_ID_ALLOCATOR: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn next() -> Self {
        Self(NODE_ID_ALLOCATOR.fetch_add(1, Ordering::SeqCst))
    }
}

/// Dot separated address of a node. The empty path is the root; list items
/// are addressed by their index, as in `phones.0.number`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn parse(path: &str) -> Self {
        path.split('.')
            .filter(|segment| !segment.is_empty())
            .map(str::to_owned)
            .collect()
    }

    pub fn join(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn name(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<FieldPath> {
        (!self.is_root()).then(|| self.prefix(self.0.len() - 1))
    }

    pub(super) fn prefix(&self, len: usize) -> FieldPath {
        Self(self.0[..len.min(self.0.len())].to_vec())
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl FromIterator<String> for FieldPath {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

impl From<String> for FieldPath {
    fn from(path: String) -> Self {
        Self::parse(&path)
    }
}

impl From<&FieldPath> for FieldPath {
    fn from(path: &FieldPath) -> Self {
        path.clone()
    }
}

impl From<FieldKey> for FieldPath {
    fn from(key: FieldKey) -> Self {
        Self::parse(key.as_str())
    }
}

enum SpecKind {
    Field(Value),
    Group(BTreeMap<String, NodeSpec>),
    List(Vec<NodeSpec>),
}

/// Blueprint of a node subtree: a field with its initial value, a group of
/// named children or an ordered list of items, plus the node's rules and
/// per-node overrides.
pub struct NodeSpec {
    kind: SpecKind,
    validators: Vec<SyncValidatorFn>,
    async_validators: Vec<AsyncValidatorFn>,
    debounce: Option<Duration>,
    timeout: Option<Duration>,
    failure_policy: Option<FailurePolicy>,
    disabled: bool,
}

impl NodeSpec {
    fn with_kind(kind: SpecKind) -> Self {
        Self {
            kind,
            validators: Vec::new(),
            async_validators: Vec::new(),
            debounce: None,
            timeout: None,
            failure_policy: None,
            disabled: false,
        }
    }

    pub fn field(initial: impl Into<Value>) -> Self {
        Self::with_kind(SpecKind::Field(initial.into()))
    }

    pub fn group<N>(children: impl IntoIterator<Item = (N, NodeSpec)>) -> Self
    where
        N: Into<String>,
    {
        Self::with_kind(SpecKind::Group(
            children
                .into_iter()
                .map(|(name, spec)| (name.into(), spec))
                .collect(),
        ))
    }

    /// An ordered list whose value is a JSON array of its items' values.
    pub fn list(items: impl IntoIterator<Item = NodeSpec>) -> Self {
        Self::with_kind(SpecKind::List(items.into_iter().collect()))
    }

    /// A group with one field per serialized top-level field of `model`,
    /// each starting at the model's value.
    pub fn from_model<T: FormModel>(model: &T) -> EngineResult<Self> {
        match serde_json::to_value(model) {
            Ok(Value::Object(fields)) => Ok(Self::from_object(fields)),
            Ok(_) => Err(EngineError::NotAnObject(FieldPath::root())),
            Err(error) => Err(EngineError::ValueConversion {
                path: FieldPath::root(),
                message: error.to_string(),
            }),
        }
    }

    fn from_object(fields: Map<String, Value>) -> Self {
        Self::group(
            fields
                .into_iter()
                .map(|(name, initial)| (name, NodeSpec::field(initial))),
        )
    }

    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    pub fn async_validator(mut self, validator: impl AsyncValidator + 'static) -> Self {
        self.async_validators.push(Arc::new(validator));
        self
    }

    pub fn debounce_ms(self, debounce_ms: u64) -> Self {
        self.debounce(Duration::from_millis(debounce_ms))
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = Some(debounce);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(Duration::from_millis(timeout_ms));
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Rewrites the child spec named `name`. No-op for fields or unknown names.
    pub fn map_child(mut self, name: impl AsRef<str>, f: impl FnOnce(NodeSpec) -> NodeSpec) -> Self {
        if let SpecKind::Group(children) = &mut self.kind
            && let Some(child) = children.remove(name.as_ref())
        {
            children.insert(name.as_ref().to_owned(), f(child));
        }
        self
    }

    pub fn map_lens<L: FieldLens>(self, lens: L, f: impl FnOnce(NodeSpec) -> NodeSpec) -> Self {
        self.map_child(lens.key(), f)
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, SpecKind::Group(_))
    }

    pub fn is_list(&self) -> bool {
        matches!(self.kind, SpecKind::List(_))
    }
}

impl Debug for NodeSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("NodeSpec");
        match &self.kind {
            SpecKind::Field(initial) => debug.field("initial", initial),
            SpecKind::Group(children) => debug.field("children", &children.keys()),
            SpecKind::List(items) => debug.field("items", &items.len()),
        };
        debug
            .field("validators", &self.validators.len())
            .field("async_validators", &self.async_validators.len())
            .field("disabled", &self.disabled)
            .finish()
    }
}

pub(super) struct NodeMeta {
    pub(super) id: NodeId,
    pub(super) validators: Vec<SyncValidatorFn>,
    pub(super) async_validators: Vec<AsyncValidatorFn>,
    pub(super) debounce: Duration,
    pub(super) timeout: Duration,
    pub(super) failure_policy: FailurePolicy,
    /// Result of this node's own validators only.
    pub(super) own_status: Status,
    /// Aggregated over the subtree, refreshed on every change.
    pub(super) status: Status,
    pub(super) errors: Option<ValidationErrors>,
    pub(super) touched: bool,
    pub(super) marked_dirty: bool,
    pub(super) disabled: bool,
    pub(super) generation: Generation,
    pub(super) pending: Option<PendingRun>,
}

pub(super) struct FieldNode {
    pub(super) meta: NodeMeta,
    pub(super) value: Value,
    pub(super) initial: Value,
}

pub(super) struct GroupNode {
    pub(super) meta: NodeMeta,
    pub(super) children: BTreeMap<String, Node>,
}

pub(super) struct ListNode {
    pub(super) meta: NodeMeta,
    pub(super) items: Vec<Node>,
}

pub(super) enum Node {
    Field(FieldNode),
    Group(GroupNode),
    List(ListNode),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum NodeKind {
    Field,
    Group,
    List,
}

impl Node {
    pub(super) fn from_spec(spec: NodeSpec, options: &TreeOptions) -> Self {
        let meta = NodeMeta {
            id: NodeId::next(),
            validators: spec.validators,
            async_validators: spec.async_validators,
            debounce: spec.debounce.unwrap_or(options.debounce()),
            timeout: spec.timeout.unwrap_or(options.async_timeout()),
            failure_policy: spec.failure_policy.unwrap_or(options.failure_policy),
            own_status: Status::Valid,
            status: Status::Valid,
            errors: None,
            touched: false,
            marked_dirty: false,
            disabled: spec.disabled,
            generation: Generation::default(),
            pending: None,
        };
        let disabled = meta.disabled;
        let mut node = match spec.kind {
            SpecKind::Field(initial) => Node::Field(FieldNode {
                meta,
                value: initial.clone(),
                initial,
            }),
            SpecKind::Group(children) => Node::Group(GroupNode {
                meta,
                children: children
                    .into_iter()
                    .map(|(name, child)| (name, Node::from_spec(child, options)))
                    .collect(),
            }),
            SpecKind::List(items) => Node::List(ListNode {
                meta,
                items: items
                    .into_iter()
                    .map(|item| Node::from_spec(item, options))
                    .collect(),
            }),
        };
        if disabled {
            node.visit_mut(&mut |node| node.meta_mut().disabled = true);
        }
        node
    }

    pub(super) fn kind(&self) -> NodeKind {
        match self {
            Node::Field(_) => NodeKind::Field,
            Node::Group(_) => NodeKind::Group,
            Node::List(_) => NodeKind::List,
        }
    }

    pub(super) fn meta(&self) -> &NodeMeta {
        match self {
            Node::Field(field) => &field.meta,
            Node::Group(group) => &group.meta,
            Node::List(list) => &list.meta,
        }
    }

    pub(super) fn meta_mut(&mut self) -> &mut NodeMeta {
        match self {
            Node::Field(field) => &mut field.meta,
            Node::Group(group) => &mut group.meta,
            Node::List(list) => &mut list.meta,
        }
    }

    pub(super) fn get(&self, path: &FieldPath) -> Option<&Node> {
        let mut node = self;
        for segment in path.segments() {
            node = match node {
                Node::Group(group) => group.children.get(segment)?,
                Node::List(list) => list.items.get(segment.parse::<usize>().ok()?)?,
                Node::Field(_) => return None,
            };
        }
        Some(node)
    }

    pub(super) fn get_mut(&mut self, path: &FieldPath) -> Option<&mut Node> {
        let mut node = self;
        for segment in path.segments() {
            node = match node {
                Node::Group(group) => group.children.get_mut(segment)?,
                Node::List(list) => list.items.get_mut(segment.parse::<usize>().ok()?)?,
                Node::Field(_) => return None,
            };
        }
        Some(node)
    }

    /// Value with disabled descendants left out of groups and lists.
    pub(super) fn value(&self) -> Value {
        match self {
            Node::Field(field) => field.value.clone(),
            Node::Group(group) => Value::Object(
                group
                    .children
                    .iter()
                    .filter(|(_, child)| !child.meta().disabled)
                    .map(|(name, child)| (name.clone(), child.value()))
                    .collect(),
            ),
            Node::List(list) => Value::Array(
                list.items
                    .iter()
                    .filter(|item| !item.meta().disabled)
                    .map(Node::value)
                    .collect(),
            ),
        }
    }

    /// Value including disabled descendants.
    pub(super) fn raw_value(&self) -> Value {
        match self {
            Node::Field(field) => field.value.clone(),
            Node::Group(group) => Value::Object(
                group
                    .children
                    .iter()
                    .map(|(name, child)| (name.clone(), child.raw_value()))
                    .collect(),
            ),
            Node::List(list) => Value::Array(list.items.iter().map(Node::raw_value).collect()),
        }
    }

    pub(super) fn is_dirty(&self) -> bool {
        if self.meta().marked_dirty {
            return true;
        }
        match self {
            Node::Field(field) => field.value != field.initial,
            _ => self.children().any(|(_, child)| child.is_dirty()),
        }
    }

    /// Direct children with their path segment: group names, list indexes.
    pub(super) fn children(&self) -> Box<dyn Iterator<Item = (String, &Node)> + '_> {
        match self {
            Node::Field(_) => Box::new(std::iter::empty()),
            Node::Group(group) => Box::new(
                group
                    .children
                    .iter()
                    .map(|(name, child)| (name.clone(), child)),
            ),
            Node::List(list) => Box::new(
                list.items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| (index.to_string(), item)),
            ),
        }
    }

    pub(super) fn children_mut(&mut self) -> Box<dyn Iterator<Item = (String, &mut Node)> + '_> {
        match self {
            Node::Field(_) => Box::new(std::iter::empty()),
            Node::Group(group) => Box::new(
                group
                    .children
                    .iter_mut()
                    .map(|(name, child)| (name.clone(), child)),
            ),
            Node::List(list) => Box::new(
                list.items
                    .iter_mut()
                    .enumerate()
                    .map(|(index, item)| (index.to_string(), item)),
            ),
        }
    }

    /// Whether an enabled child already reports `Invalid`. Async validators of
    /// such a node never run.
    pub(super) fn has_invalid_child(&self) -> bool {
        self.children()
            .any(|(_, child)| child.meta().status == Status::Invalid)
    }

    pub(super) fn aggregate_status(&self) -> Status {
        let meta = self.meta();
        aggregate(
            meta.own_status,
            meta.disabled,
            self.children().map(|(_, child)| child.meta().status),
        )
    }

    /// Pre-order walk over this node and its descendants.
    pub(super) fn visit_mut(&mut self, f: &mut impl FnMut(&mut Node)) {
        f(self);
        for (_, child) in self.children_mut() {
            child.visit_mut(f);
        }
    }

    pub(super) fn visit(&self, path: &FieldPath, f: &mut impl FnMut(&FieldPath, &Node)) {
        f(path, self);
        for (segment, child) in self.children() {
            child.visit(&path.join(segment), f);
        }
    }

    /// Current path of the node with `id`. List items move when an earlier
    /// item is inserted or removed.
    pub(super) fn path_of(&self, id: NodeId) -> Option<FieldPath> {
        let mut found = None;
        self.visit(&FieldPath::root(), &mut |path, node| {
            if found.is_none() && node.meta().id == id {
                found = Some(path.clone());
            }
        });
        found
    }
}
