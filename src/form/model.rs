use std::fmt::{Display, Formatter};

use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FieldKey(&'static str);

impl FieldKey {
    pub const fn new(value: &'static str) -> Self {
        Self(value)
    }

    pub const fn as_str(self) -> &'static str {
        self.0
    }
}

impl Display for FieldKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

impl AsRef<str> for FieldKey {
    fn as_ref(&self) -> &str {
        self.0
    }
}

/// Typed handle on one top-level field of a serde model.
pub trait FieldLens: Copy + Send + Sync + 'static {
    type Model: FormModel;
    type Value: Serialize + DeserializeOwned + Send + Sync + 'static;

    fn key(self) -> FieldKey;
}

/// A serde model whose top-level fields map onto the children of a group.
/// Usually derived with `#[derive(FormModel)]`.
pub trait FormModel: Serialize + DeserializeOwned + Send + Sync + 'static {
    type Fields;

    fn fields() -> Self::Fields;

    fn field_keys() -> &'static [FieldKey];
}
