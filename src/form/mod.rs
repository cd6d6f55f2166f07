mod controller;
mod model;
mod node;
mod runner;
mod status;
mod validation;


pub use calmform_derive::FormModel;
pub use controller::{
    EngineError, EngineResult, FormSnapshot, FormTree, NodeSnapshot, PatchMode, TreeEvent,
    TreeOptions,
};
pub use model::{FieldKey, FieldLens, FormModel};
pub use node::{FieldPath, NodeId, NodeKind, NodeSpec};
pub use runner::{ASYNC_FAILURE_KEY, FailurePolicy, RunSpawner, ValidationRun};
pub use status::{Status, SubmitGate, aggregate};
pub use validation::{
    AsyncOutcome, AsyncValidator, AsyncValidatorError, BoxedValidationFuture, Generation,
    RunToken, ValidationErrors, Validator, validate_sync,
};
