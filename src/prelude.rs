pub use crate::form::{
    AsyncOutcome, AsyncValidator, AsyncValidatorError, BoxedValidationFuture, EngineError,
    EngineResult, FailurePolicy, FieldLens, FieldPath, FormModel, FormTree, Generation, NodeSpec,
    PatchMode, RunSpawner, RunToken, Status, SubmitGate, TreeEvent, TreeOptions, ValidationErrors,
    ValidationRun, Validator,
};
