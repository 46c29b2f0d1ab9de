/// Error types for viewcache operations.
///
/// Construction and evaluation errors describe invalid input handed to the
/// core by its collaborators (the query parser, the admin surface, the change
/// listener). They are never retried internally. All errors are well-typed
/// and can be pattern-matched for precise error handling.
use thiserror::Error;

/// The main error type for viewcache operations.
///
/// All fallible operations return `Result<T, CacheError>`.
#[derive(Error, Debug)]
pub enum CacheError {
    /// An expression node is malformed (wrong arity, empty object, ...).
    #[error("Invalid expression: {reason}")]
    InvalidExpression {
        /// Description of why the expression is invalid
        reason: String,
    },

    /// An operator tag that the evaluator does not know.
    #[error("Unknown operator '{operator}'")]
    UnknownOperator {
        /// The unrecognised tag as written by the caller
        operator: String,
    },

    /// A stage definition carries an argument that cannot be executed.
    #[error("Invalid argument for stage '{stage}': {reason}")]
    InvalidStageArgument {
        /// Name of the stage (e.g. "limit")
        stage: String,
        /// Description of why the argument is invalid
        reason: String,
    },

    /// A delete was applied to a value the accumulator never recorded.
    ///
    /// The accumulator is already in its faulty state when this is returned;
    /// the event itself has been fully applied.
    #[error("Accumulator '{accumulator}' received a delete for unrecorded value {value}")]
    AccumulatorIntegrity {
        /// Output name of the affected accumulator
        accumulator: String,
        /// The value that could not be removed
        value: String,
    },

    /// A view or accumulator with the same identity already exists.
    #[error("{kind} '{name}' already exists")]
    DuplicateDefinition {
        /// What kind of definition collided ("view", "accumulator")
        kind: &'static str,
        /// Identity of the existing definition
        name: String,
    },

    /// A view or accumulator key is unknown.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// What kind of object was looked up
        kind: &'static str,
        /// The key that was not found
        name: String,
    },

    /// Serialization error when converting data to/from JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    /// Shorthand for [`CacheError::InvalidExpression`].
    pub(crate) fn invalid_expression(reason: impl Into<String>) -> Self {
        Self::InvalidExpression {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`CacheError::InvalidStageArgument`].
    pub(crate) fn invalid_stage(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidStageArgument {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error is the non-fatal integrity warning.
    pub fn is_integrity_warning(&self) -> bool {
        matches!(self, Self::AccumulatorIntegrity { .. })
    }
}

/// Result type alias for viewcache operations.
pub type CacheResult<T> = Result<T, CacheError>;
