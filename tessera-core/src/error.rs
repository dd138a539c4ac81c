use crate::{EnumEncoding, Error};
use std::time::Duration;
use thiserror::Error;

/// Typed root causes carried inside [`Error`](crate::Error).
///
/// Callers can recover the variant with `error.downcast_ref::<EngineError>()`
/// or classify any error chain with [`error_kind`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Malformed query method name `{0}`, it must start with one of: findBy, findAllBy")]
    MalformedQueryName(String),
    #[error("Field `{field}` does not exist in entity `{entity}`")]
    FieldNotFound { entity: String, field: String },
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
    #[error("No entity descriptor registered for `{0}`")]
    DescriptorNotFound(String),
    #[error("The query expects {expected} arguments but {actual} were provided")]
    PlaceholderArgumentCountMismatch { expected: usize, actual: usize },
    #[error("Entity `{entity}` was saved without a value for its identity field `{field}`")]
    MissingIdentity { entity: String, field: String },
    #[error("Cannot encode or decode `{value}` as {target} using the {encoding} encoding")]
    UnsupportedEnumEncoding {
        value: String,
        target: &'static str,
        encoding: EnumEncoding,
    },
    #[error("Could not reach `{endpoint}`")]
    Connectivity { endpoint: String },
    #[error("The connection pool is closed")]
    PoolClosed,
    #[error("Batch for table `{table}` failed after {attempts} attempts ({rows} rows spilled)")]
    BatchExhausted {
        table: String,
        attempts: u32,
        rows: usize,
    },
    #[error("Timed out after {0:?} waiting for a connection")]
    AcquireTimeout(Duration),
}

/// Coarse classification driving retry policies on the caller side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The query itself is wrong, retrying will not help.
    Query,
    /// Acquiring a live connection failed.
    Resource,
    /// A batch flush exhausted its attempts.
    Batch,
    /// Invariant violation inside the engine or its callers.
    Programming,
    /// A stored value could not be mapped back.
    Mapping,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::MalformedQueryName(..)
            | EngineError::FieldNotFound { .. }
            | EngineError::NotImplemented(..) => ErrorKind::Query,
            EngineError::DescriptorNotFound(..)
            | EngineError::PlaceholderArgumentCountMismatch { .. } => ErrorKind::Programming,
            EngineError::MissingIdentity { .. } | EngineError::UnsupportedEnumEncoding { .. } => {
                ErrorKind::Mapping
            }
            EngineError::Connectivity { .. }
            | EngineError::PoolClosed
            | EngineError::AcquireTimeout(..) => ErrorKind::Resource,
            EngineError::BatchExhausted { .. } => ErrorKind::Batch,
        }
    }
}

/// Kind of the outermost [`EngineError`] of the error, either attached as
/// context or found in the source chain.
pub fn error_kind(error: &Error) -> Option<ErrorKind> {
    error
        .downcast_ref::<EngineError>()
        .or_else(|| {
            error
                .chain()
                .find_map(|cause| cause.downcast_ref::<EngineError>())
        })
        .map(EngineError::kind)
}
