//! Error taxonomy shared by translation, resolution and execution.

use crate::expression::ExpressionError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    /// A native expression shape the translator does not model.
    #[error("Translation error: {0}")]
    Translation(String),

    /// A type descriptor could not be matched to a runtime type.
    #[error("Unable to resolve type '{type_name}': {reason}")]
    Resolution { type_name: String, reason: String },

    /// A member descriptor could not be matched to a unique member.
    #[error("Unable to resolve member '{member}': {reason}")]
    MemberResolution { member: String, reason: String },

    /// The requested result type cannot hold the query's result.
    #[error("Result shape mismatch: requested {requested}, query produces {actual}")]
    ResultShape { requested: String, actual: String },

    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Failure raised by a data source, passed through as-is.
    #[error(transparent)]
    DataSource(anyhow::Error),

    /// Failure raised by the remote call, passed through as-is.
    #[error(transparent)]
    Remote(anyhow::Error),

    #[error("Cannot convert result: {0}")]
    Conversion(String),

    #[error("Execution was cancelled")]
    Cancelled,
}

impl QueryError {
    pub fn translation(message: impl Into<String>) -> Self {
        QueryError::Translation(message.into())
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        QueryError::NotSupported(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
