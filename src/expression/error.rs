//! Error types for expression checking and evaluation.

use crate::types::Type;
use std::fmt;

/// Errors that can occur while checking or evaluating an expression
#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionError {
    /// Type mismatch in operation
    TypeMismatch {
        expected: Type,
        actual: Type,
        context: String,
    },

    /// Invalid operand types for operator
    InvalidOperandTypes {
        operator: String,
        left_type: Option<Type>,
        right_type: Option<Type>,
    },

    /// Parameter used outside of the lambda that declares it
    UnboundParameter { name: String },

    /// Member lookup failed
    UnknownMember { ty: Type, name: String },

    /// Wrong number of method arguments
    ArgumentCount {
        method: String,
        expected: usize,
        actual: usize,
    },

    /// Division by zero
    DivisionByZero,

    /// NULL value in non-nullable context
    UnexpectedNull { context: String },

    /// Sequence operator precondition failed
    Sequence { message: String },

    /// Generic evaluation error
    EvaluationError { message: String },
}

impl fmt::Display for ExpressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpressionError::TypeMismatch {
                expected,
                actual,
                context,
            } => {
                write!(
                    f,
                    "Type mismatch in {}: expected {}, got {}",
                    context, expected, actual
                )
            }

            ExpressionError::InvalidOperandTypes {
                operator,
                left_type,
                right_type,
            } => {
                let show = |t: &Option<Type>| {
                    t.as_ref()
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "none".to_string())
                };
                write!(
                    f,
                    "Invalid operand types for operator {}: left={}, right={}",
                    operator,
                    show(left_type),
                    show(right_type)
                )
            }

            ExpressionError::UnboundParameter { name } => {
                write!(f, "Parameter '{}' is not in scope", name)
            }

            ExpressionError::UnknownMember { ty, name } => {
                write!(f, "Type {} has no member '{}'", ty, name)
            }

            ExpressionError::ArgumentCount {
                method,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Method {} expects {} arguments, got {}",
                    method, expected, actual
                )
            }

            ExpressionError::DivisionByZero => write!(f, "Division by zero"),

            ExpressionError::UnexpectedNull { context } => {
                write!(f, "Unexpected NULL value in {}", context)
            }

            ExpressionError::Sequence { message } => write!(f, "{}", message),

            ExpressionError::EvaluationError { message } => {
                write!(f, "Expression evaluation error: {}", message)
            }
        }
    }
}

impl std::error::Error for ExpressionError {}

/// Result type for expression operations
pub type ExpressionResult<T> = Result<T, ExpressionError>;
