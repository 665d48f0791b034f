//! Operator definitions for expressions.

use crate::types::{PrimitiveType, Type};
use serde::{Deserialize, Serialize};

/// Binary operators supported in expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOperator {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Rem,

    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // Logical, short-circuiting
    And,
    Or,

    /// `left ?? right`
    Coalesce,
}

impl BinaryOperator {
    /// Get the output type of this operator given input types
    pub fn output_type(&self, left: &Type, right: &Type) -> Option<Type> {
        match self {
            BinaryOperator::Add
            | BinaryOperator::Sub
            | BinaryOperator::Mul
            | BinaryOperator::Div
            | BinaryOperator::Rem => {
                if *self == BinaryOperator::Add
                    && left == &Type::string()
                    && right == &Type::string()
                {
                    return Some(Type::string());
                }
                let lifted = matches!(left, Type::Nullable(_)) || matches!(right, Type::Nullable(_));
                match (left.non_nullable(), right.non_nullable()) {
                    (Type::Primitive(l), Type::Primitive(r)) if l == r && l.is_numeric() => {
                        let ty = Type::Primitive(*l);
                        Some(if lifted { Type::nullable(ty) } else { ty })
                    }
                    _ => None,
                }
            }

            BinaryOperator::Eq | BinaryOperator::Ne => {
                if Self::equatable(left, right) {
                    Some(Type::bool())
                } else {
                    None
                }
            }

            BinaryOperator::Lt | BinaryOperator::Le | BinaryOperator::Gt | BinaryOperator::Ge => {
                let (l, r) = (left.non_nullable(), right.non_nullable());
                let ordered = match l {
                    Type::Primitive(p) => *p != PrimitiveType::Object,
                    Type::Named(named) => named.def().is_enum(),
                    _ => false,
                };
                (ordered && l == r).then(Type::bool)
            }

            BinaryOperator::And | BinaryOperator::Or => {
                (left.is_bool() && right.is_bool()).then(Type::bool)
            }

            BinaryOperator::Coalesce => {
                if !left.accepts_null() {
                    return None;
                }
                if left.non_nullable() == right || left == right {
                    Some(right.clone())
                } else {
                    None
                }
            }
        }
    }

    /// Whether values of the two types can be compared for equality
    fn equatable(left: &Type, right: &Type) -> bool {
        left == right
            || left.non_nullable() == right.non_nullable()
            || left.is_assignable_from(right)
            || right.is_assignable_from(left)
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOperator::Eq
                | BinaryOperator::Ne
                | BinaryOperator::Lt
                | BinaryOperator::Le
                | BinaryOperator::Gt
                | BinaryOperator::Ge
        )
    }

    /// Get the display string for this operator
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Sub => "-",
            BinaryOperator::Mul => "*",
            BinaryOperator::Div => "/",
            BinaryOperator::Rem => "%",
            BinaryOperator::Eq => "==",
            BinaryOperator::Ne => "!=",
            BinaryOperator::Lt => "<",
            BinaryOperator::Le => "<=",
            BinaryOperator::Gt => ">",
            BinaryOperator::Ge => ">=",
            BinaryOperator::And => "&&",
            BinaryOperator::Or => "||",
            BinaryOperator::Coalesce => "??",
        }
    }
}

/// Unary operators supported in expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOperator {
    Not,
    Negate,

    // NULL checks
    IsNull,
    IsNotNull,
}

impl UnaryOperator {
    /// Get the output type of this operator given input type
    pub fn output_type(&self, operand: &Type) -> Option<Type> {
        match self {
            UnaryOperator::Not => operand.is_bool().then(Type::bool),

            // NULL checks always return boolean, but only on nullable operands
            UnaryOperator::IsNull | UnaryOperator::IsNotNull => {
                operand.accepts_null().then(Type::bool)
            }

            UnaryOperator::Negate => match operand.non_nullable() {
                Type::Primitive(p) if p.is_numeric() => Some(operand.clone()),
                _ => None,
            },
        }
    }

    /// Get the display string for this operator
    pub fn as_str(&self) -> &'static str {
        match self {
            UnaryOperator::Not => "!",
            UnaryOperator::Negate => "-",
            UnaryOperator::IsNull => "IS NULL",
            UnaryOperator::IsNotNull => "IS NOT NULL",
        }
    }
}
