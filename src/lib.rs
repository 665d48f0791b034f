//! Remote query translation.
//!
//! Query expressions are composed against [`query::Queryable`] on the client,
//! translated into a serializable [`remote::RemoteExpression`], shipped over a
//! caller-supplied transport, translated back into an executable
//! [`expression::Expression`] on the server and evaluated against live data.

pub mod error;
pub mod expression;
pub mod pipeline;
pub mod query;
pub mod remote;
pub mod transport;
pub mod translate;
pub mod types;
pub mod value;

pub use error::{QueryError, Result};
