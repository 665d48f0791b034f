//! Translation between native expression trees and remote expressions.
//!
//! Outbound translation inlines composed queries, evaluates client-only
//! subtrees, and turns runtime values into query arguments. Inbound
//! translation resolves every descriptor against the local type registry,
//! binds resource placeholders to data, and rewrites marker methods.

pub mod inbound;
pub mod outbound;
pub mod partial_eval;
pub mod values;

pub use inbound::{to_native, DataProvider, InboundTranslator};
pub use outbound::{to_remote, OutboundTranslator, TranslationOptions};
pub use partial_eval::partial_evaluate;
pub use values::{from_constant, to_constant, RemoteResult};
