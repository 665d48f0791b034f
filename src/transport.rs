//! Length-prefixed TCP transport for remote queries.

pub mod client;
pub mod message;
pub mod server;

pub use client::TcpRemoteCall;
pub use message::{FramedStream, Request, Response};
pub use server::Server;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Response {actual} does not answer request {expected}")]
    UnexpectedResponse { expected: u64, actual: u64 },
}

pub type Result<T> = std::result::Result<T, TransportError>;

pub const DEFAULT_PORT: u16 = 7878;

/// Largest accepted frame body
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
