// Client side of the query transport

use super::message::{FramedStream, Request, Response};
use super::{Result, TransportError};
use crate::query::AsyncRemoteCall;
use crate::remote::RemoteExpression;
use crate::translate::RemoteResult;
use crate::value::BoxFuture;
use log::debug;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Sends queries over one lazily opened connection.
///
/// Requests on a connection are answered in order, so calls are serialized.
/// A failed call drops the connection; the next call reconnects.
pub struct TcpRemoteCall {
    addr: SocketAddr,
    connection: Mutex<Option<FramedStream>>,
    next_id: AtomicU64,
}

impl TcpRemoteCall {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connection: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send(&self, query: RemoteExpression) -> Result<Response> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            debug!("connecting to {}", self.addr);
            *guard = Some(FramedStream::new(TcpStream::connect(self.addr).await?));
        }
        let connection = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let result = exchange(connection, Request { id, query }).await;
        if result.is_err() {
            *guard = None;
        }
        let response = result?;
        if response.id != id {
            *guard = None;
            return Err(TransportError::UnexpectedResponse {
                expected: id,
                actual: response.id,
            });
        }
        Ok(response)
    }
}

async fn exchange(connection: &mut FramedStream, request: Request) -> Result<Response> {
    connection.write(&request).await?;
    connection
        .read::<Response>()
        .await?
        .ok_or(TransportError::ConnectionClosed)
}

impl AsyncRemoteCall for TcpRemoteCall {
    fn call_async(&self, query: RemoteExpression) -> BoxFuture<'_, anyhow::Result<RemoteResult>> {
        Box::pin(async move {
            let response = self.send(query).await?;
            response.result.map_err(anyhow::Error::msg)
        })
    }
}
