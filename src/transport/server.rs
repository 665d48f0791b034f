// Query execution server

use crate::pipeline::{AsyncExecutionPipeline, CancellationToken};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use super::message::{FramedStream, Request, Response};
use super::{Result, DEFAULT_PORT};

pub struct Server {
    pipeline: AsyncExecutionPipeline,
    max_connections: usize,
}

impl Server {
    pub fn new(pipeline: AsyncExecutionPipeline, max_connections: usize) -> Self {
        Self {
            pipeline,
            max_connections,
        }
    }

    pub async fn run(&self, addr: Option<SocketAddr>) -> Result<()> {
        let addr = addr.unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)));
        let listener = TcpListener::bind(addr).await?;
        info!("query server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let connection_semaphore = Arc::new(Semaphore::new(self.max_connections));

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let pipeline = self.pipeline.clone();
            let semaphore = connection_semaphore.clone();

            tokio::spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("failed to acquire connection permit");
                        return;
                    }
                };

                debug!("new connection from {}", peer_addr);
                if let Err(e) = handle_connection(stream, pipeline).await {
                    warn!("connection error from {}: {}", peer_addr, e);
                }
                debug!("connection closed from {}", peer_addr);
            });
        }
    }
}

/// Answer requests in order until the peer disconnects
async fn handle_connection(stream: TcpStream, pipeline: AsyncExecutionPipeline) -> Result<()> {
    let mut framed = FramedStream::new(stream);
    while let Some(request) = framed.read::<Request>().await? {
        let token = CancellationToken::new();
        let result = pipeline
            .execute_async(request.query, &token)
            .await
            .map_err(|e| e.to_string());
        framed
            .write(&Response {
                id: request.id,
                result,
            })
            .await?;
    }
    Ok(())
}
