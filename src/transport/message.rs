// Request/response frames: a 4-byte big-endian body length, then a bincode body

use super::{Result, TransportError, MAX_FRAME_LEN};
use crate::remote::RemoteExpression;
use crate::translate::RemoteResult;
use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub query: RemoteExpression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    /// Execution failures travel as their message
    pub result: std::result::Result<RemoteResult, String>,
}

/// Append one frame holding `message` to `dst`
pub fn encode<T: Serialize>(message: &T, dst: &mut BytesMut) -> Result<()> {
    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(body.len()));
    }
    let mut header = [0u8; HEADER_LEN];
    BigEndian::write_u32(&mut header, body.len() as u32);
    dst.reserve(HEADER_LEN + body.len());
    dst.put_slice(&header);
    dst.put_slice(&body);
    Ok(())
}

/// Take one complete frame from the front of `src`, if buffered
pub fn decode<T: DeserializeOwned>(src: &mut BytesMut) -> Result<Option<T>> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }
    let len = BigEndian::read_u32(&src[..HEADER_LEN]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    if src.len() < HEADER_LEN + len {
        src.reserve(HEADER_LEN + len - src.len());
        return Ok(None);
    }
    src.advance(HEADER_LEN);
    let body = src.split_to(len);
    Ok(Some(bincode::deserialize(&body)?))
}

/// TCP stream with frame buffers
pub struct FramedStream {
    stream: TcpStream,
    read_buffer: BytesMut,
    write_buffer: BytesMut,
}

impl FramedStream {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buffer: BytesMut::with_capacity(8192),
            write_buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Next frame; `None` when the peer closed between frames
    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            if let Some(message) = decode(&mut self.read_buffer)? {
                return Ok(Some(message));
            }
            let n = self.stream.read_buf(&mut self.read_buffer).await?;
            if n == 0 {
                return if self.read_buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(TransportError::ConnectionClosed)
                };
            }
        }
    }

    pub async fn write<T: Serialize>(&mut self, message: &T) -> Result<()> {
        encode(message, &mut self.write_buffer)?;
        self.stream.write_all(&self.write_buffer).await?;
        self.stream.flush().await?;
        self.write_buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::Expression;
    use crate::translate::to_remote;
    use crate::types::Type;
    use crate::value::QueryableValue;

    fn request() -> Request {
        let query = to_remote(&Expression::queryable(QueryableValue::Resource {
            element_type: Type::string(),
            name: Some("names".to_string()),
        }))
        .unwrap();
        Request { id: 7, query }
    }

    #[test]
    fn test_partial_frames() {
        let mut encoded = BytesMut::new();
        encode(&request(), &mut encoded).unwrap();
        assert_eq!(
            BigEndian::read_u32(&encoded[..HEADER_LEN]) as usize,
            encoded.len() - HEADER_LEN
        );

        let mut src = BytesMut::new();
        src.extend_from_slice(&encoded[..3]);
        assert!(decode::<Request>(&mut src).unwrap().is_none());
        src.extend_from_slice(&encoded[3..encoded.len() - 1]);
        assert!(decode::<Request>(&mut src).unwrap().is_none());
        src.extend_from_slice(&encoded[encoded.len() - 1..]);
        assert_eq!(decode::<Request>(&mut src).unwrap(), Some(request()));
        assert!(src.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut src = BytesMut::new();
        encode(&request(), &mut src).unwrap();
        let response = Response {
            id: 7,
            result: Err("no data source".to_string()),
        };
        encode(&response, &mut src).unwrap();
        assert_eq!(decode::<Request>(&mut src).unwrap(), Some(request()));
        assert_eq!(decode::<Response>(&mut src).unwrap(), Some(response));
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut src = BytesMut::new();
        src.put_u32(u32::MAX);
        assert!(matches!(
            decode::<Request>(&mut src),
            Err(TransportError::FrameTooLarge(_))
        ));
    }
}
