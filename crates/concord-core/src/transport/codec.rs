//! Wire envelopes and length-delimited framing
//!
//! Every frame is a big-endian `u32` length followed by a JSON-encoded
//! [`Envelope`].

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use concord_common::{ConcordError, NodeId, Result, Serial};

/// Largest accepted frame body
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Correlation id of a request and its response
pub type RequestId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// First frame of a joining node
    Hello { node_id: NodeId, max_serial: Serial },
    /// The receiver is the coordinator and accepted the joiner
    Welcome { coordinator_id: NodeId },
    /// The receiver is a participant; the joiner should try this node
    Redirect { coordinator_id: NodeId },
    /// The receiver has not finished its own election yet
    NotReady,
    Request {
        id: RequestId,
        caller: NodeId,
        service: String,
        method: String,
        payload: Value,
    },
    Response {
        id: RequestId,
        outcome: std::result::Result<Value, ConcordError>,
    },
    /// Fire-and-forget invocation, no response is sent
    Notify {
        caller: NodeId,
        service: String,
        method: String,
        payload: Value,
    },
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Hello { .. } => "hello",
            Envelope::Welcome { .. } => "welcome",
            Envelope::Redirect { .. } => "redirect",
            Envelope::NotReady => "not_ready",
            Envelope::Request { .. } => "request",
            Envelope::Response { .. } => "response",
            Envelope::Notify { .. } => "notify",
        }
    }
}

/// Encode one envelope as a complete frame
pub fn encode(envelope: &Envelope) -> Result<Bytes> {
    let body = serde_json::to_vec(envelope)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| {
            ConcordError::Serialization(format!("frame of {} bytes is too large", body.len()))
        })?;

    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32(len);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Envelope>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(ConcordError::CommunicationFailure(format!(
            "peer sent a frame of {} bytes",
            len
        )));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}
