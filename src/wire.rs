//! Length-prefixed framing for envelope lists.
//!
//! A frame is a u32 big-endian length followed by a postcard body. The first
//! frame on a client-initiated link is a [`LinkHello`] announcing the
//! client's identity; every later frame is an [`EnvelopeList`]. Envelopes
//! are whole or not delivered; partial reads never escape this module.

use crate::types::{EnvelopeList, MAX_FRAME_SIZE, MAX_IDENTITY_SIZE, PeerIdentity};
use crate::serde_safe::{self, BoundedBytes};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {len} bytes exceeds limit {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed frame body: {0}")]
    Malformed(#[from] postcard::Error),
}

/// Identity announcement, sent once by the dialing side before any envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkHello {
    pub identity: BoundedBytes<MAX_IDENTITY_SIZE>,
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<(), WireError> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge { len: body.len(), max: MAX_FRAME_SIZE });
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, WireError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge { len, max: MAX_FRAME_SIZE });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

pub async fn write_envelopes<W: AsyncWrite + Unpin>(
    writer: &mut W,
    list: &EnvelopeList,
) -> Result<(), WireError> {
    let body = serde_safe::to_bytes(list)?;
    write_frame(writer, &body).await
}

pub async fn read_envelopes<R: AsyncRead + Unpin>(reader: &mut R) -> Result<EnvelopeList, WireError> {
    let body = read_frame(reader).await?;
    Ok(serde_safe::from_bytes(&body)?)
}

pub async fn write_hello<W: AsyncWrite + Unpin>(
    writer: &mut W,
    identity: &PeerIdentity,
) -> Result<(), WireError> {
    let hello = LinkHello { identity: BoundedBytes::new_unchecked(identity.clone()) };
    let body = serde_safe::to_bytes(&hello)?;
    write_frame(writer, &body).await
}

pub async fn read_hello<R: AsyncRead + Unpin>(reader: &mut R) -> Result<PeerIdentity, WireError> {
    let body = read_frame(reader).await?;
    let hello: LinkHello = serde_safe::from_bytes(&body)?;
    Ok(hello.identity.into_inner())
}
