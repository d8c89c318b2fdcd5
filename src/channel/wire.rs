//! Length-prefixed JSON framing for channel traffic.
//!
//! Each message is a big-endian `u32` byte length followed by that many bytes
//! of JSON.

use std::io::{ErrorKind, Read, Write};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use super::record::NdArrayRecord;

/// Upper bound on one framed message.
pub const MAX_MESSAGE_BYTES: usize = 512 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Subscribe { channel: String },
    Record { channel: String, record: NdArrayRecord },
    Error { message: String },
}

/// Serialize a message into its framed byte form.
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message).context("failed to serialize channel message")?;
    if body.len() > MAX_MESSAGE_BYTES {
        return Err(anyhow!(
            "channel message of {} bytes exceeds limit of {}",
            body.len(),
            MAX_MESSAGE_BYTES
        ));
    }
    let mut framed = Vec::with_capacity(body.len() + 4);
    framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<()> {
    let framed = encode_message(message)?;
    writer.write_all(&framed)?;
    writer.flush()?;
    Ok(())
}

/// Read one message. Returns `Ok(None)` on a clean end of stream.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<Message>> {
    match read_body(reader)? {
        Some(body) => decode_message(&body).map(Some),
        None => Ok(None),
    }
}

/// Read one framed body without decoding it. Returns `Ok(None)` on a clean
/// end of stream. Errors here leave the stream misaligned.
pub fn read_body<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(anyhow!("channel message length {} exceeds limit", len));
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .context("channel stream ended mid-message")?;
    Ok(Some(body))
}

/// Decode a framed body. A failure only affects this message.
pub fn decode_message(body: &[u8]) -> Result<Message> {
    serde_json::from_slice(body).context("invalid channel message")
}
