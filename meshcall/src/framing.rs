// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Length-prefixed message framing.
//!
//! Every message on a stream is a 5-byte header followed by the payload:
//!
//! ```text
//! +------------------+-----------------------------+----------------+
//! | compressed (u8)  | payload length (u32, BE)    | payload ...    |
//! +------------------+-----------------------------+----------------+
//! ```

use crate::codec::{Codec, Message};
use crate::compress::{Compressor, IDENTITY};
use crate::status::Status;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use faststr::FastStr;
use futures::{Stream, StreamExt};
use std::io::Read;
use std::sync::Arc;

/// Length of the frame header.
pub const HEADER_LEN: usize = 5;
/// Largest payload the framing layer accepts regardless of configuration.
pub const MAX_PLATFORM_MESSAGE_SIZE: usize = i32::MAX as usize;
/// Default limit for received messages, 4 MiB.
pub const DEFAULT_MAX_RECEIVE_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
/// Default limit for sent messages.
pub const DEFAULT_MAX_SEND_MESSAGE_SIZE: usize = MAX_PLATFORM_MESSAGE_SIZE;

const FLAG_NONE: u8 = 0;
const FLAG_COMPRESSED: u8 = 1;

/// One undecoded message as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Whether the compression flag was set.
    pub compressed: bool,
    /// The wire payload.
    pub payload: Bytes,
}

/// Prepends the frame header to `payload`.
pub fn encode_frame(payload: &[u8], compressed: bool) -> Result<Bytes, Status> {
    if payload.len() > MAX_PLATFORM_MESSAGE_SIZE {
        return Err(Status::resource_exhausted(format!(
            "message too large for the wire ({} vs. {MAX_PLATFORM_MESSAGE_SIZE})",
            payload.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(if compressed { FLAG_COMPRESSED } else { FLAG_NONE });
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Marshals, optionally compresses and frames one message.
///
/// `max_send` applies to the wire payload, i.e. after compression.
pub fn encode_message(msg: &dyn Message, codec: Codec, compressor: Option<&dyn Compressor>, max_send: usize) -> Result<Bytes, Status> {
    let data = msg.encode(codec)?;
    let (payload, compressed) = match compressor {
        Some(c) => (c.compress(&data)?, true),
        None => (data, false),
    };
    if payload.len() > max_send {
        return Err(Status::resource_exhausted(format!(
            "trying to send message larger than max ({} vs. {max_send})",
            payload.len()
        )));
    }
    encode_frame(&payload, compressed)
}

/// How compressed messages received on a stream are decoded.
///
/// Resolved from the peer's `meshcall-encoding` header, not from local configuration.
#[derive(Clone, Default)]
pub enum RecvEncoding {
    /// No encoding announced.
    #[default]
    Identity,
    /// A registered compressor.
    Known(Arc<dyn Compressor>),
    /// An encoding with no registered compressor.
    Unknown(FastStr),
}

impl std::fmt::Debug for RecvEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecvEncoding::Identity => f.write_str("Identity"),
            RecvEncoding::Known(c) => write!(f, "Known({})", c.name()),
            RecvEncoding::Unknown(n) => write!(f, "Unknown({n})"),
        }
    }
}

impl RecvEncoding {
    /// Resolves an announced encoding name with `lookup`.
    pub fn resolve(name: Option<&str>, lookup: impl FnOnce(&str) -> Option<Arc<dyn Compressor>>) -> Self {
        match name {
            None => RecvEncoding::Identity,
            Some(n) if n.is_empty() || n == IDENTITY => RecvEncoding::Identity,
            Some(n) => match lookup(n) {
                Some(c) => RecvEncoding::Known(c),
                None => RecvEncoding::Unknown(FastStr::new(n)),
            },
        }
    }
}

/// Turns a raw message into its uncompressed payload, enforcing `max_receive`.
pub fn decode_payload(raw: RawMessage, encoding: &RecvEncoding, max_receive: usize) -> Result<Bytes, Status> {
    if !raw.compressed {
        return Ok(raw.payload);
    }
    let compressor = match encoding {
        RecvEncoding::Known(c) => c,
        RecvEncoding::Identity => return Err(Status::internal("compressed flag set with identity or empty encoding")),
        RecvEncoding::Unknown(name) => return Err(Status::unimplemented(format!("decompressor is not installed for encoding {name:?}"))),
    };
    if let Some(estimate) = compressor.decompressed_size(&raw.payload) {
        if estimate > max_receive {
            return Err(too_large(estimate, max_receive));
        }
    }
    let mut out = Vec::new();
    compressor
        .decompressor(&raw.payload)
        .take((max_receive as u64).saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| Status::internal(format!("failed to decompress the received message: {e}")))?;
    if out.len() > max_receive {
        return Err(too_large(out.len(), max_receive));
    }
    Ok(Bytes::from(out))
}

fn too_large(got: usize, max: usize) -> Status {
    Status::resource_exhausted(format!("received message larger than max ({got} vs. {max})"))
}

/// Reassembles framed messages from a stream of arbitrary byte chunks.
pub struct Parser<S> {
    source: S,
    buf: BytesMut,
}

impl<S> Parser<S>
where
    S: Stream<Item = Result<Bytes, Status>> + Unpin,
{
    /// Creates a parser over `source`.
    pub fn new(source: S) -> Self {
        Self { source, buf: BytesMut::new() }
    }

    /// The underlying source.
    pub fn get_ref(&self) -> &S {
        &self.source
    }

    /// The underlying source.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Reads the next message.
    ///
    /// Returns `Ok(None)` on a clean end of stream, including a stream that ends
    /// inside a header. The declared length is checked before any of the body is
    /// read, so an oversized message never causes a large allocation.
    pub async fn recv_msg(&mut self, max_receive: usize) -> Result<Option<RawMessage>, Status> {
        if !self.fill(HEADER_LEN).await? {
            self.buf.clear();
            return Ok(None);
        }
        let compressed = match self.buf[0] {
            FLAG_NONE => false,
            FLAG_COMPRESSED => true,
            flag => return Err(Status::internal(format!("invalid compression flag {flag}"))),
        };
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > MAX_PLATFORM_MESSAGE_SIZE || len > max_receive {
            return Err(too_large(len, max_receive.min(MAX_PLATFORM_MESSAGE_SIZE)));
        }
        self.buf.advance(HEADER_LEN);
        if !self.fill(len).await? {
            return Err(Status::internal(format!("unexpected end of stream: got {} of {len} message bytes", self.buf.len())));
        }
        let payload = self.buf.split_to(len).freeze();
        Ok(Some(RawMessage { compressed, payload }))
    }

    async fn fill(&mut self, want: usize) -> Result<bool, Status> {
        while self.buf.len() < want {
            match self.source.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(e),
                None => return Ok(false),
            }
        }
        Ok(true)
    }
}
