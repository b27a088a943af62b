// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! The lower transport: connections multiplexing frame streams.
//!
//! A connection carries many concurrent streams. Each stream moves
//! [`Frame`]s: the server answers with one [`Frame::Headers`], any number of
//! [`Frame::Data`] chunks and a final [`Frame::Trailers`]; the client sends its
//! request metadata when opening the stream and then [`Frame::Data`] chunks
//! until it closes its sink. Data chunks carry length-prefixed messages (see
//! [`framing`](crate::framing)) split at arbitrary boundaries.

pub mod memory;

use crate::endpoint::Endpoint;
use crate::metadata::Metadata;
use crate::status::{Status, StatusWire};
use bytes::Bytes;
use faststr::FastStr;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::Sink;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// One unit on a stream.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Response header.
    Headers(Metadata),
    /// A chunk of framed message bytes.
    Data(Bytes),
    /// Final status and trailer metadata.
    Trailers(Trailers),
}

/// The end of a response.
#[derive(Debug, Clone)]
pub struct Trailers {
    /// Final status of the call.
    pub status: StatusWire,
    /// Trailer metadata.
    pub metadata: Metadata,
}

/// Sending half of a stream.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = Status> + Send>>;
/// Receiving half of a stream.
pub type FrameStream = BoxStream<'static, Result<Frame, Status>>;

/// Both halves of one stream.
pub struct TransportStream {
    /// Outbound frames.
    pub sink: FrameSink,
    /// Inbound frames.
    pub stream: FrameStream,
}

impl fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportStream").finish_non_exhaustive()
    }
}

/// What the client sends when opening a stream.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Full method name.
    pub method: FastStr,
    /// Request metadata.
    pub metadata: Metadata,
}

/// The code of a GOAWAY frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoAwayCode {
    /// Orderly shutdown.
    NoError,
    /// The peer thinks we ping too often.
    TooManyPings,
    /// Anything else.
    Other(u32),
}

/// Why an established connection ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// Closed from this side.
    Local,
    /// The peer sent GOAWAY.
    GoAway(GoAwayCode),
    /// The connection failed.
    Error(Status),
}

impl CloseReason {
    /// Whether the peer complained about keepalive pings.
    pub fn is_too_many_pings(&self) -> bool {
        matches!(self, CloseReason::GoAway(GoAwayCode::TooManyPings))
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => f.write_str("closed locally"),
            CloseReason::GoAway(code) => write!(f, "goaway received: {code:?}"),
            CloseReason::Error(st) => write!(f, "connection error: {st}"),
        }
    }
}

/// An established client connection.
pub trait ClientTransport: Send + Sync + 'static {
    /// Opens a stream.
    fn new_stream(&self, request: StreamRequest) -> BoxFuture<'_, Result<TransportStream, Status>>;
    /// Closes the connection and every stream on it.
    fn close(&self) -> Result<(), Status>;
}

/// A connection handed out by a [`Connector`].
pub struct Connection {
    /// The connection.
    pub transport: Arc<dyn ClientTransport>,
    /// Resolves once, when the connection ends.
    pub closed: BoxFuture<'static, CloseReason>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Settings for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Handshake deadline.
    pub connect_timeout: Duration,
    /// Keepalive ping interval; zero disables keepalive.
    pub keepalive: Duration,
    /// How long to wait for a keepalive ack.
    pub keepalive_timeout: Duration,
}

/// Dials endpoints of one scheme.
pub trait Connector: Send + Sync + 'static {
    /// Connects and completes the handshake.
    fn connect(&self, endpoint: &Endpoint, options: &ConnectOptions) -> BoxFuture<'static, Result<Connection, Status>>;
}

/// A stream accepted by the server side of a connection.
pub struct IncomingStream {
    /// Full method name.
    pub method: FastStr,
    /// Request metadata.
    pub metadata: Metadata,
    /// Frames to and from the client.
    pub stream: TransportStream,
}

impl fmt::Debug for IncomingStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingStream").field("method", &self.method).field("metadata", &self.metadata).finish_non_exhaustive()
    }
}

/// Controls the server side of a connection.
pub trait ServerTransport: Send + Sync + 'static {
    /// Sends GOAWAY: no new streams, existing ones run to completion.
    fn drain(&self);
    /// Closes the connection and every stream on it.
    fn close(&self);
}

/// An accepted connection.
pub struct ServerConnection {
    /// The client's address.
    pub remote_addr: FastStr,
    /// Streams opened by the client; ends when the connection drains or closes.
    pub incoming: BoxStream<'static, IncomingStream>,
    /// Connection control.
    pub transport: Arc<dyn ServerTransport>,
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection").field("remote_addr", &self.remote_addr).finish_non_exhaustive()
    }
}

/// Accepts connections.
pub trait Listener: Send + 'static {
    /// The address being listened on.
    fn local_addr(&self) -> FastStr;
    /// Waits for the next connection; fails once the listener is closed.
    fn accept(&mut self) -> BoxFuture<'_, Result<ServerConnection, Status>>;
}

/// Binds a [`Listener`] to an address.
pub type ListenerBuilder = dyn Fn(FastStr) -> BoxFuture<'static, Result<Box<dyn Listener>, Status>> + Send + Sync;
