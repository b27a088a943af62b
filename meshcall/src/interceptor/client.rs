// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use crate::codec::{Decoder, Message};
use crate::metadata::CallContext;
use crate::status::Status;
use crate::stream::{ClientStream, StreamDesc};
use faststr::FastStr;
use futures::future::BoxFuture;

/// An outgoing unary call.
pub struct UnaryCall {
    /// Call context.
    pub ctx: CallContext,
    /// Full method name, `/<service>/<method>`.
    pub method: FastStr,
    /// The request.
    pub request: Box<dyn Message>,
    /// Decodes the reply.
    pub decoder: Decoder,
}

impl std::fmt::Debug for UnaryCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnaryCall").field("method", &self.method).field("request", &self.request).finish_non_exhaustive()
    }
}

/// The reply of a unary call.
pub type UnaryReply = Result<Box<dyn Message>, Status>;

/// Performs a unary call at the end of a client chain.
pub trait UnaryInvoker: Send + Sync {
    /// Sends the request and waits for the reply.
    fn invoke(&self, call: UnaryCall) -> BoxFuture<'_, UnaryReply>;
}

/// Wraps outgoing unary calls.
pub trait UnaryClientInterceptor: Send + Sync + 'static {
    /// Handles `call`, usually by delegating to `next`.
    fn intercept<'a>(&'a self, call: UnaryCall, next: UnaryClientNext<'a>) -> BoxFuture<'a, UnaryReply>;
}

/// An outgoing streaming call.
#[derive(Debug, Clone)]
pub struct StreamCall {
    /// Call context.
    pub ctx: CallContext,
    /// Method cardinality.
    pub desc: StreamDesc,
    /// Full method name, `/<service>/<method>`.
    pub method: FastStr,
}

/// The stream opened for a streaming call.
pub type StreamReply = Result<Box<dyn ClientStream>, Status>;

/// Opens a stream at the end of a client chain.
pub trait Streamer: Send + Sync {
    /// Opens the stream.
    fn new_stream(&self, call: StreamCall) -> BoxFuture<'_, StreamReply>;
}

/// Wraps the opening of client streams.
///
/// The returned stream may itself be a wrapper, to observe individual messages.
pub trait StreamClientInterceptor: Send + Sync + 'static {
    /// Handles `call`, usually by delegating to `next`.
    fn intercept<'a>(&'a self, call: StreamCall, next: StreamClientNext<'a>) -> BoxFuture<'a, StreamReply>;
}

interceptor_chain! {
    /// The unary client interceptors of one client.
    chain: UnaryClientChain,
    /// The rest of a unary client chain.
    next: UnaryClientNext,
    interceptor: UnaryClientInterceptor,
    terminal: UnaryInvoker::invoke,
    call: UnaryCall,
    output: UnaryReply,
}

interceptor_chain! {
    /// The streaming client interceptors of one client.
    chain: StreamClientChain,
    /// The rest of a streaming client chain.
    next: StreamClientNext,
    interceptor: StreamClientInterceptor,
    terminal: Streamer::new_stream,
    call: StreamCall,
    output: StreamReply,
}
