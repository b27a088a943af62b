// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use super::UnaryReply;
use crate::codec::Message;
use crate::metadata::CallContext;
use crate::status::Status;
use crate::stream::{ServerStream, StreamDesc};
use faststr::FastStr;
use futures::future::BoxFuture;

/// An incoming unary call.
#[derive(Debug)]
pub struct UnaryServerCall {
    /// Request context.
    pub ctx: CallContext,
    /// Full method name, `/<service>/<method>`.
    pub method: FastStr,
    /// The decoded request.
    pub request: Box<dyn Message>,
}

/// Runs the application handler at the end of a unary server chain.
pub trait UnaryHandler: Send + Sync {
    /// Handles the request.
    fn handle(&self, call: UnaryServerCall) -> BoxFuture<'_, UnaryReply>;
}

/// Wraps incoming unary calls.
pub trait UnaryServerInterceptor: Send + Sync + 'static {
    /// Handles `call`, usually by delegating to `next`.
    fn intercept<'a>(&'a self, call: UnaryServerCall, next: UnaryServerNext<'a>) -> BoxFuture<'a, UnaryReply>;
}

/// An incoming streaming call.
pub struct StreamServerCall {
    /// Full method name, `/<service>/<method>`.
    pub method: FastStr,
    /// Method cardinality.
    pub desc: StreamDesc,
    /// The stream.
    pub stream: Box<dyn ServerStream>,
}

impl std::fmt::Debug for StreamServerCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamServerCall").field("method", &self.method).field("desc", &self.desc).finish_non_exhaustive()
    }
}

/// Runs the application handler at the end of a streaming server chain.
pub trait StreamHandler: Send + Sync {
    /// Serves the stream until the handler returns.
    fn handle(&self, call: StreamServerCall) -> BoxFuture<'_, Result<(), Status>>;
}

/// Wraps incoming streaming calls.
pub trait StreamServerInterceptor: Send + Sync + 'static {
    /// Handles `call`, usually by delegating to `next`.
    fn intercept<'a>(&'a self, call: StreamServerCall, next: StreamServerNext<'a>) -> BoxFuture<'a, Result<(), Status>>;
}

interceptor_chain! {
    /// The unary server interceptors of one server.
    chain: UnaryServerChain,
    /// The rest of a unary server chain.
    next: UnaryServerNext,
    interceptor: UnaryServerInterceptor,
    terminal: UnaryHandler::handle,
    call: UnaryServerCall,
    output: UnaryReply,
}

interceptor_chain! {
    /// The streaming server interceptors of one server.
    chain: StreamServerChain,
    /// The rest of a streaming server chain.
    next: StreamServerNext,
    interceptor: StreamServerInterceptor,
    terminal: StreamHandler::handle,
    call: StreamServerCall,
    output: Result<(), Status>,
}
