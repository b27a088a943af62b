// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Interceptor chains.
//!
//! There are four kinds of interceptor: unary and streaming, each on the client
//! and on the server. A chain is built once, when its client or server is
//! created, from the interceptor names in configuration. Interceptors run in
//! the configured order: the first name is the outermost wrapper.
//!
//! An interceptor receives the call and a `Next` continuation. Calling
//! `next.run(call)` runs the rest of the chain and finally the terminal
//! invoker or handler; not calling it short-circuits the call.
//!
//! ```
//! use futures::future::BoxFuture;
//! use meshcall::interceptor::{UnaryCall, UnaryClientInterceptor, UnaryClientNext, UnaryReply};
//!
//! struct Tagging;
//!
//! impl UnaryClientInterceptor for Tagging {
//!     fn intercept<'a>(&'a self, mut call: UnaryCall, next: UnaryClientNext<'a>) -> BoxFuture<'a, UnaryReply> {
//!         call.ctx.append_outgoing("x-tag", "tagged");
//!         next.run(call)
//!     }
//! }
//! ```

pub use client::{StreamCall, StreamClientChain, StreamClientInterceptor, StreamClientNext, StreamReply, Streamer, UnaryCall, UnaryClientChain, UnaryClientInterceptor, UnaryClientNext, UnaryInvoker, UnaryReply};
pub use server::{
    StreamHandler, StreamServerCall, StreamServerChain, StreamServerInterceptor, StreamServerNext, UnaryHandler, UnaryServerCall, UnaryServerChain, UnaryServerInterceptor, UnaryServerNext,
};

use crate::registry::NamedRegistry;
use faststr::FastStr;
use std::sync::Arc;

/// Builds a new interceptor instance.
pub type InterceptorBuilder<I> = dyn Fn() -> Arc<I> + Send + Sync;

/// Instantiates the named interceptors in order.
///
/// Names with no registered builder are skipped with a warning.
pub(crate) fn instantiate<I: ?Sized>(kind: &str, names: &[FastStr], registry: &NamedRegistry<InterceptorBuilder<I>>) -> Vec<Arc<I>> {
    names
        .iter()
        .filter_map(|name| match registry.get(name) {
            Some(build) => Some(build()),
            None => {
                tracing::warn!(kind, interceptor = %name, "interceptor is not registered, skipped");
                None
            },
        })
        .collect()
}

/// Generates a chain type and its continuation for one interceptor kind.
macro_rules! interceptor_chain {
    (
        $(#[$chain_doc:meta])*
        chain: $chain:ident,
        $(#[$next_doc:meta])*
        next: $next:ident,
        interceptor: $interceptor:ident,
        terminal: $terminal:ident :: $terminal_fn:ident,
        call: $call:ty,
        output: $output:ty $(,)?
    ) => {
        $(#[$next_doc])*
        #[derive(Clone, Copy)]
        pub struct $next<'a> {
            rest: &'a [std::sync::Arc<dyn $interceptor>],
            terminal: &'a dyn $terminal,
        }

        impl<'a> $next<'a> {
            /// Runs the rest of the chain.
            pub fn run(self, call: $call) -> futures::future::BoxFuture<'a, $output> {
                match self.rest.split_first() {
                    Some((head, rest)) => head.intercept(call, $next { rest, terminal: self.terminal }),
                    None => self.terminal.$terminal_fn(call),
                }
            }
        }

        $(#[$chain_doc])*
        #[derive(Clone)]
        pub struct $chain {
            interceptors: std::sync::Arc<[std::sync::Arc<dyn $interceptor>]>,
        }

        impl $chain {
            /// Creates a chain running `interceptors` in order.
            pub fn new(interceptors: Vec<std::sync::Arc<dyn $interceptor>>) -> Self {
                Self {
                    interceptors: interceptors.into(),
                }
            }

            /// Number of interceptors in the chain.
            pub fn len(&self) -> usize {
                self.interceptors.len()
            }

            /// Whether calls go straight to the terminal.
            pub fn is_empty(&self) -> bool {
                self.interceptors.is_empty()
            }

            /// Runs `call` through the chain, ending at `terminal`.
            pub fn call<'a>(&'a self, call: $call, terminal: &'a dyn $terminal) -> futures::future::BoxFuture<'a, $output> {
                match &self.interceptors[..] {
                    [] => terminal.$terminal_fn(call),
                    [only] => only.intercept(call, $next { rest: &[], terminal }),
                    [first, rest @ ..] => first.intercept(call, $next { rest, terminal }),
                }
            }
        }

        impl Default for $chain {
            fn default() -> Self {
                Self::new(Vec::new())
            }
        }

        impl std::fmt::Debug for $chain {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($chain)).field("len", &self.interceptors.len()).finish()
            }
        }
    };
}

mod client;
mod server;
