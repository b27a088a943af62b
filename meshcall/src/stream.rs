// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Stream capabilities seen by applications and interceptors.

use crate::codec::{decode_message, downcast, Decoder, Message};
use crate::metadata::{CallContext, Metadata};
use crate::status::Status;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Describes the cardinality of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDesc {
    /// Method name, without the service prefix.
    pub name: &'static str,
    /// The server sends a stream of replies.
    pub server_streams: bool,
    /// The client sends a stream of requests.
    pub client_streams: bool,
}

impl StreamDesc {
    /// One request, one reply.
    pub const fn unary(name: &'static str) -> Self {
        Self {
            name,
            server_streams: false,
            client_streams: false,
        }
    }

    /// One request, many replies.
    pub const fn server_streaming(name: &'static str) -> Self {
        Self {
            name,
            server_streams: true,
            client_streams: false,
        }
    }

    /// Many requests, one reply.
    pub const fn client_streaming(name: &'static str) -> Self {
        Self {
            name,
            server_streams: false,
            client_streams: true,
        }
    }

    /// Many requests, many replies.
    pub const fn bidi(name: &'static str) -> Self {
        Self {
            name,
            server_streams: true,
            client_streams: true,
        }
    }
}

/// The client side of one call.
///
/// Sending and receiving may happen concurrently from two tasks; two
/// concurrent senders (or receivers) are serialized.
pub trait ClientStream: Send + Sync {
    /// The context the stream was opened with.
    fn context(&self) -> &CallContext;

    /// Waits for the response header.
    fn header(&self) -> BoxFuture<'_, Result<Metadata, Status>>;

    /// The response trailer; empty until the stream has ended.
    fn trailer(&self) -> Metadata;

    /// Sends one request message.
    ///
    /// For a method that does not stream requests, the send side is closed
    /// after the first message.
    fn send_msg<'a>(&'a self, msg: &'a dyn Message) -> BoxFuture<'a, Result<(), Status>>;

    /// Half-closes the send side. Closing twice is a no-op.
    fn close_send(&self) -> BoxFuture<'_, Result<(), Status>>;

    /// Receives one reply, `Ok(None)` once the stream ended with an OK status.
    fn recv_msg(&self, decoder: Decoder) -> BoxFuture<'_, Result<Option<Box<dyn Message>>, Status>>;
}

/// The server side of one call.
pub trait ServerStream: Send + Sync {
    /// The request context: deadline, incoming metadata and peer.
    fn context(&self) -> &CallContext;

    /// Adds to the response header. Fails once the header has been sent.
    fn set_header(&self, md: Metadata) -> Result<(), Status>;

    /// Sends the response header now, merged with what [`set_header`](ServerStream::set_header) collected.
    fn send_header(&self, md: Metadata) -> BoxFuture<'_, Result<(), Status>>;

    /// Adds to the response trailer.
    fn set_trailer(&self, md: Metadata);

    /// Sends one reply message, sending the header first if needed.
    fn send_msg<'a>(&'a self, msg: &'a dyn Message) -> BoxFuture<'a, Result<(), Status>>;

    /// Receives one request, `Ok(None)` once the client half-closed.
    fn recv_msg(&self, decoder: Decoder) -> BoxFuture<'_, Result<Option<Box<dyn Message>>, Status>>;
}

impl<T: ServerStream + ?Sized> ServerStream for Arc<T> {
    fn context(&self) -> &CallContext {
        (**self).context()
    }

    fn set_header(&self, md: Metadata) -> Result<(), Status> {
        (**self).set_header(md)
    }

    fn send_header(&self, md: Metadata) -> BoxFuture<'_, Result<(), Status>> {
        (**self).send_header(md)
    }

    fn set_trailer(&self, md: Metadata) {
        (**self).set_trailer(md)
    }

    fn send_msg<'a>(&'a self, msg: &'a dyn Message) -> BoxFuture<'a, Result<(), Status>> {
        (**self).send_msg(msg)
    }

    fn recv_msg(&self, decoder: Decoder) -> BoxFuture<'_, Result<Option<Box<dyn Message>>, Status>> {
        (**self).recv_msg(decoder)
    }
}

/// Typed helpers over [`ClientStream`].
pub trait ClientStreamExt: ClientStream {
    /// Sends a typed request.
    fn send<'a, T: Message>(&'a self, msg: &'a T) -> BoxFuture<'a, Result<(), Status>> {
        self.send_msg(msg)
    }

    /// Receives a typed reply.
    fn recv<T>(&self) -> BoxFuture<'_, Result<Option<T>, Status>>
    where
        T: Message + DeserializeOwned,
    {
        async move {
            match self.recv_msg(decode_message::<T>).await? {
                Some(msg) => downcast::<T>(msg).map(Some),
                None => Ok(None),
            }
        }
        .boxed()
    }
}

impl<S: ClientStream + ?Sized> ClientStreamExt for S {}

/// Typed helpers over [`ServerStream`].
pub trait ServerStreamExt: ServerStream {
    /// Sends a typed reply.
    fn send<'a, T: Message>(&'a self, msg: &'a T) -> BoxFuture<'a, Result<(), Status>> {
        self.send_msg(msg)
    }

    /// Receives a typed request.
    fn recv<T>(&self) -> BoxFuture<'_, Result<Option<T>, Status>>
    where
        T: Message + DeserializeOwned,
    {
        async move {
            match self.recv_msg(decode_message::<T>).await? {
                Some(msg) => downcast::<T>(msg).map(Some),
                None => Ok(None),
            }
        }
        .boxed()
    }
}

impl<S: ServerStream + ?Sized> ServerStreamExt for S {}
