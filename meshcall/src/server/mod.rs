// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Server component.
//!
//! A [`Server`] routes each incoming stream by its method name,
//! `/<package>.<Service>/<Method>`, to a registered handler. Every connection
//! and every stream runs on its own task.

mod stream;

use crate::codec::{downcast, Codec, Decoder, Message};
use crate::compress::IDENTITY;
use crate::config::{InterceptorNames, ServerConfig};
use crate::framing::RecvEncoding;
use crate::interceptor::{instantiate, StreamHandler, StreamServerCall, StreamServerChain, UnaryHandler, UnaryReply, UnaryServerCall, UnaryServerChain};
use crate::metadata::{decode_timeout, CallContext, Metadata, CONTENT_TYPE, ENCODING, TIMEOUT};
use crate::registry::Registries;
use crate::status::Status;
use crate::stream::{ServerStream, StreamDesc};
use crate::transport::{IncomingStream, Listener, ServerConnection, ServerTransport};
use faststr::FastStr;
use futures::future::{self, BoxFuture};
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use stream::{RpcServerStream, StreamSettings};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

type UnaryFn = dyn Fn(CallContext, Box<dyn Message>) -> BoxFuture<'static, UnaryReply> + Send + Sync;

/// Serves a stream until it returns; the returned status ends the stream.
pub type MethodHandle = dyn Fn(StreamServerCall) -> BoxFuture<'static, Result<(), Status>> + Send + Sync;

/// A unary method.
#[derive(Clone)]
pub struct MethodDesc {
    name: FastStr,
    decoder: Decoder,
    handler: Arc<UnaryFn>,
}

impl std::fmt::Debug for MethodDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDesc").field("name", &self.name).finish_non_exhaustive()
    }
}

impl MethodDesc {
    /// A unary method served by `handler`.
    pub fn unary<Req, Resp, F, Fut>(name: impl Into<FastStr>, handler: F) -> Self
    where
        Req: Message + DeserializeOwned,
        Resp: Message,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let handler: Arc<UnaryFn> = Arc::new(move |ctx: CallContext, request: Box<dyn Message>| match downcast::<Req>(request) {
            Ok(request) => handler(ctx, request).map(|res| res.map(|reply| Box::new(reply) as Box<dyn Message>)).boxed(),
            Err(e) => future::ready(Err(e)).boxed(),
        });
        Self {
            name: name.into(),
            decoder: crate::codec::decode_message::<Req>,
            handler,
        }
    }

    /// The method name.
    pub fn name(&self) -> &FastStr {
        &self.name
    }
}

impl UnaryHandler for MethodDesc {
    fn handle(&self, call: UnaryServerCall) -> BoxFuture<'_, UnaryReply> {
        (self.handler)(call.ctx, call.request)
    }
}

/// A streaming method.
#[derive(Clone)]
pub struct StreamMethodDesc {
    desc: StreamDesc,
    handler: Arc<MethodHandle>,
}

impl std::fmt::Debug for StreamMethodDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMethodDesc").field("desc", &self.desc).finish_non_exhaustive()
    }
}

impl StreamMethodDesc {
    /// A streaming method served by `handler`; `desc.name` is the method name.
    pub fn new<F, Fut>(desc: StreamDesc, handler: F) -> Self
    where
        F: Fn(StreamServerCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        Self {
            desc,
            handler: Arc::new(move |call: StreamServerCall| handler(call).boxed()),
        }
    }

    /// The method shape.
    pub fn desc(&self) -> StreamDesc {
        self.desc
    }
}

impl StreamHandler for StreamMethodDesc {
    fn handle(&self, call: StreamServerCall) -> BoxFuture<'_, Result<(), Status>> {
        (self.handler)(call)
    }
}

/// The methods of one service.
#[derive(Debug, Clone)]
pub struct ServiceDesc {
    /// Full service name, `<package>.<Service>`.
    pub name: FastStr,
    /// Unary methods.
    pub methods: Vec<MethodDesc>,
    /// Streaming methods.
    pub streams: Vec<StreamMethodDesc>,
}

impl ServiceDesc {
    /// A service with no methods yet.
    pub fn new(name: impl Into<FastStr>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            streams: Vec::new(),
        }
    }

    /// Adds a unary method.
    pub fn with_method(mut self, method: MethodDesc) -> Self {
        self.methods.push(method);
        self
    }

    /// Adds a streaming method.
    pub fn with_stream(mut self, stream: StreamMethodDesc) -> Self {
        self.streams.push(stream);
        self
    }
}

struct ServiceEntry {
    methods: HashMap<FastStr, MethodDesc>,
    streams: HashMap<FastStr, StreamMethodDesc>,
}

enum Route {
    Unary(MethodDesc),
    Stream(StreamMethodDesc),
    Unknown(Status),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StopMode {
    Graceful,
    Immediate,
}

#[derive(Default)]
struct ConnBook {
    next_id: u64,
    // live transports by listener address
    conns: HashMap<FastStr, HashMap<u64, Arc<dyn ServerTransport>>>,
    stopping: Option<StopMode>,
}

impl ConnBook {
    fn is_empty(&self) -> bool {
        self.conns.values().all(HashMap::is_empty)
    }
}

/// An RPC server.
///
/// Cheap to clone; clones serve the same services.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let services: Vec<FastStr> = self.inner.services.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        f.debug_struct("Server").field("services", &services).finish_non_exhaustive()
    }
}

struct ServerInner {
    config: ServerConfig,
    registries: Arc<Registries>,
    services: RwLock<HashMap<FastStr, Arc<ServiceEntry>>>,
    unknown: RwLock<Option<StreamMethodDesc>>,
    unary_chain: UnaryServerChain,
    stream_chain: StreamServerChain,
    // parent of every call context; cancelled by `stop`
    root: CallContext,
    book: Mutex<ConnBook>,
    drained: Notify,
    shutdown: CancellationToken,
}

impl Server {
    /// Creates a server with the interceptors named in `config`.
    pub fn new(config: ServerConfig, registries: Arc<Registries>) -> Self {
        Self::with_global_interceptors(config, &InterceptorNames::default(), registries)
    }

    /// Like [`Server::new`], with interceptors that run before the server's own.
    pub fn with_global_interceptors(config: ServerConfig, global: &InterceptorNames, registries: Arc<Registries>) -> Self {
        let (unary_names, stream_names) = InterceptorNames::merged(global, &config.interceptors);
        let unary_chain = UnaryServerChain::new(instantiate("unary server", &unary_names, &registries.unary_server_interceptors));
        let stream_chain = StreamServerChain::new(instantiate("stream server", &stream_names, &registries.stream_server_interceptors));
        Self {
            inner: Arc::new(ServerInner {
                config,
                registries,
                services: RwLock::new(HashMap::new()),
                unknown: RwLock::new(None),
                unary_chain,
                stream_chain,
                root: CallContext::background(),
                book: Mutex::new(ConnBook::default()),
                drained: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Serves unknown methods with `handler` instead of failing them with
    /// `UNIMPLEMENTED`. The handler runs behind the streaming interceptors.
    pub fn with_unknown_handler<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(StreamServerCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        *self.inner.unknown.write().unwrap_or_else(PoisonError::into_inner) = Some(StreamMethodDesc::new(StreamDesc::bidi("unknown"), handler));
        self
    }

    /// Registers a service; fails if one with the same name exists.
    pub fn register_service(&self, desc: ServiceDesc) -> Result<(), Status> {
        let mut services = self.inner.services.write().unwrap_or_else(PoisonError::into_inner);
        if services.contains_key(&desc.name) {
            return Err(Status::new(crate::status::Code::AlreadyExists, format!("service {} is already registered", desc.name)));
        }
        let entry = ServiceEntry {
            methods: desc.methods.into_iter().map(|m| (m.name.clone(), m)).collect(),
            streams: desc.streams.into_iter().map(|s| (FastStr::from_static_str(s.desc.name), s)).collect(),
        };
        tracing::debug!(service = %desc.name, methods = entry.methods.len(), streams = entry.streams.len(), "service registered");
        services.insert(desc.name, Arc::new(entry));
        Ok(())
    }

    /// Binds `addr` with the listener registered for `scheme` and serves it.
    pub async fn listen_and_serve(&self, scheme: &str, addr: impl Into<FastStr>) -> Result<(), Status> {
        let builder = self.inner.registries.listeners.get(scheme).ok_or_else(|| Status::not_found(format!("no listener registered for scheme {scheme:?}")))?;
        let listener = builder(addr.into()).await?;
        self.serve(listener).await
    }

    /// Accepts connections until the server stops.
    ///
    /// Returns `Ok` when stopped and the accept error otherwise.
    pub async fn serve(&self, mut listener: Box<dyn Listener>) -> Result<(), Status> {
        let addr = listener.local_addr();
        if self.inner.shutdown.is_cancelled() {
            return Err(Status::failed_precondition("server is stopped"));
        }
        tracing::info!(%addr, "server listening");
        loop {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = self.inner.shutdown.cancelled() => break,
            };
            match accepted {
                Ok(conn) => {
                    let Some(id) = self.inner.track(&addr, conn.transport.clone()) else {
                        continue;
                    };
                    tokio::spawn(self.inner.clone().serve_conn(addr.clone(), id, conn));
                },
                Err(e) if self.inner.shutdown.is_cancelled() => {
                    tracing::debug!(%addr, error = %e, "listener closed while stopping");
                    break;
                },
                Err(e) => {
                    tracing::error!(%addr, error = %e, "accept failed");
                    return Err(e);
                },
            }
        }
        tracing::info!(%addr, "server stopped listening");
        Ok(())
    }

    /// Stops accepting, lets in-flight calls finish and waits until every
    /// connection is gone.
    pub async fn graceful_stop(&self) {
        self.inner.stop(StopMode::Graceful).await
    }

    /// Stops at once: cancels in-flight calls and closes every connection.
    pub async fn stop(&self) {
        self.inner.stop(StopMode::Immediate).await
    }
}

impl ServerInner {
    fn book(&self) -> MutexGuard<'_, ConnBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, addr: &FastStr, transport: Arc<dyn ServerTransport>) -> Option<u64> {
        let mut book = self.book();
        match book.stopping {
            Some(StopMode::Graceful) => transport.drain(),
            Some(StopMode::Immediate) => {
                transport.close();
                return None;
            },
            None => {},
        }
        book.next_id += 1;
        let id = book.next_id;
        book.conns.entry(addr.clone()).or_default().insert(id, transport);
        Some(id)
    }

    fn untrack(&self, addr: &FastStr, id: u64) {
        let mut book = self.book();
        if let Some(conns) = book.conns.get_mut(addr) {
            conns.remove(&id);
            if conns.is_empty() {
                book.conns.remove(addr);
            }
        }
        if book.is_empty() {
            self.drained.notify_waiters();
        }
    }

    async fn stop(&self, mode: StopMode) {
        let transports: Vec<Arc<dyn ServerTransport>> = {
            let mut book = self.book();
            if book.stopping != Some(StopMode::Immediate) {
                book.stopping = Some(mode);
            }
            book.conns.values().flat_map(|conns| conns.values().cloned()).collect()
        };
        tracing::info!(graceful = mode == StopMode::Graceful, connections = transports.len(), "server stopping");
        self.shutdown.cancel();
        if mode == StopMode::Immediate {
            self.root.cancel();
        }
        for transport in transports {
            match mode {
                StopMode::Graceful => transport.drain(),
                StopMode::Immediate => transport.close(),
            }
        }
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.book().is_empty() {
                break;
            }
            notified.await;
        }
        tracing::info!("server stopped");
    }

    async fn serve_conn(self: Arc<Self>, listener: FastStr, id: u64, conn: ServerConnection) {
        let ServerConnection { remote_addr, mut incoming, .. } = conn;
        tracing::debug!(%listener, peer = %remote_addr, "connection accepted");
        let mut streams = JoinSet::new();
        loop {
            tokio::select! {
                next = incoming.next() => match next {
                    Some(stream) => {
                        streams.spawn(self.clone().handle_stream(remote_addr.clone(), stream));
                    },
                    None => break,
                },
                Some(_) = streams.join_next(), if !streams.is_empty() => {},
            }
        }
        // no new streams; let the open ones finish
        while streams.join_next().await.is_some() {}
        tracing::debug!(%listener, peer = %remote_addr, "connection done");
        self.untrack(&listener, id);
    }

    fn route(&self, method: &str) -> Route {
        let Some((service, name)) = method.strip_prefix('/').and_then(|m| m.rsplit_once('/')).filter(|(s, n)| !s.is_empty() && !n.is_empty()) else {
            return Route::Unknown(Status::unimplemented(format!("malformed method name: {method:?}")));
        };
        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = services.get(service) else {
            return Route::Unknown(Status::unimplemented(format!("unknown service {service}")));
        };
        if let Some(m) = entry.methods.get(name) {
            return Route::Unary(m.clone());
        }
        if let Some(s) = entry.streams.get(name) {
            return Route::Stream(s.clone());
        }
        Route::Unknown(Status::unimplemented(format!("unknown method {name} for service {service}")))
    }

    fn stream_settings(&self, md: &Metadata) -> StreamSettings {
        let codec = match md.get(CONTENT_TYPE) {
            Some(ct) => Codec::from_content_type(ct).unwrap_or_else(|| {
                tracing::warn!(content_type = ct, "unsupported content type, using the default codec");
                Codec::default()
            }),
            None => Codec::default(),
        };
        let encoding = md.get(ENCODING);
        let compressors = &self.registries.compressors;
        StreamSettings {
            codec,
            // replies mirror the request encoding when we know it
            compressor: encoding.filter(|name| *name != IDENTITY).and_then(|name| compressors.get(name)),
            recv_encoding: RecvEncoding::resolve(encoding, |name| compressors.get(name)),
            max_send_message_size: self.config.max_send_message_size,
            max_receive_message_size: self.config.max_receive_message_size,
        }
    }

    async fn handle_stream(self: Arc<Self>, peer: FastStr, incoming: IncomingStream) {
        let IncomingStream { method, metadata, stream } = incoming;
        let mut ctx = self.root.child().with_peer(peer);
        if let Some(timeout) = metadata.get(TIMEOUT).and_then(decode_timeout) {
            ctx = ctx.with_timeout(timeout);
        }
        let settings = self.stream_settings(&metadata);
        let ctx = ctx.with_incoming_metadata(metadata);
        let stream = Arc::new(RpcServerStream::new(ctx.clone(), settings, stream));
        tracing::trace!(%method, "stream started");

        let status = match self.route(&method) {
            Route::Unary(desc) => self.run_unary(&ctx, &stream, method.clone(), &desc).await,
            Route::Stream(desc) => self.run_stream(&ctx, &stream, method.clone(), &desc).await,
            Route::Unknown(status) => {
                let unknown = self.unknown.read().unwrap_or_else(PoisonError::into_inner).clone();
                match unknown {
                    Some(desc) => self.run_stream(&ctx, &stream, method.clone(), &desc).await,
                    None => status,
                }
            },
        };
        if !status.is_ok() {
            tracing::debug!(%method, code = ?status.code(), message = status.message(), "call failed");
        }
        stream.finish(status).await;
        // releases anything still waiting on this call
        ctx.cancel();
    }

    async fn run_unary(&self, ctx: &CallContext, stream: &Arc<RpcServerStream>, method: FastStr, desc: &MethodDesc) -> Status {
        let request = match stream.recv_msg(desc.decoder).await {
            Ok(Some(request)) => request,
            Ok(None) => return Status::internal("cardinality violation: expected a request, got end of stream"),
            Err(e) => return e,
        };
        match stream.recv_msg(desc.decoder).await {
            Ok(None) => {},
            Ok(Some(_)) => return Status::internal("cardinality violation: expected end of stream for a unary call, got another request"),
            Err(e) => return e,
        }
        let call = UnaryServerCall {
            ctx: ctx.clone(),
            method: method.clone(),
            request,
        };
        match guarded(ctx, &method, self.unary_chain.call(call, desc)).await {
            Ok(reply) => match stream.send_msg(&*reply).await {
                Ok(()) => Status::ok(),
                Err(e) => e,
            },
            Err(e) => e,
        }
    }

    async fn run_stream(&self, ctx: &CallContext, stream: &Arc<RpcServerStream>, method: FastStr, desc: &StreamMethodDesc) -> Status {
        let call = StreamServerCall {
            method: method.clone(),
            desc: desc.desc,
            stream: Box::new(stream.clone()) as Box<dyn ServerStream>,
        };
        match guarded(ctx, &method, self.stream_chain.call(call, desc)).await {
            Ok(()) => Status::ok(),
            Err(e) => e,
        }
    }
}

/// Runs a handler under the call's deadline, turning a panic into `INTERNAL`.
async fn guarded<T>(ctx: &CallContext, method: &str, handler: impl Future<Output = Result<T, Status>>) -> Result<T, Status> {
    let handler = AssertUnwindSafe(handler).catch_unwind();
    tokio::select! {
        res = handler => match res {
            Ok(res) => res,
            Err(panic) => {
                let status = Status::internal(format!("handler panicked: {}", panic_message(&*panic))).with_stack();
                tracing::error!(method, stack = ?status.stack(), "recovered from a handler panic: {}", status.message());
                Err(status)
            },
        },
        st = ctx.done() => Err(st),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    fn server() -> Server {
        let server = Server::new(ServerConfig::default(), Arc::new(Registries::empty()));
        let greeter = ServiceDesc::new("demo.Greeter")
            .with_method(MethodDesc::unary("Say", |_ctx, name: String| async move { Ok(format!("hello {name}")) }))
            .with_stream(StreamMethodDesc::new(StreamDesc::server_streaming("List"), |_call| async { Ok(()) }));
        server.register_service(greeter).unwrap();
        server
    }

    #[test]
    fn test_routing() {
        let server = server();
        assert!(matches!(server.inner.route("/demo.Greeter/Say"), Route::Unary(_)));
        assert!(matches!(server.inner.route("/demo.Greeter/List"), Route::Stream(_)));
        for (method, fragment) in [
            ("demo.Greeter/Say", "malformed"),
            ("/demo.Greeter", "malformed"),
            ("//Say", "malformed"),
            ("/demo.Greeter/", "malformed"),
            ("/demo.Other/Say", "unknown service"),
            ("/demo.Greeter/Shout", "unknown method"),
        ] {
            match server.inner.route(method) {
                Route::Unknown(st) => {
                    assert_eq!(st.code(), Code::Unimplemented, "{method}");
                    assert!(st.message().contains(fragment), "{method}: {}", st.message());
                },
                _ => panic!("{method} should not route"),
            }
        }
    }

    #[test]
    fn test_duplicate_service_is_rejected() {
        let server = server();
        let err = server.register_service(ServiceDesc::new("demo.Greeter")).unwrap_err();
        assert_eq!(err.code(), Code::AlreadyExists);
    }

    #[tokio::test]
    async fn test_guarded_recovers_panics() {
        let ctx = CallContext::background();
        let err = guarded::<()>(&ctx, "/demo.Greeter/Boom", async { panic!("boom") }).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(err.message().contains("boom"));
        assert!(err.stack().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_honors_deadline() {
        let ctx = CallContext::background().with_timeout(std::time::Duration::from_millis(20));
        let err = guarded::<()>(&ctx, "/demo.Greeter/Slow", future::pending()).await.unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_stop_without_connections_returns() {
        let server = server();
        server.graceful_stop().await;
        let network = crate::transport::memory::MemoryNetwork::new();
        let listener = network.listen("late").unwrap();
        assert_eq!(server.serve(Box::new(listener)).await.unwrap_err().code(), Code::FailedPrecondition);
    }
}
