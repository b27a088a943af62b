// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Provides a client that picks an endpoint per call and opens multiplexed streams on it.
//!
//! A [`Client`] serves one service. A background task keeps its view of the
//! service current: it follows the resolver, feeds the balancer and owns one
//! transport connection per endpoint address. Each change is published as a
//! versioned pick snapshot; calls pick from the latest snapshot and re-pick
//! when a retry finds it superseded.

pub(crate) mod conn;
mod stream;
mod watch;

use crate::backoff::Backoff;
use crate::balancer::CallInfo;
use crate::codec::{decode_message, downcast, Codec, Message};
use crate::compress::Compressor;
use crate::config::{ClientConfig, InterceptorNames};
use crate::framing::{DEFAULT_MAX_RECEIVE_MESSAGE_SIZE, DEFAULT_MAX_SEND_MESSAGE_SIZE};
use crate::interceptor::{instantiate, StreamCall, StreamClientChain, StreamReply, Streamer, UnaryCall, UnaryClientChain, UnaryInvoker, UnaryReply};
use crate::metadata::{encode_timeout, CallContext, Metadata, ACCEPT_ENCODING, CONTENT_TYPE, ENCODING, TIMEOUT};
use crate::registry::Registries;
use crate::status::Status;
use crate::stream::{ClientStream, StreamDesc};
use crate::transport::{StreamRequest, TransportStream};
use faststr::FastStr;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex, PoisonError};
use stream::RpcClientStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use watch::{ConfigSender, PickSnap, SnapReceiver, Watcher};

/// Attempts per logical call, counting pick and stream-open failures alike.
pub const MAX_ATTEMPTS: u32 = 4;

const UNARY: StreamDesc = StreamDesc::unary("unary");

/// Errors from tearing a client down.
#[derive(thiserror::Error, Debug)]
#[error("closing the client of {service} failed: {}", join_errors(.errors))]
pub struct CloseError {
    /// The service of the client.
    pub service: FastStr,
    /// Every teardown failure, in order.
    pub errors: Vec<Status>,
}

fn join_errors(errors: &[Status]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

pub(crate) fn closing() -> Status {
    Status::canceled("client connection is closing")
}

/// Per-call settings taken from the client config.
pub(crate) struct CallSettings {
    pub codec: Codec,
    pub compressor: Option<Arc<dyn Compressor>>,
    pub max_send_message_size: usize,
    pub max_receive_message_size: usize,
    pub retry_backoff: Backoff,
}

impl CallSettings {
    pub(crate) fn from_config(cfg: &ClientConfig, registries: &Registries) -> Self {
        let compressor = cfg.compressor.as_deref().and_then(|name| {
            let found = registries.compressors.get(name);
            if found.is_none() {
                tracing::warn!(compressor = name, "compressor is not registered, requests are sent uncompressed");
            }
            found
        });
        Self {
            codec: cfg.codec(),
            compressor,
            max_send_message_size: cfg.max_send_message_size,
            max_receive_message_size: cfg.max_receive_message_size,
            retry_backoff: cfg.retry_backoff,
        }
    }
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            codec: Codec::default(),
            compressor: None,
            max_send_message_size: DEFAULT_MAX_SEND_MESSAGE_SIZE,
            max_receive_message_size: DEFAULT_MAX_RECEIVE_MESSAGE_SIZE,
            retry_backoff: Backoff::default(),
        }
    }
}

impl std::fmt::Debug for CallSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSettings")
            .field("codec", &self.codec)
            .field("compressor", &self.compressor.as_ref().map(|c| c.name().to_owned()))
            .field("max_send_message_size", &self.max_send_message_size)
            .field("max_receive_message_size", &self.max_receive_message_size)
            .finish_non_exhaustive()
    }
}

/// A client of one service.
///
/// Cheap to clone; clones share the connections. Must be created inside a
/// tokio runtime.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    service: FastStr,
    registries: Arc<Registries>,
    accept_encoding: String,
    unary_chain: UnaryClientChain,
    stream_chain: StreamClientChain,
    config_tx: ConfigSender,
    snap_rx: SnapReceiver,
    shutdown: CancellationToken,
    watcher: Mutex<Option<JoinHandle<Vec<Status>>>>,
}

impl std::fmt::Debug for ClientInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientInner")
            .field("service", &self.service)
            .field("unary_chain", &self.unary_chain)
            .field("stream_chain", &self.stream_chain)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates the client of `service`.
    ///
    /// Fails when the configured balancer or resolver is unknown. Interceptors
    /// are resolved from `registries` once and fixed for the life of the client.
    pub fn new(service: impl Into<FastStr>, config: ClientConfig, registries: Arc<Registries>) -> Result<Self, Status> {
        Self::with_global_interceptors(service, config, &InterceptorNames::default(), registries)
    }

    /// Like [`Client::new`], with interceptors that run before the client's own.
    pub fn with_global_interceptors(service: impl Into<FastStr>, config: ClientConfig, global: &InterceptorNames, registries: Arc<Registries>) -> Result<Self, Status> {
        let service = service.into();
        let (unary_names, stream_names) = InterceptorNames::merged(global, &config.interceptors);
        let unary_chain = UnaryClientChain::new(instantiate("unary client", &unary_names, &registries.unary_client_interceptors));
        let stream_chain = StreamClientChain::new(instantiate("stream client", &stream_names, &registries.stream_client_interceptors));

        let (snap_tx, snap_rx) = tokio::sync::watch::channel(None);
        let watcher = Watcher::new(service.clone(), config, registries.clone(), snap_tx)?;
        let (config_tx, config_rx) = watch::config_channel();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(watcher.run(config_rx, shutdown.clone()));
        tracing::info!(%service, unary_interceptors = unary_chain.len(), stream_interceptors = stream_chain.len(), "client created");

        Ok(Self {
            inner: Arc::new(ClientInner {
                service,
                accept_encoding: registries.accept_encoding(),
                registries,
                unary_chain,
                stream_chain,
                config_tx,
                snap_rx,
                shutdown,
                watcher: Mutex::new(Some(handle)),
            }),
        })
    }

    /// The service this client calls.
    pub fn service(&self) -> &FastStr {
        &self.inner.service
    }

    /// Hot-swaps the configuration.
    ///
    /// Balancer, resolver, endpoints and call settings follow the new config;
    /// interceptors and the settings of existing connections do not. A config
    /// not yet applied is replaced by a newer one.
    pub fn update_config(&self, config: ClientConfig) -> Result<(), Status> {
        self.inner.config_tx.publish(config)
    }

    /// Waits until the first endpoint list has been published.
    pub async fn wait_for_resolved(&self, ctx: &CallContext) -> Result<(), Status> {
        self.inner.wait_for_resolved(ctx).await
    }

    /// The version of the current pick snapshot; zero before the first one.
    pub fn snapshot_version(&self) -> u64 {
        self.inner.snap_rx.borrow().as_ref().map_or(0, |snap| snap.version)
    }

    /// Calls a unary method.
    pub async fn invoke<Req, Resp>(&self, ctx: &CallContext, method: &str, request: Req) -> Result<Resp, Status>
    where
        Req: Message,
        Resp: Message + DeserializeOwned,
    {
        let call = UnaryCall {
            ctx: ctx.clone(),
            method: FastStr::new(method),
            request: Box::new(request),
            decoder: decode_message::<Resp>,
        };
        let reply = self.inner.unary_chain.call(call, &*self.inner).await?;
        downcast(reply)
    }

    /// Opens a stream for a streaming method.
    pub async fn new_stream(&self, ctx: &CallContext, desc: StreamDesc, method: &str) -> Result<Box<dyn ClientStream>, Status> {
        let call = StreamCall {
            ctx: ctx.clone(),
            desc,
            method: FastStr::new(method),
        };
        self.inner.stream_chain.call(call, &*self.inner).await
    }

    /// Tears the client down: config and resolver watches, balancer and every
    /// connection. Later calls fail with `CANCELLED`; closing again is a no-op.
    pub async fn close(&self) -> Result<(), CloseError> {
        let handle = self.inner.watcher.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(handle) = handle else {
            return Ok(());
        };
        self.inner.shutdown.cancel();
        self.inner.config_tx.close();
        let errors = match handle.await {
            Ok(errors) => errors,
            Err(e) => vec![Status::internal(format!("client watcher failed: {e}"))],
        };
        tracing::info!(service = %self.inner.service, errors = errors.len(), "client closed");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CloseError {
                service: self.inner.service.clone(),
                errors,
            })
        }
    }
}

impl ClientInner {
    async fn wait_for_resolved(&self, ctx: &CallContext) -> Result<(), Status> {
        if self.shutdown.is_cancelled() {
            return Err(closing());
        }
        let mut rx = self.snap_rx.clone();
        tokio::select! {
            res = rx.wait_for(Option::is_some) => res.map(|_| ()).map_err(|_| closing()),
            st = ctx.done() => Err(st),
            _ = self.shutdown.cancelled() => Err(closing()),
        }
    }

    /// Opens a transport stream, retrying pick and open failures.
    async fn open(&self, ctx: &CallContext, method: &FastStr) -> Result<(TransportStream, Arc<CallSettings>), Status> {
        self.wait_for_resolved(ctx).await?;
        let mut snap_rx = self.snap_rx.clone();
        let mut snap = snap_rx.borrow_and_update().clone().ok_or_else(closing)?;
        let mut last_err = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = snap.settings.retry_backoff.delay(attempt - 1);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {},
                    res = snap_rx.changed() => if res.is_err() {
                        return Err(closing());
                    },
                    st = ctx.done() => return Err(st),
                    _ = self.shutdown.cancelled() => return Err(closing()),
                }
            }
            let latest = snap_rx.borrow_and_update().clone();
            if let Some(newer) = latest.filter(|newer| newer.version != snap.version) {
                tracing::debug!(service = %self.service, from = snap.version, to = newer.version, "pick snapshot superseded, re-picking");
                snap = newer;
            }
            match self.attempt(ctx, &snap, method).await {
                Ok(stream) => return Ok((stream, snap.settings.clone())),
                Err(e) => {
                    if let Some(st) = ctx.err() {
                        return Err(st);
                    }
                    tracing::debug!(service = %self.service, %method, attempt = attempt + 1, error = %e, "stream attempt failed");
                    last_err = Some(e);
                },
            }
        }
        let err = last_err.unwrap_or_else(|| Status::unavailable("no stream attempt was made"));
        tracing::warn!(service = %self.service, %method, error = %err, "giving up after {MAX_ATTEMPTS} attempts");
        Err(err)
    }

    async fn attempt(&self, ctx: &CallContext, snap: &PickSnap, method: &FastStr) -> Result<TransportStream, Status> {
        let mut pick = snap.picker.next(&CallInfo { method: method.clone() })?;
        let res = match snap.conns.get(pick.endpoint().address()) {
            Some(conn) => {
                let request = StreamRequest {
                    method: method.clone(),
                    metadata: self.request_metadata(ctx, &snap.settings),
                };
                conn.new_stream(ctx, request).await
            },
            None => Err(Status::unavailable(format!("no connection to {}", pick.endpoint().address()))),
        };
        pick.report(res.as_ref().map(|_| ()));
        res
    }

    fn request_metadata(&self, ctx: &CallContext, settings: &CallSettings) -> Metadata {
        let mut md = ctx.outgoing_metadata();
        md.insert(CONTENT_TYPE, settings.codec.content_type());
        if let Some(compressor) = &settings.compressor {
            md.insert(ENCODING, compressor.name().to_owned());
        }
        md.insert(ACCEPT_ENCODING, self.accept_encoding.clone());
        if let Some(remaining) = ctx.remaining() {
            md.insert(TIMEOUT, encode_timeout(remaining));
        }
        md
    }

    async fn open_stream(&self, ctx: CallContext, desc: StreamDesc, method: &FastStr) -> Result<RpcClientStream, Status> {
        let (stream, settings) = self.open(&ctx, method).await?;
        Ok(RpcClientStream::new(ctx, desc, settings, self.registries.clone(), stream))
    }
}

impl UnaryInvoker for ClientInner {
    fn invoke(&self, call: UnaryCall) -> BoxFuture<'_, UnaryReply> {
        async move {
            let UnaryCall { ctx, method, request, decoder } = call;
            let stream = self.open_stream(ctx, UNARY, &method).await?;
            if let Err(e) = stream.send_msg(&*request).await {
                // the server may have ended the call first; its status explains why
                return match stream.recv_msg(decoder).await {
                    Err(status) => Err(status),
                    Ok(_) => Err(e),
                };
            }
            stream.recv_msg(decoder).await?.ok_or_else(|| Status::internal("unary call completed without a reply"))
        }
        .boxed()
    }
}

impl Streamer for ClientInner {
    fn new_stream(&self, call: StreamCall) -> BoxFuture<'_, StreamReply> {
        async move {
            let StreamCall { ctx, desc, method } = call;
            let stream = self.open_stream(ctx, desc, &method).await?;
            Ok(Box::new(stream) as Box<dyn ClientStream>)
        }
        .boxed()
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
