// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! An in-process network.
//!
//! Listeners bind names on a [`MemoryNetwork`] and clients dial those names
//! with the `mem` scheme. Streams are pairs of bounded channels, so slow
//! readers push back on writers as a socket would. The network can inject
//! GOAWAY frames to exercise reconnection.

use super::{
    ClientTransport, CloseReason, ConnectOptions, Connection, Connector, FrameSink, FrameStream, GoAwayCode, IncomingStream, Listener, ListenerBuilder, ServerConnection, ServerTransport,
    StreamRequest, TransportStream,
};
use crate::endpoint::Endpoint;
use crate::registry::Registries;
use crate::status::Status;
use faststr::FastStr;
use futures::channel::mpsc as frame_channel;
use futures::future::{self, BoxFuture};
use futures::{stream, FutureExt, SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The scheme of in-process endpoints.
pub const SCHEME: &str = "mem";

const STREAM_BUFFER: usize = 16;

/// A set of named in-process listeners.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Default)]
struct NetworkInner {
    next_id: u64,
    listeners: HashMap<FastStr, ListenerEntry>,
}

struct ListenerEntry {
    id: u64,
    accept_tx: mpsc::UnboundedSender<ServerConnection>,
    conns: Vec<Weak<ConnShared>>,
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        let mut names: Vec<&str> = inner.listeners.keys().map(FastStr::as_str).collect();
        names.sort_unstable();
        f.debug_struct("MemoryNetwork").field("listeners", &names).finish()
    }
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers this network's connector and listener builder under [`SCHEME`].
    pub fn install(&self, registries: &Registries) {
        registries.connectors.register(SCHEME, Arc::new(self.clone()));
        let network = self.clone();
        let builder: Arc<ListenerBuilder> = Arc::new(move |addr: FastStr| {
            let network = network.clone();
            async move { network.listen(addr).map(|l| Box::new(l) as Box<dyn Listener>) }.boxed()
        });
        registries.listeners.register(SCHEME, builder);
    }

    /// Binds `addr`.
    pub fn listen(&self, addr: impl Into<FastStr>) -> Result<MemoryListener, Status> {
        let addr = addr.into();
        let mut inner = self.lock();
        if inner.listeners.contains_key(&addr) {
            return Err(Status::new(crate::status::Code::AlreadyExists, format!("address {addr} is already in use")));
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        inner.listeners.insert(addr.clone(), ListenerEntry { id, accept_tx, conns: Vec::new() });
        tracing::debug!(%addr, "memory listener bound");
        Ok(MemoryListener {
            addr,
            id,
            network: self.clone(),
            accept_rx,
        })
    }

    /// Number of live connections accepted on `addr`.
    pub fn connections(&self, addr: &str) -> usize {
        let mut inner = self.lock();
        match inner.listeners.get_mut(addr) {
            Some(entry) => {
                entry.conns.retain(|c| c.upgrade().is_some_and(|c| !c.closed.is_cancelled()));
                entry.conns.len()
            },
            None => 0,
        }
    }

    /// Sends GOAWAY with `code` on every connection accepted on `addr`, then closes them.
    ///
    /// Returns how many connections were affected.
    pub fn go_away(&self, addr: &str, code: GoAwayCode) -> usize {
        let conns: Vec<Arc<ConnShared>> = {
            let mut inner = self.lock();
            match inner.listeners.get_mut(addr) {
                Some(entry) => entry.conns.drain(..).filter_map(|c| c.upgrade()).collect(),
                None => return 0,
            }
        };
        for conn in &conns {
            conn.shutdown(CloseReason::GoAway(code));
        }
        tracing::info!(addr, ?code, count = conns.len(), "injected goaway");
        conns.len()
    }

    fn dial(&self, addr: &FastStr) -> Result<Connection, Status> {
        let mut inner = self.lock();
        inner.next_id += 1;
        let conn_id = inner.next_id;
        let entry = inner.listeners.get_mut(addr).ok_or_else(|| Status::unavailable(format!("connection refused: nothing listens on {addr}")))?;

        let shared = Arc::new(ConnShared::default());
        let (streams_tx, streams_rx) = mpsc::unbounded_channel();
        let draining = shared.draining.clone();
        let incoming = stream::unfold(streams_rx, |mut rx| async move { rx.recv().await.map(|s| (s, rx)) })
            .take_until(async move { draining.cancelled().await })
            .boxed();
        let server_conn = ServerConnection {
            remote_addr: FastStr::new(format!("mem-client-{conn_id}")),
            incoming,
            transport: Arc::new(MemoryServerTransport { shared: shared.clone() }),
        };
        if entry.accept_tx.send(server_conn).is_err() {
            return Err(Status::unavailable(format!("connection refused: listener {addr} is closed")));
        }
        entry.conns.retain(|c| c.strong_count() > 0);
        entry.conns.push(Arc::downgrade(&shared));

        let watched = shared.clone();
        let closed = async move {
            tokio::select! {
                _ = watched.closed.cancelled() => {},
                _ = watched.draining.cancelled() => {},
            }
            watched.reason().unwrap_or(CloseReason::Local)
        }
        .boxed();
        Ok(Connection {
            transport: Arc::new(MemoryClientTransport { shared, streams_tx }),
            closed,
        })
    }

    fn unbind(&self, addr: &FastStr, id: u64) {
        let mut inner = self.lock();
        if inner.listeners.get(addr).is_some_and(|e| e.id == id) {
            inner.listeners.remove(addr);
            tracing::debug!(%addr, "memory listener closed");
        }
    }
}

impl Connector for MemoryNetwork {
    fn connect(&self, endpoint: &Endpoint, _options: &ConnectOptions) -> BoxFuture<'static, Result<Connection, Status>> {
        future::ready(self.dial(endpoint.address())).boxed()
    }
}

/// A bound in-process address. Dropping it unbinds the address.
pub struct MemoryListener {
    addr: FastStr,
    id: u64,
    network: MemoryNetwork,
    accept_rx: mpsc::UnboundedReceiver<ServerConnection>,
}

impl std::fmt::Debug for MemoryListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryListener").field("addr", &self.addr).finish()
    }
}

impl Listener for MemoryListener {
    fn local_addr(&self) -> FastStr {
        self.addr.clone()
    }

    fn accept(&mut self) -> BoxFuture<'_, Result<ServerConnection, Status>> {
        async move { self.accept_rx.recv().await.ok_or_else(|| Status::unavailable("listener closed")) }.boxed()
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.unbind(&self.addr, self.id);
    }
}

#[derive(Default)]
struct ConnShared {
    closed: CancellationToken,
    draining: CancellationToken,
    reason: Mutex<Option<CloseReason>>,
}

impl ConnShared {
    fn set_reason(&self, reason: CloseReason) {
        self.reason.lock().unwrap_or_else(PoisonError::into_inner).get_or_insert(reason);
    }

    fn reason(&self) -> Option<CloseReason> {
        self.reason.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn shutdown(&self, reason: CloseReason) {
        self.set_reason(reason);
        self.draining.cancel();
        self.closed.cancel();
    }
}

struct MemoryClientTransport {
    shared: Arc<ConnShared>,
    streams_tx: mpsc::UnboundedSender<IncomingStream>,
}

impl ClientTransport for MemoryClientTransport {
    fn new_stream(&self, request: StreamRequest) -> BoxFuture<'_, Result<TransportStream, Status>> {
        async move {
            if self.shared.draining.is_cancelled() {
                return Err(Status::unavailable("connection is closing"));
            }
            let (c2s_tx, c2s_rx) = frame_channel::channel(STREAM_BUFFER);
            let (s2c_tx, s2c_rx) = frame_channel::channel(STREAM_BUFFER);
            let incoming = IncomingStream {
                method: request.method,
                metadata: request.metadata,
                stream: TransportStream {
                    sink: frame_sink(s2c_tx),
                    stream: frame_stream(c2s_rx, self.shared.clone()),
                },
            };
            self.streams_tx.send(incoming).map_err(|_| Status::unavailable("connection closed"))?;
            Ok(TransportStream {
                sink: frame_sink(c2s_tx),
                stream: frame_stream(s2c_rx, self.shared.clone()),
            })
        }
        .boxed()
    }

    fn close(&self) -> Result<(), Status> {
        self.shared.shutdown(CloseReason::Local);
        Ok(())
    }
}

struct MemoryServerTransport {
    shared: Arc<ConnShared>,
}

impl ServerTransport for MemoryServerTransport {
    fn drain(&self) {
        self.shared.set_reason(CloseReason::GoAway(GoAwayCode::NoError));
        self.shared.draining.cancel();
    }

    fn close(&self) {
        self.shared.shutdown(CloseReason::Error(Status::unavailable("connection closed by server")));
    }
}

impl Drop for MemoryServerTransport {
    fn drop(&mut self) {
        if !self.shared.closed.is_cancelled() {
            self.shared.shutdown(CloseReason::Error(Status::unavailable("connection reset by server")));
        }
    }
}

fn frame_sink(tx: frame_channel::Sender<super::Frame>) -> FrameSink {
    Box::pin(tx.sink_map_err(|_| Status::unavailable("stream closed by peer")))
}

// Ends with an error when the connection dies under the stream.
fn frame_stream(rx: frame_channel::Receiver<super::Frame>, shared: Arc<ConnShared>) -> FrameStream {
    let closed = shared.closed.clone();
    let tail = stream::once(async move {
        match shared.closed.is_cancelled() {
            true => Some(Err(Status::unavailable(match shared.reason() {
                Some(reason) => format!("connection lost: {reason}"),
                None => "connection lost".to_owned(),
            }))),
            false => None,
        }
    })
    .filter_map(future::ready);
    rx.map(Ok).take_until(async move { closed.cancelled().await }).chain(tail).boxed()
}
