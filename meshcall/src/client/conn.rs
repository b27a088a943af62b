// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! One logical connection to one endpoint.
//!
//! The connection is established lazily, on the first stream that needs it,
//! and re-established whenever the lower transport goes away. A connect
//! episode makes at most `max_connect_attempts` attempts; if they all fail,
//! the waiting streams fail with `UNAVAILABLE` and the next stream starts a
//! new episode.

use crate::backoff::Backoff;
use crate::config::TransportConfig;
use crate::endpoint::Endpoint;
use crate::metadata::CallContext;
use crate::status::Status;
use crate::transport::{ClientTransport, CloseReason, ConnectOptions, Connection, Connector, StreamRequest, TransportStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Connection phases.
enum Phase {
    Closed,
    // waiters subscribe; dropping the sender releases them
    Connecting { wait: watch::Sender<()> },
    Connected(Arc<dyn ClientTransport>),
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Closed => "closed",
            Phase::Connecting { .. } => "connecting",
            Phase::Connected(_) => "connected",
        }
    }
}

struct State {
    phase: Phase,
    keepalive: Duration,
    last_error: Option<Status>,
}

#[derive(Debug, Clone)]
pub(crate) struct ConnSettings {
    pub min_connect_timeout: Duration,
    pub backoff: Backoff,
    pub max_connect_attempts: u32,
    pub keepalive: Duration,
    pub keepalive_timeout: Duration,
}

impl From<&TransportConfig> for ConnSettings {
    fn from(cfg: &TransportConfig) -> Self {
        Self {
            min_connect_timeout: cfg.min_connect_timeout,
            backoff: cfg.connect_backoff,
            max_connect_attempts: cfg.max_connect_attempts.max(1),
            keepalive: cfg.keepalive,
            keepalive_timeout: cfg.keepalive_timeout,
        }
    }
}

pub(crate) struct TransportConn {
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    settings: ConnSettings,
    state: Mutex<State>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for TransportConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConn")
            .field("endpoint", &self.endpoint)
            .field("phase", &self.lock().phase.name())
            .finish()
    }
}

impl TransportConn {
    pub(crate) fn new(endpoint: Endpoint, connector: Arc<dyn Connector>, settings: ConnSettings) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            connector,
            state: Mutex::new(State {
                phase: Phase::Closed,
                keepalive: settings.keepalive,
                last_error: None,
            }),
            settings,
            shutdown: CancellationToken::new(),
        })
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The current keepalive interval.
    pub(crate) fn keepalive(&self) -> Duration {
        self.lock().keepalive
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(self.lock().phase, Phase::Connected(_))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a stream, connecting first if needed.
    pub(crate) async fn new_stream(self: &Arc<Self>, ctx: &CallContext, request: StreamRequest) -> Result<TransportStream, Status> {
        let transport = self.transport(ctx).await?;
        transport.new_stream(request).await
    }

    /// Waits for a connected transport.
    pub(crate) async fn transport(self: &Arc<Self>, ctx: &CallContext) -> Result<Arc<dyn ClientTransport>, Status> {
        let mut wait = {
            let mut state = self.lock();
            if self.shutdown.is_cancelled() {
                return Err(self.closed_error());
            }
            let joined = match &state.phase {
                Phase::Connected(t) => return Ok(t.clone()),
                Phase::Connecting { wait } => Some(wait.subscribe()),
                Phase::Closed => None,
            };
            match joined {
                Some(wait) => wait,
                None => self.start_connecting(&mut state),
            }
        };

        tokio::select! {
            // never sends; resolves when the episode ends
            _ = wait.changed() => {},
            st = ctx.done() => return Err(st),
            _ = self.shutdown.cancelled() => return Err(self.closed_error()),
        }

        let state = self.lock();
        match &state.phase {
            Phase::Connected(t) => Ok(t.clone()),
            _ => Err(match &state.last_error {
                Some(e) => Status::unavailable(format!("connection to {} failed: {}", self.endpoint, e.message())),
                None => Status::unavailable(format!("connection to {} is not available", self.endpoint)),
            }),
        }
    }

    fn closed_error(&self) -> Status {
        Status::unavailable(format!("connection to {} is closed", self.endpoint))
    }

    fn start_connecting(self: &Arc<Self>, state: &mut State) -> watch::Receiver<()> {
        let (tx, rx) = watch::channel(());
        state.phase = Phase::Connecting { wait: tx };
        let this = self.clone();
        tokio::spawn(async move { this.connect_episode().await });
        rx
    }

    async fn connect_episode(self: Arc<Self>) {
        let mut failures = 0u32;
        loop {
            let backoff = self.settings.backoff.delay(failures);
            let options = ConnectOptions {
                connect_timeout: backoff.max(self.settings.min_connect_timeout),
                keepalive: self.keepalive(),
                keepalive_timeout: self.settings.keepalive_timeout,
            };
            let started = Instant::now();
            tracing::debug!(endpoint = %self.endpoint, attempt = failures + 1, "connecting");

            let attempt = tokio::select! {
                res = tokio::time::timeout(options.connect_timeout, self.connector.connect(&self.endpoint, &options)) => res,
                _ = self.shutdown.cancelled() => return self.settle_closed(None),
            };
            let err = match attempt {
                Ok(Ok(conn)) => return self.on_connected(conn),
                Ok(Err(e)) => e,
                Err(_) => Status::unavailable(format!("handshake did not complete within {:?}", options.connect_timeout)),
            };

            failures += 1;
            tracing::warn!(endpoint = %self.endpoint, failures, error = %err, "connect attempt failed");
            if failures >= self.settings.max_connect_attempts {
                return self.settle_closed(Some(err));
            }
            {
                let mut state = self.lock();
                state.last_error = Some(err);
                // waiters of this attempt observe its failure; later callers wait for the next one
                let (wait, _) = watch::channel(());
                state.phase = Phase::Connecting { wait };
            }
            // the next attempt waits out the rest of this backoff window
            tokio::select! {
                _ = tokio::time::sleep_until(started + backoff) => {},
                _ = self.shutdown.cancelled() => return self.settle_closed(None),
            }
        }
    }

    fn settle_closed(&self, err: Option<Status>) {
        let mut state = self.lock();
        if err.is_some() {
            state.last_error = err;
        }
        // drops the wait sender, releasing every waiter once
        state.phase = Phase::Closed;
    }

    fn on_connected(self: Arc<Self>, conn: Connection) {
        let Connection { transport, closed } = conn;
        {
            let mut state = self.lock();
            if self.shutdown.is_cancelled() {
                state.phase = Phase::Closed;
                drop(state);
                if let Err(e) = transport.close() {
                    tracing::debug!(endpoint = %self.endpoint, error = %e, "failed to close a transport connected after shutdown");
                }
                return;
            }
            state.phase = Phase::Connected(transport.clone());
            state.last_error = None;
        }
        tracing::info!(endpoint = %self.endpoint, "connected");

        tokio::spawn(async move {
            tokio::select! {
                reason = closed => self.on_transport_closed(&transport, reason),
                _ = self.shutdown.cancelled() => {},
            }
        });
    }

    fn on_transport_closed(self: &Arc<Self>, transport: &Arc<dyn ClientTransport>, reason: CloseReason) {
        let mut state = self.lock();
        let current = matches!(&state.phase, Phase::Connected(t) if Arc::ptr_eq(t, transport));
        if !current {
            return;
        }
        if reason.is_too_many_pings() {
            let doubled = state.keepalive.checked_mul(2).unwrap_or(Duration::MAX);
            tracing::warn!(endpoint = %self.endpoint, keepalive = ?doubled, "peer reported too many pings, keepalive doubled");
            state.keepalive = doubled;
        }
        tracing::info!(endpoint = %self.endpoint, %reason, "transport closed, reconnecting");
        state.phase = Phase::Closed;
        if !self.shutdown.is_cancelled() {
            self.start_connecting(&mut state);
        }
    }

    /// Closes the connection for good.
    pub(crate) fn close(&self) -> Result<(), Status> {
        self.shutdown.cancel();
        let phase = std::mem::replace(&mut self.lock().phase, Phase::Closed);
        match phase {
            Phase::Connected(t) => t.close(),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;
    use crate::transport::GoAwayCode;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    struct NoopTransport;

    impl ClientTransport for NoopTransport {
        fn new_stream(&self, _request: StreamRequest) -> BoxFuture<'_, Result<TransportStream, Status>> {
            async { Err(Status::unimplemented("noop")) }.boxed()
        }

        fn close(&self) -> Result<(), Status> {
            Ok(())
        }
    }

    enum Outcome {
        Fail,
        // connects; the sender ends the connection with the given reason
        Succeed(oneshot::Receiver<CloseReason>),
    }

    #[derive(Default)]
    struct ScriptedConnector {
        script: Mutex<VecDeque<Outcome>>,
        attempts: AtomicUsize,
        keepalives: Mutex<Vec<Duration>>,
    }

    impl ScriptedConnector {
        fn push(&self, outcome: Outcome) {
            self.script.lock().unwrap().push_back(outcome);
        }
    }

    impl Connector for ScriptedConnector {
        fn connect(&self, _endpoint: &Endpoint, options: &ConnectOptions) -> BoxFuture<'static, Result<Connection, Status>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.keepalives.lock().unwrap().push(options.keepalive);
            let outcome = self.script.lock().unwrap().pop_front();
            async move {
                match outcome {
                    Some(Outcome::Succeed(rx)) => Ok(Connection {
                        transport: Arc::new(NoopTransport),
                        closed: async move { rx.await.unwrap_or(CloseReason::Local) }.boxed(),
                    }),
                    _ => Err(Status::unavailable("connection refused")),
                }
            }
            .boxed()
        }
    }

    fn settings() -> ConnSettings {
        ConnSettings {
            min_connect_timeout: Duration::from_millis(100),
            backoff: Backoff::default().with_base_delay(Duration::from_millis(10)).with_jitter(0.0),
            max_connect_attempts: 3,
            keepalive: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let connector = Arc::new(ScriptedConnector::default());
        let conn = TransportConn::new(Endpoint::new("a"), connector.clone(), settings());
        for attempt in 1..=3 {
            let err = conn.transport(&CallContext::background()).await.err().unwrap();
            assert_eq!(err.code(), Code::Unavailable);
            assert!(err.message().contains("connection refused"), "{err}");
            assert_eq!(connector.attempts.load(Ordering::SeqCst), attempt);
        }
        assert!(!conn.is_connected());

        // the next use starts a new episode
        let (_tx, rx) = oneshot::channel();
        connector.push(Outcome::Succeed(rx));
        assert!(conn.transport(&CallContext::background()).await.is_ok());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_share_one_episode() {
        let connector = Arc::new(ScriptedConnector::default());
        connector.push(Outcome::Fail);
        let (_tx, rx) = oneshot::channel();
        connector.push(Outcome::Succeed(rx));
        let conn = TransportConn::new(Endpoint::new("a"), connector.clone(), settings());

        let ctx = CallContext::background();
        let (a, b) = tokio::join!(conn.transport(&ctx), conn.transport(&ctx));
        assert!(a.is_err() && b.is_err());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        // the episode keeps going in the background
        let (a, b) = tokio::join!(conn.transport(&ctx), conn.transport(&ctx));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        assert!(conn.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_goaway_too_many_pings_reconnects_with_doubled_keepalive() {
        let connector = Arc::new(ScriptedConnector::default());
        let (goaway_tx, rx) = oneshot::channel();
        connector.push(Outcome::Succeed(rx));
        let (_keep, rx2) = oneshot::channel();
        connector.push(Outcome::Succeed(rx2));
        let conn = TransportConn::new(Endpoint::new("a"), connector.clone(), settings());
        conn.transport(&CallContext::background()).await.unwrap();

        goaway_tx.send(CloseReason::GoAway(GoAwayCode::TooManyPings)).unwrap();
        // reconnects without waiting for a caller
        while connector.attempts.load(Ordering::SeqCst) < 2 || !conn.is_connected() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(conn.keepalive(), Duration::from_secs(20));
        assert_eq!(*connector.keepalives.lock().unwrap(), vec![Duration::from_secs(10), Duration::from_secs(20)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_connected_during_close_is_closed() {
        struct Counting(Arc<AtomicUsize>);
        impl ClientTransport for Counting {
            fn new_stream(&self, _request: StreamRequest) -> BoxFuture<'_, Result<TransportStream, Status>> {
                async { Err(Status::unimplemented("counting")) }.boxed()
            }

            fn close(&self) -> Result<(), Status> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(Status::internal("already gone"))
            }
        }

        // closes the owning connection while the handshake completes
        struct CloseOnConnect {
            conn: Mutex<Option<Arc<TransportConn>>>,
            closes: Arc<AtomicUsize>,
        }
        impl Connector for CloseOnConnect {
            fn connect(&self, _: &Endpoint, _: &ConnectOptions) -> BoxFuture<'static, Result<Connection, Status>> {
                let conn = self.conn.lock().unwrap().take();
                let closes = self.closes.clone();
                async move {
                    if let Some(conn) = conn {
                        conn.close().unwrap();
                    }
                    Ok(Connection {
                        transport: Arc::new(Counting(closes)),
                        closed: futures::future::pending().boxed(),
                    })
                }
                .boxed()
            }
        }

        let closes = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(CloseOnConnect {
            conn: Mutex::new(None),
            closes: closes.clone(),
        });
        let conn = TransportConn::new(Endpoint::new("a"), connector.clone(), settings());
        *connector.conn.lock().unwrap() = Some(conn.clone());

        let err = conn.transport(&CallContext::background()).await.err().unwrap();
        assert_eq!(err.code(), Code::Unavailable);
        tokio::task::yield_now().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!conn.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_honors_context_and_close() {
        struct Hanging;
        impl Connector for Hanging {
            fn connect(&self, _: &Endpoint, _: &ConnectOptions) -> BoxFuture<'static, Result<Connection, Status>> {
                futures::future::pending().boxed()
            }
        }
        let conn = TransportConn::new(Endpoint::new("a"), Arc::new(Hanging), settings());
        let ctx = CallContext::background().with_timeout(Duration::from_millis(5));
        assert_eq!(conn.transport(&ctx).await.err().unwrap().code(), Code::DeadlineExceeded);

        conn.close().unwrap();
        let err = conn.transport(&CallContext::background()).await.err().unwrap();
        assert_eq!(err.code(), Code::Unavailable);
    }
}
