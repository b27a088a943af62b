// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

mod common;

use common::*;
use futures::future::BoxFuture;
use futures::FutureExt;
use meshcall::backoff::Backoff;
use meshcall::balancer::{Balancer, CallInfo, PickResult, Picker, RoundRobinBalancer};
use meshcall::config::{ClientConfig, ServerConfig, TransportConfig};
use meshcall::endpoint::Endpoint;
use meshcall::transport::memory::MemoryNetwork;
use meshcall::transport::{ClientTransport, ConnectOptions, Connection, Connector, StreamRequest, TransportStream};
use meshcall::{CallContext, Code, Status};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Opens streams over the memory network, refusing the first `refusals`.
struct Flaky {
    network: MemoryNetwork,
    refusals: Arc<AtomicUsize>,
    opened: Arc<AtomicUsize>,
}

struct FlakyTransport {
    inner: Arc<dyn ClientTransport>,
    refusals: Arc<AtomicUsize>,
    opened: Arc<AtomicUsize>,
    attempts: AtomicUsize,
}

impl Connector for Flaky {
    fn connect(&self, endpoint: &Endpoint, options: &ConnectOptions) -> BoxFuture<'static, Result<Connection, Status>> {
        let refusals = self.refusals.clone();
        let opened = self.opened.clone();
        self.network
            .connect(endpoint, options)
            .map(move |res| {
                res.map(|conn| Connection {
                    transport: Arc::new(FlakyTransport {
                        inner: conn.transport,
                        refusals,
                        opened,
                        attempts: AtomicUsize::new(0),
                    }),
                    closed: conn.closed,
                })
            })
            .boxed()
    }
}

impl ClientTransport for FlakyTransport {
    fn new_stream(&self, request: StreamRequest) -> BoxFuture<'_, Result<TransportStream, Status>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let refuse = self.refusals.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok();
        if refuse {
            return futures::future::ready(Err(Status::unavailable(format!("stream refused #{attempt}")))).boxed();
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.inner.new_stream(request)
    }

    fn close(&self) -> Result<(), Status> {
        self.inner.close()
    }
}

/// Dials the memory network, failing the first `refusals` handshakes.
struct Refusing {
    network: MemoryNetwork,
    refusals: AtomicUsize,
    dials: Arc<AtomicUsize>,
}

impl Connector for Refusing {
    fn connect(&self, endpoint: &Endpoint, options: &ConnectOptions) -> BoxFuture<'static, Result<Connection, Status>> {
        let dial = self.dials.fetch_add(1, Ordering::SeqCst) + 1;
        if self.refusals.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            return futures::future::ready(Err(Status::unavailable(format!("handshake refused #{dial}")))).boxed();
        }
        self.network.connect(endpoint, options)
    }
}

type Reports = Arc<Mutex<Vec<Result<(), Code>>>>;

/// Round robin that records every reported outcome.
struct Recording {
    inner: RoundRobinBalancer,
    reports: Reports,
}

struct RecordingPicker {
    inner: Arc<dyn Picker>,
    reports: Reports,
}

impl Picker for RecordingPicker {
    fn next(&self, info: &CallInfo) -> Result<PickResult, Status> {
        let pick = self.inner.next(info)?;
        let reports = self.reports.clone();
        Ok(PickResult::new(pick.endpoint().clone()).with_report(move |outcome| reports.lock().unwrap().push(outcome.map_err(Status::code))))
    }
}

impl Balancer for Recording {
    fn name(&self) -> &str {
        "recording"
    }

    fn picker(&self) -> Arc<dyn Picker> {
        Arc::new(RecordingPicker {
            inner: self.inner.picker(),
            reports: self.reports.clone(),
        })
    }

    fn update(&self, endpoints: Vec<Endpoint>) {
        self.inner.update(endpoints)
    }

    fn close(&self) -> Result<(), Status> {
        self.inner.close()
    }
}

struct Setup {
    harness: Harness,
    refusals: Arc<AtomicUsize>,
    opened: Arc<AtomicUsize>,
    reports: Reports,
}

fn setup(refusals: usize) -> Setup {
    let harness = Harness::new();
    let refusals = Arc::new(AtomicUsize::new(refusals));
    let opened = Arc::new(AtomicUsize::new(0));
    let reports = Reports::default();
    harness.registries.connectors.register(
        "flaky",
        Arc::new(Flaky {
            network: harness.network.clone(),
            refusals: refusals.clone(),
            opened: opened.clone(),
        }),
    );
    let recorded = reports.clone();
    harness.registries.balancers.register(
        "recording",
        Arc::new(move || {
            Arc::new(Recording {
                inner: RoundRobinBalancer::new(),
                reports: recorded.clone(),
            }) as Arc<dyn Balancer>
        }),
    );
    harness.start("greeter-1", ServerConfig::default());
    Setup {
        harness,
        refusals,
        opened,
        reports,
    }
}

fn config() -> ClientConfig {
    ClientConfig::default()
        .with_balancer("recording")
        .with_endpoints(["flaky://greeter-1"])
        .with_retry_backoff(Backoff::default().with_base_delay(Duration::from_millis(5)).with_max_delay(Duration::from_millis(20)))
}

#[tokio::test]
async fn test_two_failures_then_success() -> anyhow::Result<()> {
    let s = setup(2);
    let client = s.harness.client(config());

    let reply: String = client.invoke(&CallContext::background(), SAY, "ed".to_owned()).await?;
    assert_eq!(reply, "greeter-1: hello ed");
    assert_eq!(s.opened.load(Ordering::SeqCst), 1);
    assert_eq!(s.harness.calls(), 1);
    assert_eq!(*s.reports.lock().unwrap(), [Err(Code::Unavailable), Err(Code::Unavailable), Ok(())]);
    Ok(())
}

#[tokio::test]
async fn test_failed_handshakes_are_reported_to_the_picker() -> anyhow::Result<()> {
    let s = setup(0);
    let dials = Arc::new(AtomicUsize::new(0));
    s.harness.registries.connectors.register(
        "refusing",
        Arc::new(Refusing {
            network: s.harness.network.clone(),
            refusals: AtomicUsize::new(2),
            dials: dials.clone(),
        }),
    );
    // the client retries faster than the connection redials, so each failed handshake has a waiting pick
    let transport = TransportConfig::default().with_connect_backoff(Backoff::default().with_base_delay(Duration::from_millis(50)).with_jitter(0.0));
    let client = s.harness.client(config().with_endpoints(["refusing://greeter-1"]).with_transport(transport));

    let reply: String = client.invoke(&CallContext::background(), SAY, "jo".to_owned()).await?;
    assert_eq!(reply, "greeter-1: hello jo");
    assert_eq!(dials.load(Ordering::SeqCst), 3);
    assert_eq!(*s.reports.lock().unwrap(), [Err(Code::Unavailable), Err(Code::Unavailable), Ok(())]);
    Ok(())
}

#[tokio::test]
async fn test_exhausted_budget_returns_the_last_error() -> anyhow::Result<()> {
    let s = setup(100);
    let client = s.harness.client(config());

    let err = client.invoke::<String, String>(&CallContext::background(), SAY, "fi".to_owned()).await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(err.message(), "stream refused #4");
    assert_eq!(s.reports.lock().unwrap().len(), meshcall::client::MAX_ATTEMPTS as usize);
    assert_eq!(s.refusals.load(Ordering::SeqCst), 96);
    assert_eq!(s.harness.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_application_errors_are_not_retried() -> anyhow::Result<()> {
    let s = setup(0);
    let client = s.harness.client(config());

    let err = client.invoke::<String, String>(&CallContext::background(), BOOM, "x".to_owned()).await.unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(s.opened.load(Ordering::SeqCst), 1);
    assert_eq!(*s.reports.lock().unwrap(), [Ok(())]);
    Ok(())
}

#[tokio::test]
async fn test_no_endpoints_fails_unavailable() -> anyhow::Result<()> {
    let s = setup(0);
    let client = s.harness.client(config().with_endpoints(Vec::<String>::new()));

    let err = client.invoke::<String, String>(&CallContext::background(), SAY, "x".to_owned()).await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert!(s.reports.lock().unwrap().is_empty());
    Ok(())
}
