// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
#![allow(dead_code)]

use meshcall::config::{ClientConfig, ServerConfig, TransportConfig};
use meshcall::server::{MethodDesc, ServiceDesc, StreamMethodDesc};
use meshcall::transport::memory::MemoryNetwork;
use meshcall::{Client, Registries, Server, ServerStreamExt, Status, StreamDesc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub const SERVICE: &str = "demo.Greeter";
pub const SAY: &str = "/demo.Greeter/Say";
pub const COUNT: &str = "/demo.Greeter/Count";
pub const BOOM: &str = "/demo.Greeter/Boom";
pub const SLOW: &str = "/demo.Greeter/Slow";
pub const DEADLINE: &str = "/demo.Greeter/Deadline";
pub const SUM: &str = "/demo.Greeter/Sum";
pub const ECHO: &str = "/demo.Greeter/Echo";

/// An in-process network plus the registries that know it.
pub struct Harness {
    pub network: MemoryNetwork,
    pub registries: Arc<Registries>,
    pub calls: Arc<AtomicUsize>,
}

impl Harness {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("meshcall=debug")))
            .with_test_writer()
            .try_init();
        let registries = Arc::new(Registries::new());
        let network = MemoryNetwork::new();
        network.install(&registries);
        Self {
            network,
            registries,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Binds `addr` and serves the greeter on it.
    pub fn start(&self, addr: &'static str, config: ServerConfig) -> Server {
        let server = Server::new(config, self.registries.clone());
        server.register_service(greeter(addr, self.calls.clone())).expect("register");
        let listener = self.network.listen(addr).expect("listen");
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(Box::new(listener)).await });
        server
    }

    pub fn client(&self, config: ClientConfig) -> Client {
        Client::new(SERVICE, config, self.registries.clone()).expect("client")
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Fast connection settings for tests.
pub fn quick_transport() -> TransportConfig {
    TransportConfig::default()
        .with_min_connect_timeout(Duration::from_millis(100))
        .with_connect_backoff(meshcall::backoff::Backoff::default().with_base_delay(Duration::from_millis(5)).with_jitter(0.0))
        .with_max_connect_attempts(1)
}

/// The greeter service; replies name the instance that served them.
pub fn greeter(instance: &'static str, calls: Arc<AtomicUsize>) -> ServiceDesc {
    ServiceDesc::new(SERVICE)
        .with_method(MethodDesc::unary("Say", move |_ctx, name: String| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(format!("{instance}: hello {name}")) }
        }))
        .with_method(MethodDesc::unary("Boom", |_ctx, _: String| async move {
            if true {
                panic!("greeter exploded");
            }
            Ok(String::new())
        }))
        .with_method(MethodDesc::unary("Slow", |_ctx, millis: u64| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(millis)
        }))
        .with_method(MethodDesc::unary("Deadline", |ctx: meshcall::CallContext, _: String| async move {
            Ok(ctx.remaining().map(|d| d.as_millis() as u64))
        }))
        .with_stream(StreamMethodDesc::new(StreamDesc::server_streaming("Count"), |call| async move {
            let n = call.stream.recv::<u32>().await?.ok_or_else(|| Status::invalid_argument("missing count"))?;
            for i in 0..n {
                call.stream.send(&i).await?;
            }
            Ok(())
        }))
        .with_stream(StreamMethodDesc::new(StreamDesc::client_streaming("Sum"), |call| async move {
            let mut total = 0u64;
            while let Some(n) = call.stream.recv::<u32>().await? {
                total += u64::from(n);
            }
            call.stream.send(&total).await
        }))
        .with_stream(StreamMethodDesc::new(StreamDesc::bidi("Echo"), |call| async move {
            while let Some(text) = call.stream.recv::<String>().await? {
                call.stream.send(&format!("echo {text}")).await?;
            }
            Ok(())
        }))
}
