// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use meshcall::server::{MethodDesc, ServiceDesc, StreamMethodDesc};
use meshcall::{CallContext, ServerStreamExt, Status, StreamDesc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Service name of the greeter.
pub const GREETER: &str = "demo.Greeter";
/// Full name of the unary hello method.
pub const HELLO: &str = "/demo.Greeter/Hello";
/// Full name of the server-streaming countdown method.
pub const COUNTDOWN: &str = "/demo.Greeter/Countdown";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloReply {
    pub message: String,
    pub instance: String,
}

/// The greeter as served by `instance`.
pub fn greeter(instance: impl Into<String>) -> ServiceDesc {
    let instance = instance.into();
    ServiceDesc::new(GREETER)
        .with_method(MethodDesc::unary("Hello", move |ctx: CallContext, req: HelloRequest| {
            let instance = instance.clone();
            async move {
                tracing::info!(peer = ctx.peer().unwrap_or("?"), name = %req.name, "hello");
                Ok(HelloReply {
                    message: format!("Hello, {}!", req.name),
                    instance,
                })
            }
        }))
        .with_stream(StreamMethodDesc::new(StreamDesc::server_streaming("Countdown"), |call| async move {
            let from = call.stream.recv::<u32>().await?.ok_or_else(|| Status::invalid_argument("missing start"))?;
            for n in (0..=from).rev() {
                call.stream.send(&n).await?;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Ok(())
        }))
}

/// Installs a fmt subscriber filtered by `RUST_LOG`, defaulting to `info`.
pub fn init_tracing(service_name: &'static str) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()?;
    tracing::info!(service_name, "tracing initialized");
    Ok(())
}
