// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use meshcall::config::{ClientConfig, ServerConfig};
use meshcall::transport::memory::MemoryNetwork;
use meshcall::{CallContext, Client, ClientStreamExt, Registries, Server, StreamDesc};
use service::{greeter, init_tracing, HelloReply, HelloRequest, COUNTDOWN, GREETER, HELLO};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

#[derive(Parser)]
struct Flags {
    /// Sets the name to say hello to.
    #[clap(long, default_value = "meshcall")]
    name: String,
    /// Sets how many in-process greeter instances to start.
    #[clap(long, default_value_t = 2)]
    instances: usize,
    /// Sets the number of hello calls.
    #[clap(long, default_value_t = 4)]
    calls: usize,
    /// Sets the compressor to request, e.g. `gzip`.
    #[clap(long)]
    compressor: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    init_tracing("Meshcall Demo")?;

    let registries = Arc::new(Registries::new());
    let network = MemoryNetwork::new();
    network.install(&registries);

    let mut servers = Vec::new();
    let mut endpoints = Vec::new();
    for i in 1..=flags.instances {
        let addr = format!("greeter-{i}");
        let server = Server::new(ServerConfig::default(), registries.clone());
        server.register_service(greeter(addr.clone()))?;
        let listener = network.listen(addr.clone())?;
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(Box::new(listener)).await });
        endpoints.push(format!("mem://{addr}"));
        servers.push(server);
    }

    let mut config = ClientConfig::default().with_balancer("round_robin").with_endpoints(endpoints);
    if let Some(compressor) = flags.compressor {
        config = config.with_compressor(compressor);
    }
    let client = Client::new(GREETER, config, registries.clone())?;

    async {
        for i in 0..flags.calls {
            let ctx = CallContext::background().with_timeout(Duration::from_secs(5));
            let req = HelloRequest { name: format!("{}{i}", flags.name) };
            match client.invoke::<HelloRequest, HelloReply>(&ctx, HELLO, req).await {
                Ok(reply) => tracing::info!(instance = %reply.instance, "{}", reply.message),
                Err(e) => tracing::warn!("{:?}", anyhow::Error::from(e)),
            }
        }
    }
    .instrument(tracing::info_span!("Hellos"))
    .await;

    let countdown = async {
        let stream = client.new_stream(&CallContext::background(), StreamDesc::server_streaming("Countdown"), COUNTDOWN).await?;
        stream.send(&3u32).await?;
        while let Some(n) = stream.recv::<u32>().await? {
            tracing::info!(n, "countdown");
        }
        anyhow::Ok(())
    }
    .instrument(tracing::info_span!("Countdown"))
    .await;
    if let Err(e) = countdown {
        tracing::warn!("{e:?}");
    }

    client.close().await?;
    for server in servers {
        server.graceful_stop().await;
    }
    Ok(())
}
