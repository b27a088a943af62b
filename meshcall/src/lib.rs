// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! meshcall is the transport and invocation core of a Rust RPC framework.
//!
//! It connects clients to service instances, multiplexes unary and streaming
//! calls over length-prefixed message frames, balances calls across the
//! instances a resolver reports, and runs configurable interceptor chains
//! around every call on both sides.
//!
//! ```no_run
//! use meshcall::config::{ClientConfig, ServerConfig};
//! use meshcall::server::{MethodDesc, Server, ServiceDesc};
//! use meshcall::transport::memory::MemoryNetwork;
//! use meshcall::{CallContext, Client, Registries, Status};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Status> {
//! let registries = Arc::new(Registries::new());
//! MemoryNetwork::new().install(&registries);
//!
//! let server = Server::new(ServerConfig::default(), registries.clone());
//! server.register_service(ServiceDesc::new("demo.Greeter").with_method(MethodDesc::unary("Say", |_ctx, name: String| async move { Ok(format!("hello {name}")) })))?;
//! let serving = server.clone();
//! tokio::spawn(async move { serving.listen_and_serve("mem", "greeter-1").await });
//!
//! let client = Client::new("demo.Greeter", ClientConfig::default().with_endpoints(["mem://greeter-1"]), registries)?;
//! let reply: String = client.invoke(&CallContext::background(), "/demo.Greeter/Say", "world".to_owned()).await?;
//! assert_eq!(reply, "hello world");
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]
#![allow(clippy::type_complexity)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod backoff;
pub mod balancer;
pub mod client;
pub mod codec;
pub mod compress;
pub mod config;
pub mod endpoint;
pub mod framing;
pub mod interceptor;
pub mod metadata;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod status;
pub mod stream;
pub mod transport;

pub use client::{Client, CloseError};
pub use codec::{Codec, Message};
pub use endpoint::Endpoint;
pub use metadata::{CallContext, Metadata};
pub use registry::Registries;
pub use server::Server;
pub use status::{Code, Status};
pub use stream::{ClientStream, ClientStreamExt, ServerStream, ServerStreamExt, StreamDesc};
