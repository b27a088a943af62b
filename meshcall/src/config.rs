// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Client and server configuration.
//!
//! Every config is plain serde data with defaults, so it can be built with the
//! `with_*` methods or loaded from JSON. Durations are written the
//! [humantime](https://docs.rs/humantime) way, e.g. `"250ms"` or `"2m 30s"`.

use crate::backoff::Backoff;
use crate::balancer::ROUND_ROBIN;
use crate::codec::Codec;
use crate::endpoint::Endpoint;
use crate::framing::{DEFAULT_MAX_RECEIVE_MESSAGE_SIZE, DEFAULT_MAX_SEND_MESSAGE_SIZE};
use crate::status::Status;
use faststr::FastStr;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Serde adapter for humantime durations.
pub mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Writes `"1s 500ms"`-style strings.
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    /// Reads `"1s 500ms"`-style strings.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(d)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

/// Interceptor names, outermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptorNames {
    /// Unary interceptors.
    pub unary: Vec<String>,
    /// Streaming interceptors.
    pub stream: Vec<String>,
}

impl InterceptorNames {
    /// Appends a unary interceptor.
    pub fn with_unary(mut self, name: impl Into<String>) -> Self {
        self.unary.push(name.into());
        self
    }

    /// Appends a streaming interceptor.
    pub fn with_stream(mut self, name: impl Into<String>) -> Self {
        self.stream.push(name.into());
        self
    }

    /// `global` followed by `local`.
    pub(crate) fn merged(global: &InterceptorNames, local: &InterceptorNames) -> (Vec<FastStr>, Vec<FastStr>) {
        let join = |a: &[String], b: &[String]| a.iter().chain(b).map(|n| FastStr::new(n)).collect::<Vec<_>>();
        (join(&global.unary, &local.unary), join(&global.stream, &local.stream))
    }
}

/// Connection-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Lower bound of the handshake deadline.
    #[serde(with = "duration")]
    pub min_connect_timeout: Duration,
    /// Backoff between connection attempts.
    pub connect_backoff: Backoff,
    /// Consecutive failed attempts before a connection gives up until next use.
    pub max_connect_attempts: u32,
    /// Keepalive ping interval; zero disables keepalive.
    #[serde(with = "duration")]
    pub keepalive: Duration,
    /// How long to wait for a keepalive ack.
    #[serde(with = "duration")]
    pub keepalive_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            min_connect_timeout: Duration::from_secs(20),
            connect_backoff: Backoff::default(),
            max_connect_attempts: 3,
            keepalive: Duration::ZERO,
            keepalive_timeout: Duration::from_secs(20),
        }
    }
}

impl TransportConfig {
    /// Sets the lower bound of the handshake deadline.
    pub fn with_min_connect_timeout(mut self, timeout: Duration) -> Self {
        self.min_connect_timeout = timeout;
        self
    }

    /// Sets the backoff between connection attempts.
    pub fn with_connect_backoff(mut self, backoff: Backoff) -> Self {
        self.connect_backoff = backoff;
        self
    }

    /// Sets the number of attempts per connect episode.
    pub fn with_max_connect_attempts(mut self, attempts: u32) -> Self {
        self.max_connect_attempts = attempts.max(1);
        self
    }

    /// Sets the keepalive interval.
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }
}

/// Configuration of one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Balancer name.
    pub balancer: String,
    /// Resolver name; when unset, `endpoints` is used as is.
    pub resolver: Option<String>,
    /// Static endpoints, `scheme://address`.
    pub endpoints: Vec<String>,
    /// Content-subtype of the codec.
    pub codec: String,
    /// Compressor applied to requests.
    pub compressor: Option<String>,
    /// Largest request accepted for sending.
    pub max_send_message_size: usize,
    /// Largest reply accepted.
    pub max_receive_message_size: usize,
    /// Backoff between attempts of one call.
    pub retry_backoff: Backoff,
    /// Interceptors of this client.
    pub interceptors: InterceptorNames,
    /// Connection settings.
    pub transport: TransportConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            balancer: ROUND_ROBIN.to_owned(),
            resolver: None,
            endpoints: Vec::new(),
            codec: Codec::default().name().to_owned(),
            compressor: None,
            max_send_message_size: DEFAULT_MAX_SEND_MESSAGE_SIZE,
            max_receive_message_size: DEFAULT_MAX_RECEIVE_MESSAGE_SIZE,
            retry_backoff: Backoff::default()
                .with_base_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_secs(1)),
            interceptors: InterceptorNames::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Sets the balancer.
    pub fn with_balancer(mut self, balancer: impl Into<String>) -> Self {
        self.balancer = balancer.into();
        self
    }

    /// Sets the resolver.
    pub fn with_resolver(mut self, resolver: impl Into<String>) -> Self {
        self.resolver = Some(resolver.into());
        self
    }

    /// Sets the static endpoints.
    pub fn with_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the codec.
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec.name().to_owned();
        self
    }

    /// Sets the request compressor.
    pub fn with_compressor(mut self, compressor: impl Into<String>) -> Self {
        self.compressor = Some(compressor.into());
        self
    }

    /// Sets the send size limit.
    pub fn with_max_send_message_size(mut self, size: usize) -> Self {
        self.max_send_message_size = size;
        self
    }

    /// Sets the receive size limit.
    pub fn with_max_receive_message_size(mut self, size: usize) -> Self {
        self.max_receive_message_size = size;
        self
    }

    /// Sets the backoff between attempts of one call.
    pub fn with_retry_backoff(mut self, backoff: Backoff) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Sets the interceptors.
    pub fn with_interceptors(mut self, interceptors: InterceptorNames) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// Sets the connection settings.
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// The configured codec; unknown names fall back to the default.
    pub fn codec(&self) -> Codec {
        Codec::from_content_subtype(&self.codec).unwrap_or_else(|| {
            tracing::warn!(codec = %self.codec, "unknown codec, using the default");
            Codec::default()
        })
    }

    /// The static endpoints, parsed.
    pub fn parsed_endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.iter().map(|e| Endpoint::parse(e)).collect()
    }
}

/// Configuration of one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Largest reply accepted for sending.
    pub max_send_message_size: usize,
    /// Largest request accepted.
    pub max_receive_message_size: usize,
    /// Interceptors of this server.
    pub interceptors: InterceptorNames,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_send_message_size: DEFAULT_MAX_SEND_MESSAGE_SIZE,
            max_receive_message_size: DEFAULT_MAX_RECEIVE_MESSAGE_SIZE,
            interceptors: InterceptorNames::default(),
        }
    }
}

impl ServerConfig {
    /// Sets the send size limit.
    pub fn with_max_send_message_size(mut self, size: usize) -> Self {
        self.max_send_message_size = size;
        self
    }

    /// Sets the receive size limit.
    pub fn with_max_receive_message_size(mut self, size: usize) -> Self {
        self.max_receive_message_size = size;
        self
    }

    /// Sets the interceptors.
    pub fn with_interceptors(mut self, interceptors: InterceptorNames) -> Self {
        self.interceptors = interceptors;
        self
    }
}

/// Interceptors applied to every client or every server of the process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Run before each client's own interceptors.
    pub client_interceptors: InterceptorNames,
    /// Run before each server's own interceptors.
    pub server_interceptors: InterceptorNames,
}

/// A whole configuration file.
///
/// ```
/// let cfg = meshcall::config::RpcConfig::from_json(r#"{
///     "global": { "client_interceptors": { "unary": ["trace"] } },
///     "clients": { "demo.Greeter": { "endpoints": ["mem://greeter-0"], "retry_backoff": { "base_delay": "5ms" } } }
/// }"#).unwrap();
/// let client = cfg.client("demo.Greeter");
/// assert_eq!(client.endpoints, ["mem://greeter-0"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Process-wide interceptors.
    pub global: GlobalConfig,
    /// Client configs by service name.
    pub clients: HashMap<String, ClientConfig>,
    /// Server config.
    pub server: ServerConfig,
}

impl RpcConfig {
    /// Parses a JSON document.
    pub fn from_json(text: &str) -> Result<Self, Status> {
        serde_json::from_str(text).map_err(|e| Status::invalid_argument(format!("invalid config: {e}")))
    }

    /// The config of the client for `service`, or the default one.
    pub fn client(&self, service: &str) -> ClientConfig {
        self.clients.get(service).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let cfg = RpcConfig::from_json("{}").unwrap();
        assert_eq!(cfg, RpcConfig::default());
        let client = cfg.client("any.Service");
        assert_eq!(client.balancer, ROUND_ROBIN);
        assert_eq!(client.codec(), Codec::Bincode);
        assert_eq!(client.transport.max_connect_attempts, 3);
        assert_eq!(client.max_receive_message_size, DEFAULT_MAX_RECEIVE_MESSAGE_SIZE);
    }

    #[test]
    fn test_humantime_durations() {
        let cfg = RpcConfig::from_json(
            r#"{"clients": {"a.B": {"codec": "json", "transport": {"min_connect_timeout": "1s 500ms", "keepalive": "10s"}}}}"#,
        )
        .unwrap();
        let client = cfg.client("a.B");
        assert_eq!(client.codec(), Codec::Json);
        assert_eq!(client.transport.min_connect_timeout, Duration::from_millis(1500));
        assert_eq!(client.transport.keepalive, Duration::from_secs(10));

        let back: ClientConfig = serde_json::from_str(&serde_json::to_string(&client).unwrap()).unwrap();
        assert_eq!(back, client);
    }

    #[test]
    fn test_malformed_document_is_invalid_argument() {
        let err = RpcConfig::from_json(r#"{"clients": {"a.B": {"transport": {"keepalive": "soon"}}}}"#).unwrap_err();
        assert_eq!(err.code(), crate::status::Code::InvalidArgument);
    }

    #[test]
    fn test_interceptor_names_merge_global_first() {
        let global = InterceptorNames::default().with_unary("auth").with_stream("log");
        let local = InterceptorNames::default().with_unary("retry");
        let (unary, stream) = InterceptorNames::merged(&global, &local);
        assert_eq!(unary, vec![FastStr::from_static_str("auth"), FastStr::from_static_str("retry")]);
        assert_eq!(stream, vec![FastStr::from_static_str("log")]);
    }
}
