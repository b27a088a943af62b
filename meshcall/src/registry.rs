// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Name-keyed registries of pluggable components.
//!
//! Configuration refers to balancers, resolvers, interceptors, transports and
//! compressors by name; the [`Registries`] bundle maps those names to
//! implementations. [`Registries::global`] is shared by the whole process,
//! while tests usually build their own with [`Registries::new`].

use crate::balancer::{Balancer, BalancerBuilder, RandomBalancer, RoundRobinBalancer, RANDOM, ROUND_ROBIN};
use crate::compress::{Compressor, Gzip};
use crate::interceptor::{InterceptorBuilder, StreamClientInterceptor, StreamServerInterceptor, UnaryClientInterceptor, UnaryServerInterceptor};
use crate::resolver::ResolverRegistry;
use crate::transport::{Connector, ListenerBuilder};
use faststr::FastStr;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

/// A concurrent map from names to shared components.
pub struct NamedRegistry<T: ?Sized> {
    kind: &'static str,
    entries: RwLock<HashMap<FastStr, Arc<T>>>,
}

impl<T: ?Sized> NamedRegistry<T> {
    /// Creates an empty registry; `kind` names the component type in logs.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `entry` under `name`, replacing any previous entry.
    pub fn register(&self, name: impl Into<FastStr>, entry: Arc<T>) {
        let name = name.into();
        let prev = self.entries.write().unwrap_or_else(PoisonError::into_inner).insert(name.clone(), entry);
        if prev.is_some() {
            tracing::debug!(kind = self.kind, %name, "registration replaced");
        }
    }

    /// Looks `name` up.
    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).contains_key(name)
    }

    /// Removes `name`, returning its entry.
    pub fn unregister(&self, name: &str) -> Option<Arc<T>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).remove(name)
    }

    /// The registered names, sorted.
    pub fn names(&self) -> Vec<FastStr> {
        let mut names: Vec<FastStr> = self.entries.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        names.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        names
    }
}

impl<T: ?Sized> fmt::Debug for NamedRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedRegistry").field("kind", &self.kind).field("names", &self.names()).finish()
    }
}

/// Every registry a client or server looks components up in.
#[derive(Debug)]
pub struct Registries {
    /// Load-balancing policies.
    pub balancers: NamedRegistry<BalancerBuilder>,
    /// Endpoint resolvers.
    pub resolvers: ResolverRegistry,
    /// Unary client interceptors.
    pub unary_client_interceptors: NamedRegistry<InterceptorBuilder<dyn UnaryClientInterceptor>>,
    /// Streaming client interceptors.
    pub stream_client_interceptors: NamedRegistry<InterceptorBuilder<dyn StreamClientInterceptor>>,
    /// Unary server interceptors.
    pub unary_server_interceptors: NamedRegistry<InterceptorBuilder<dyn UnaryServerInterceptor>>,
    /// Streaming server interceptors.
    pub stream_server_interceptors: NamedRegistry<InterceptorBuilder<dyn StreamServerInterceptor>>,
    /// Client transports, by endpoint scheme.
    pub connectors: NamedRegistry<dyn Connector>,
    /// Server transports, by scheme.
    pub listeners: NamedRegistry<ListenerBuilder>,
    /// Message compressors, by encoding name.
    pub compressors: NamedRegistry<dyn Compressor>,
}

impl Registries {
    /// Registries holding the built-in balancers and the gzip compressor.
    pub fn new() -> Self {
        let registries = Self::empty();
        registries.balancers.register(ROUND_ROBIN, Arc::new(|| Arc::new(RoundRobinBalancer::new()) as Arc<dyn Balancer>));
        registries.balancers.register(RANDOM, Arc::new(|| Arc::new(RandomBalancer::new()) as Arc<dyn Balancer>));
        registries.compressors.register(Gzip::NAME, Arc::new(Gzip::default()));
        registries
    }

    /// Registries with nothing registered.
    pub fn empty() -> Self {
        Self {
            balancers: NamedRegistry::new("balancer"),
            resolvers: ResolverRegistry::new(),
            unary_client_interceptors: NamedRegistry::new("unary client interceptor"),
            stream_client_interceptors: NamedRegistry::new("stream client interceptor"),
            unary_server_interceptors: NamedRegistry::new("unary server interceptor"),
            stream_server_interceptors: NamedRegistry::new("stream server interceptor"),
            connectors: NamedRegistry::new("connector"),
            listeners: NamedRegistry::new("listener"),
            compressors: NamedRegistry::new("compressor"),
        }
    }

    /// The process-wide registries.
    pub fn global() -> Arc<Registries> {
        static GLOBAL: OnceLock<Arc<Registries>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Registries::new())).clone()
    }

    /// The comma-separated names of every registered compressor.
    pub(crate) fn accept_encoding(&self) -> String {
        self.compressors.names().iter().map(FastStr::as_str).collect::<Vec<_>>().join(",")
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_registered() {
        let registries = Registries::new();
        assert!(registries.balancers.contains(ROUND_ROBIN));
        assert!(registries.balancers.contains(RANDOM));
        assert_eq!(registries.accept_encoding(), "gzip");
        let rr = registries.balancers.get(ROUND_ROBIN).unwrap()();
        assert_eq!(rr.name(), ROUND_ROBIN);
    }

    #[test]
    fn test_register_replace_unregister() {
        let reg: NamedRegistry<dyn Compressor> = NamedRegistry::new("compressor");
        assert!(reg.get("gzip").is_none());
        reg.register("gzip", Arc::new(Gzip::with_level(1)));
        reg.register("gzip", Arc::new(Gzip::with_level(9)));
        assert_eq!(reg.names(), vec![FastStr::from_static_str("gzip")]);
        assert!(reg.unregister("gzip").is_some());
        assert!(!reg.contains("gzip"));
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(&Registries::global(), &Registries::global()));
    }
}
