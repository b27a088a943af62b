// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! The background task behind a client.
//!
//! It owns the resolver watch, the balancer and the transport connections,
//! and publishes a new [`PickSnap`] whenever any of them changes.

use super::conn::{ConnSettings, TransportConn};
use super::CallSettings;
use crate::balancer::{Balancer, Picker};
use crate::config::ClientConfig;
use crate::endpoint::Endpoint;
use crate::registry::Registries;
use crate::resolver::{diff_endpoints, EndpointsReceiver, Resolver};
use crate::status::Status;
use async_broadcast::{broadcast, InactiveReceiver, Receiver, RecvError, Sender};
use faststr::FastStr;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// What calls pick from. Replaced as a whole, never mutated.
pub(crate) struct PickSnap {
    pub version: u64,
    pub picker: Arc<dyn Picker>,
    pub conns: HashMap<FastStr, Arc<TransportConn>>,
    pub settings: Arc<CallSettings>,
}

impl std::fmt::Debug for PickSnap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PickSnap").field("version", &self.version).field("conns", &self.conns.keys().collect::<Vec<_>>()).finish_non_exhaustive()
    }
}

pub(crate) type SnapSender = watch::Sender<Option<Arc<PickSnap>>>;
pub(crate) type SnapReceiver = watch::Receiver<Option<Arc<PickSnap>>>;

/// Sending side of the config channel.
pub(crate) struct ConfigSender {
    tx: Sender<ClientConfig>,
    // keeps the channel open while the watcher is between receives
    _keep: InactiveReceiver<ClientConfig>,
}

impl ConfigSender {
    /// Publishes a config, replacing one that was not consumed yet.
    pub(crate) fn publish(&self, cfg: ClientConfig) -> Result<(), Status> {
        match self.tx.try_broadcast(cfg) {
            Ok(_) => Ok(()),
            Err(async_broadcast::TrySendError::Full(_)) => Err(Status::internal("config channel is full")),
            Err(_) => Err(super::closing()),
        }
    }

    pub(crate) fn close(&self) {
        self.tx.close();
    }
}

/// A depth-one channel where the newest config wins.
pub(crate) fn config_channel() -> (ConfigSender, Receiver<ClientConfig>) {
    let (mut tx, rx) = broadcast(1);
    tx.set_overflow(true);
    let keep = rx.clone().deactivate();
    (ConfigSender { tx, _keep: keep }, rx)
}

struct ResolverWatch {
    name: String,
    resolver: Arc<dyn Resolver>,
    // none once the resolver stops publishing
    rx: Option<EndpointsReceiver>,
}

enum Event {
    Shutdown,
    Config(Option<ClientConfig>),
    Endpoints(Option<Vec<Endpoint>>),
}

pub(crate) struct Watcher {
    service: FastStr,
    registries: Arc<Registries>,
    config: ClientConfig,
    settings: Arc<CallSettings>,
    resolver: Option<ResolverWatch>,
    balancer: Arc<dyn Balancer>,
    endpoints: Vec<Endpoint>,
    conns: HashMap<FastStr, Arc<TransportConn>>,
    resolved: bool,
    version: u64,
    snap_tx: SnapSender,
}

impl Watcher {
    pub(crate) fn new(service: FastStr, config: ClientConfig, registries: Arc<Registries>, snap_tx: SnapSender) -> Result<Self, Status> {
        let balancer = new_balancer(&registries, &config.balancer)?;
        let resolver = match &config.resolver {
            Some(name) => Some(start_watch(&registries, name, &service)?),
            None => None,
        };
        let settings = Arc::new(CallSettings::from_config(&config, &registries));
        let mut watcher = Self {
            service,
            registries,
            settings,
            balancer,
            resolver,
            endpoints: Vec::new(),
            conns: HashMap::new(),
            resolved: false,
            version: 0,
            snap_tx,
            config,
        };
        if watcher.resolver.is_none() {
            let endpoints = watcher.config.parsed_endpoints();
            watcher.on_endpoints(endpoints);
        }
        Ok(watcher)
    }

    /// Runs until shutdown, then tears everything down.
    pub(crate) async fn run(mut self, mut config_rx: Receiver<ClientConfig>, shutdown: CancellationToken) -> Vec<Status> {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => Event::Shutdown,
                cfg = recv_latest(&mut config_rx) => Event::Config(cfg),
                eps = recv_endpoints(self.resolver.as_mut()) => Event::Endpoints(eps),
            };
            match event {
                Event::Shutdown | Event::Config(None) => break,
                Event::Config(Some(cfg)) => self.apply_config(cfg),
                Event::Endpoints(Some(eps)) => self.on_endpoints(eps),
                Event::Endpoints(None) => {
                    tracing::warn!(service = %self.service, "resolver stopped publishing, keeping the last endpoints");
                    if let Some(watch) = &mut self.resolver {
                        watch.rx = None;
                    }
                },
            }
        }
        self.teardown()
    }

    fn apply_config(&mut self, cfg: ClientConfig) {
        if cfg == self.config {
            return;
        }
        tracing::info!(service = %self.service, "applying client config");
        self.settings = Arc::new(CallSettings::from_config(&cfg, &self.registries));

        if cfg.balancer != self.config.balancer {
            match new_balancer(&self.registries, &cfg.balancer) {
                Ok(balancer) => {
                    balancer.update(self.usable(&self.endpoints));
                    let old = std::mem::replace(&mut self.balancer, balancer);
                    if let Err(e) = old.close() {
                        tracing::warn!(service = %self.service, balancer = old.name(), error = %e, "closing the old balancer failed");
                    }
                },
                Err(e) => tracing::warn!(service = %self.service, error = %e, "keeping the current balancer"),
            }
        }

        let resolver_changed = cfg.resolver != self.config.resolver;
        let endpoints_changed = cfg.endpoints != self.config.endpoints;
        self.config = cfg;

        if resolver_changed {
            self.stop_watch();
            if let Some(name) = self.config.resolver.clone() {
                match start_watch(&self.registries, &name, &self.service) {
                    Ok(watch) => {
                        self.resolver = Some(watch);
                        // wait for the new resolver before publishing
                        self.resolved = false;
                        return;
                    },
                    Err(e) => tracing::warn!(service = %self.service, resolver = %name, error = %e, "resolver watch failed, using static endpoints"),
                }
            }
        }
        if self.resolver.is_none() && (resolver_changed || endpoints_changed) {
            let endpoints = self.config.parsed_endpoints();
            self.on_endpoints(endpoints);
        } else {
            self.publish();
        }
    }

    fn on_endpoints(&mut self, endpoints: Vec<Endpoint>) {
        let change = diff_endpoints(&self.endpoints, endpoints);
        if change.is_changed() {
            tracing::debug!(
                service = %self.service,
                added = change.added.len(),
                updated = change.updated.len(),
                removed = change.removed.len(),
                "endpoints changed"
            );
        }
        let usable = self.usable(&change.all);
        let mut conns = HashMap::with_capacity(usable.len());
        for ep in &usable {
            let reuse = self.conns.get(ep.address()).filter(|conn| conn.endpoint().scheme() == ep.scheme()).cloned();
            let conn = match reuse {
                Some(conn) => conn,
                None => match self.registries.connectors.get(ep.scheme()) {
                    Some(connector) => TransportConn::new(ep.clone(), connector, ConnSettings::from(&self.config.transport)),
                    None => continue,
                },
            };
            conns.insert(ep.address().clone(), conn);
        }
        self.balancer.update(usable);
        let old = std::mem::replace(&mut self.conns, conns);
        self.endpoints = change.all;
        self.resolved = true;
        self.publish();

        for (address, conn) in old {
            let kept = self.conns.get(&address).is_some_and(|c| Arc::ptr_eq(c, &conn));
            if kept {
                continue;
            }
            if let Err(e) = conn.close() {
                tracing::debug!(service = %self.service, %address, error = %e, "closing a removed connection failed");
            }
        }
    }

    /// Endpoints whose scheme has a connector.
    fn usable(&self, endpoints: &[Endpoint]) -> Vec<Endpoint> {
        endpoints
            .iter()
            .filter(|ep| {
                let known = self.registries.connectors.contains(ep.scheme());
                if !known {
                    tracing::warn!(service = %self.service, endpoint = %ep.address(), scheme = %ep.scheme(), "no connector for scheme, endpoint skipped");
                }
                known
            })
            .cloned()
            .collect()
    }

    fn publish(&mut self) {
        if !self.resolved {
            return;
        }
        self.version += 1;
        let snap = PickSnap {
            version: self.version,
            picker: self.balancer.picker(),
            conns: self.conns.clone(),
            settings: self.settings.clone(),
        };
        tracing::debug!(service = %self.service, version = self.version, endpoints = snap.conns.len(), "pick snapshot published");
        self.snap_tx.send_replace(Some(Arc::new(snap)));
    }

    fn stop_watch(&mut self) -> Option<Status> {
        let watch = self.resolver.take()?;
        watch.resolver.del_watch(&self.service).err().map(|e| {
            tracing::warn!(service = %self.service, resolver = %watch.name, error = %e, "removing the resolver watch failed");
            e
        })
    }

    fn teardown(mut self) -> Vec<Status> {
        let mut errors = Vec::new();
        errors.extend(self.stop_watch());
        if let Err(e) = self.balancer.close() {
            errors.push(e);
        }
        for (_, conn) in self.conns.drain() {
            if let Err(e) = conn.close() {
                errors.push(e);
            }
        }
        tracing::debug!(service = %self.service, errors = errors.len(), "client torn down");
        errors
    }
}

fn new_balancer(registries: &Registries, name: &str) -> Result<Arc<dyn Balancer>, Status> {
    match registries.balancers.get(name) {
        Some(build) => Ok(build()),
        None => Err(Status::not_found(format!("balancer {name:?} is not registered"))),
    }
}

fn start_watch(registries: &Registries, name: &str, service: &str) -> Result<ResolverWatch, Status> {
    let resolver = registries.resolvers.get_or_create(name)?;
    let rx = resolver.add_watch(service)?;
    Ok(ResolverWatch {
        name: name.to_owned(),
        resolver,
        rx: Some(rx),
    })
}

async fn recv_latest(rx: &mut Receiver<ClientConfig>) -> Option<ClientConfig> {
    loop {
        match rx.recv().await {
            Ok(cfg) => return Some(cfg),
            Err(RecvError::Overflowed(_)) => continue,
            Err(RecvError::Closed) => return None,
        }
    }
}

async fn recv_endpoints(watch: Option<&mut ResolverWatch>) -> Option<Vec<Endpoint>> {
    let Some(rx) = watch.and_then(|w| w.rx.as_mut()) else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(eps) => return Some(eps),
            Err(RecvError::Overflowed(_)) => continue,
            Err(RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;

    #[tokio::test]
    async fn test_config_channel_latest_wins() {
        let (tx, mut rx) = config_channel();
        tx.publish(ClientConfig::default().with_balancer("first")).unwrap();
        tx.publish(ClientConfig::default().with_balancer("second")).unwrap();
        tx.publish(ClientConfig::default().with_balancer("third")).unwrap();
        let cfg = recv_latest(&mut rx).await.unwrap();
        assert_eq!(cfg.balancer, "third");
        tx.close();
        assert!(recv_latest(&mut rx).await.is_none());
    }

    fn watcher(config: ClientConfig, registries: Arc<Registries>) -> (Watcher, SnapReceiver) {
        let (snap_tx, snap_rx) = watch::channel(None);
        (Watcher::new(FastStr::from_static_str("demo.Greeter"), config, registries, snap_tx).unwrap(), snap_rx)
    }

    #[tokio::test]
    async fn test_static_endpoints_publish_at_once_and_skip_unknown_schemes() {
        let registries = Arc::new(Registries::new());
        crate::transport::memory::MemoryNetwork::new().install(&registries);
        let cfg = ClientConfig::default().with_endpoints(["mem://a", "mem://b", "carrier-pigeon://c"]);
        let (_watcher, snap_rx) = watcher(cfg, registries);
        let snap = snap_rx.borrow().clone().unwrap();
        assert_eq!(snap.version, 1);
        let mut addrs: Vec<_> = snap.conns.keys().map(|a| a.as_str()).collect();
        addrs.sort();
        assert_eq!(addrs, ["a", "b"]);
    }

    #[tokio::test]
    async fn test_connections_are_reused_across_updates() {
        let registries = Arc::new(Registries::new());
        crate::transport::memory::MemoryNetwork::new().install(&registries);
        let (mut watcher, snap_rx) = watcher(ClientConfig::default().with_endpoints(["mem://a", "mem://b"]), registries);
        let before = snap_rx.borrow().clone().unwrap();

        watcher.apply_config(ClientConfig::default().with_endpoints(["mem://b", "mem://c"]).with_transport(TransportConfig::default()));
        let after = snap_rx.borrow().clone().unwrap();
        assert_eq!(after.version, 2);
        assert!(Arc::ptr_eq(&before.conns["b"], &after.conns["b"]));
        assert!(!after.conns.contains_key("a"));
        assert!(after.conns.contains_key("c"));

        // same config again publishes nothing
        watcher.apply_config(watcher.config.clone());
        assert_eq!(snap_rx.borrow().as_ref().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_resolver_gates_publishing() {
        let registries = Arc::new(Registries::new());
        crate::transport::memory::MemoryNetwork::new().install(&registries);
        let resolver = Arc::new(crate::resolver::StaticResolver::new());
        registries.resolvers.register_instance("fixed", resolver.clone());

        let (watcher, mut snap_rx) = watcher(ClientConfig::default().with_resolver("fixed"), registries);
        assert!(snap_rx.borrow().is_none());

        let shutdown = CancellationToken::new();
        let (_cfg_tx, cfg_rx) = config_channel();
        let task = tokio::spawn(watcher.run(cfg_rx, shutdown.clone()));
        resolver.set_endpoints("demo.Greeter", vec![Endpoint::parse("mem://x")]);
        let snap = snap_rx.wait_for(Option::is_some).await.unwrap().clone().unwrap();
        assert!(snap.conns.contains_key("x"));

        shutdown.cancel();
        assert!(task.await.unwrap().is_empty());
        // the watch was removed on teardown
        assert!(resolver.del_watch("demo.Greeter").is_err());
    }
}
