// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Endpoint discovery.
//!
//! A [`Resolver`] publishes the endpoint list of each watched service on an
//! [`async_broadcast`] channel. Channels are bounded to one pending list and
//! overwrite it, so a slow watcher only ever sees the latest list.

mod fixed;

pub use fixed::StaticResolver;

use crate::endpoint::Endpoint;
use crate::registry::NamedRegistry;
use crate::status::Status;
use async_broadcast::Receiver;
use faststr::FastStr;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

/// Receives the endpoint lists of one watched service.
pub type EndpointsReceiver = Receiver<Vec<Endpoint>>;

/// Discovers the endpoints of services.
pub trait Resolver: Send + Sync + 'static {
    /// Registered name of the resolver.
    fn name(&self) -> &str;
    /// Starts watching `service`.
    ///
    /// If the endpoints are already known, the receiver gets them first.
    fn add_watch(&self, service: &str) -> Result<EndpointsReceiver, Status>;
    /// Stops one watch of `service`.
    fn del_watch(&self, service: &str) -> Result<(), Status>;
    /// Ends every watch.
    fn close(&self) -> Result<(), Status>;
}

/// Builds a resolver instance.
pub type ResolverBuilder = dyn Fn() -> Result<Arc<dyn Resolver>, Status> + Send + Sync;

/// Resolver builders plus the instances built from them.
///
/// One instance per name is shared by every client of the process.
pub struct ResolverRegistry {
    builders: NamedRegistry<ResolverBuilder>,
    instances: RwLock<HashMap<FastStr, Arc<dyn Resolver>>>,
}

impl ResolverRegistry {
    pub(crate) fn new() -> Self {
        Self {
            builders: NamedRegistry::new("resolver"),
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a builder, replacing any previous one of that name.
    pub fn register(&self, name: impl Into<FastStr>, builder: Arc<ResolverBuilder>) {
        self.builders.register(name, builder)
    }

    /// Registers an existing instance under `name`.
    pub fn register_instance(&self, name: impl Into<FastStr>, resolver: Arc<dyn Resolver>) {
        let name = name.into();
        let shared = resolver.clone();
        self.builders.register(name.clone(), Arc::new(move || Ok::<_, Status>(shared.clone())));
        self.instances.write().unwrap_or_else(PoisonError::into_inner).insert(name, resolver);
    }

    /// Returns the instance for `name`, building it on first use.
    pub fn get_or_create(&self, name: &str) -> Result<Arc<dyn Resolver>, Status> {
        if let Some(r) = self.instances.read().unwrap_or_else(PoisonError::into_inner).get(name) {
            return Ok(r.clone());
        }
        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(r) = instances.get(name) {
            return Ok(r.clone());
        }
        let build = self.builders.get(name).ok_or_else(|| Status::not_found(format!("resolver {name:?} is not registered")))?;
        let resolver = build()?;
        instances.insert(FastStr::new(name), resolver.clone());
        Ok(resolver)
    }
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverRegistry").field("builders", &self.builders).finish_non_exhaustive()
    }
}

/// The difference between two endpoint lists.
#[derive(Debug, Clone, Default)]
pub struct EndpointChange {
    /// The new list.
    pub all: Vec<Endpoint>,
    /// Endpoints whose address was not present before.
    pub added: Vec<Endpoint>,
    /// Endpoints present in both lists whose scheme or metadata changed.
    pub updated: Vec<Endpoint>,
    /// Endpoints whose address is gone.
    pub removed: Vec<Endpoint>,
}

impl EndpointChange {
    /// Whether anything changed.
    pub fn is_changed(&self) -> bool {
        !self.added.is_empty() || !self.updated.is_empty() || !self.removed.is_empty()
    }
}

/// Compares two endpoint lists by address.
pub fn diff_endpoints(prev: &[Endpoint], next: Vec<Endpoint>) -> EndpointChange {
    let prev_by_addr: HashMap<&str, &Endpoint> = prev.iter().map(|ep| (ep.address().as_str(), ep)).collect();
    let next_set: HashSet<&str> = next.iter().map(|ep| ep.address().as_str()).collect();

    let mut added = Vec::new();
    let mut updated = Vec::new();
    for ep in &next {
        match prev_by_addr.get(ep.address().as_str()) {
            None => added.push(ep.clone()),
            Some(old) if *old != ep => updated.push(ep.clone()),
            Some(_) => {},
        }
    }
    let removed = prev.iter().filter(|ep| !next_set.contains(ep.address().as_str())).cloned().collect();

    EndpointChange { all: next, added, updated, removed }
}
