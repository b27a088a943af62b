// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use super::{diff_endpoints, EndpointsReceiver, Resolver};
use crate::endpoint::Endpoint;
use crate::status::Status;
use async_broadcast::{broadcast, InactiveReceiver, Sender, TrySendError};
use faststr::FastStr;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Name [`StaticResolver`] registers under by default.
pub const STATIC: &str = "static";

/// A resolver whose endpoint lists are set by the application.
///
/// Useful for fixed deployments and for tests that move endpoints around.
#[derive(Default)]
pub struct StaticResolver {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    closed: bool,
    table: HashMap<FastStr, Vec<Endpoint>>,
    watches: HashMap<FastStr, Watch>,
}

struct Watch {
    tx: Sender<Vec<Endpoint>>,
    // keeps the channel open while no watcher is receiving
    _keep: InactiveReceiver<Vec<Endpoint>>,
    watchers: usize,
}

impl StaticResolver {
    /// Creates an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the endpoints of `service`, notifying its watchers if they changed.
    pub fn set_endpoints(&self, service: &str, endpoints: Vec<Endpoint>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let prev = inner.table.get(service).map(Vec::as_slice).unwrap_or_default();
        let change = diff_endpoints(prev, endpoints);
        if !change.is_changed() && inner.table.contains_key(service) {
            return;
        }
        tracing::debug!(service, added = change.added.len(), removed = change.removed.len(), "static endpoints changed");
        if let Some(watch) = inner.watches.get(service) {
            publish(&watch.tx, service, change.all.clone());
        }
        inner.table.insert(FastStr::new(service), change.all);
    }

    /// The endpoints currently set for `service`.
    pub fn endpoints(&self, service: &str) -> Vec<Endpoint> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).table.get(service).cloned().unwrap_or_default()
    }
}

impl std::fmt::Debug for StaticResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("StaticResolver")
            .field("closed", &inner.closed)
            .field("services", &inner.table.keys().collect::<Vec<_>>())
            .field("watched", &inner.watches.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn publish(tx: &Sender<Vec<Endpoint>>, service: &str, endpoints: Vec<Endpoint>) {
    match tx.try_broadcast(endpoints) {
        Ok(_) | Err(TrySendError::Inactive(_)) => {},
        Err(e) => tracing::warn!(service, error = %e, "failed to publish endpoints"),
    }
}

impl Resolver for StaticResolver {
    fn name(&self) -> &str {
        STATIC
    }

    fn add_watch(&self, service: &str) -> Result<EndpointsReceiver, Status> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            return Err(Status::failed_precondition("resolver is closed"));
        }
        let watch = inner.watches.entry(FastStr::new(service)).or_insert_with(|| {
            let (mut tx, rx) = broadcast(1);
            tx.set_overflow(true);
            Watch {
                tx,
                _keep: rx.deactivate(),
                watchers: 0,
            }
        });
        watch.watchers += 1;
        let rx = watch.tx.new_receiver();
        let tx = watch.tx.clone();
        if let Some(known) = inner.table.get(service) {
            publish(&tx, service, known.clone());
        }
        Ok(rx)
    }

    fn del_watch(&self, service: &str) -> Result<(), Status> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(watch) = inner.watches.get_mut(service) else {
            return Err(Status::not_found(format!("service {service:?} is not watched")));
        };
        watch.watchers -= 1;
        if watch.watchers == 0 {
            if let Some(watch) = inner.watches.remove(service) {
                watch.tx.close();
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<(), Status> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.closed = true;
        for (_, watch) in inner.watches.drain() {
            watch.tx.close();
        }
        Ok(())
    }
}
