// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Round robin load balance implemention

use super::{no_endpoint, Balancer, CallInfo, PickResult, Picker, ROUND_ROBIN};
use crate::endpoint::Endpoint;
use crate::status::Status;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Cycles through the endpoints in order.
///
/// The endpoint list is copy-on-write: [`update`](Balancer::update) swaps in a
/// new list without blocking pickers, and a pick always indexes the list it
/// loaded.
#[derive(Debug, Clone)]
pub struct RoundRobinBalancer {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    endpoints: ArcSwap<Vec<Endpoint>>,
    cursor: AtomicUsize,
}

impl RoundRobinBalancer {
    /// Returns a empty [`RoundRobinBalancer`].
    ///
    /// The cursor starts at a random offset so that clients do not all hit the
    /// first endpoint together.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                endpoints: ArcSwap::from_pointee(Vec::new()),
                cursor: AtomicUsize::new(rand::random::<u16>() as usize),
            }),
        }
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl Picker for Shared {
    fn next(&self, _info: &CallInfo) -> Result<PickResult, Status> {
        let endpoints = self.endpoints.load();
        if endpoints.is_empty() {
            return Err(no_endpoint());
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % endpoints.len();
        Ok(PickResult::new(endpoints[idx].clone()))
    }
}

impl Balancer for RoundRobinBalancer {
    fn name(&self) -> &str {
        ROUND_ROBIN
    }

    fn picker(&self) -> Arc<dyn Picker> {
        self.shared.clone()
    }

    fn update(&self, endpoints: Vec<Endpoint>) {
        self.shared.endpoints.store(Arc::new(endpoints));
    }

    fn close(&self) -> Result<(), Status> {
        self.shared.endpoints.store(Arc::new(Vec::new()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;
    use std::collections::HashMap;

    fn info() -> CallInfo {
        CallInfo { method: "/test.Svc/Call".into() }
    }

    #[test]
    fn test_empty_set_is_unavailable() {
        let rr = RoundRobinBalancer::new();
        let err = rr.picker().next(&info()).unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }

    #[test]
    fn test_sequential_picks_rotate_fairly() {
        let rr = RoundRobinBalancer::new();
        let eps: Vec<Endpoint> = ["a", "b", "c"].into_iter().map(Endpoint::new).collect();
        rr.update(eps.clone());
        let picker = rr.picker();

        let picks: Vec<String> = (0..300).map(|_| picker.next(&info()).unwrap().endpoint().address().to_string()).collect();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for p in &picks {
            *counts.entry(p.as_str()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&n| n == 100));

        // a rotation of [a, b, c] from some offset
        let start = eps.iter().position(|e| e.address().as_str() == picks[0]).unwrap();
        for (i, p) in picks.iter().enumerate() {
            assert_eq!(eps[(start + i) % 3].address().as_str(), p.as_str());
        }
    }

    #[test]
    fn test_update_is_seen_by_existing_picker() {
        let rr = RoundRobinBalancer::new();
        let picker = rr.picker();
        rr.update(vec![Endpoint::new("a")]);
        assert_eq!(picker.next(&info()).unwrap().endpoint().address().as_str(), "a");
        rr.update(vec![Endpoint::new("z")]);
        assert_eq!(picker.next(&info()).unwrap().endpoint().address().as_str(), "z");
        rr.close().unwrap();
        assert!(picker.next(&info()).is_err());
    }

    #[test]
    fn test_concurrent_picks_during_updates() {
        let rr = RoundRobinBalancer::new();
        rr.update(vec![Endpoint::new("a"), Endpoint::new("b")]);
        std::thread::scope(|s| {
            for _ in 0..4 {
                let picker = rr.picker();
                s.spawn(move || {
                    for _ in 0..1000 {
                        if let Ok(p) = picker.next(&info()) {
                            assert!(["a", "b", "c"].contains(&p.endpoint().address().as_str()));
                        }
                    }
                });
            }
            for i in 0..100 {
                let eps = if i % 2 == 0 { vec![Endpoint::new("c")] } else { vec![Endpoint::new("a"), Endpoint::new("b")] };
                rr.update(eps);
            }
        });
    }
}
