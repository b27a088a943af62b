// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Random load balance implemention

use super::{no_endpoint, Balancer, CallInfo, PickResult, Picker, RANDOM};
use crate::endpoint::Endpoint;
use crate::status::Status;
use arc_swap::ArcSwap;
use rand::Rng;
use std::sync::Arc;

/// Picks endpoints at random, in proportion to their `weight` metadata.
#[derive(Debug, Clone)]
pub struct RandomBalancer {
    endpoints: Arc<ArcSwap<WeightedEndpoints>>,
}

impl RandomBalancer {
    /// Returns a empty [`RandomBalancer`]
    pub fn new() -> Self {
        Self {
            endpoints: Arc::new(ArcSwap::from_pointee(WeightedEndpoints::default())),
        }
    }
}

impl Default for RandomBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer for RandomBalancer {
    fn name(&self) -> &str {
        RANDOM
    }

    fn picker(&self) -> Arc<dyn Picker> {
        Arc::new(RandomPicker {
            endpoints: self.endpoints.clone(),
        })
    }

    fn update(&self, endpoints: Vec<Endpoint>) {
        self.endpoints.store(Arc::new(WeightedEndpoints::from(endpoints)));
    }

    fn close(&self) -> Result<(), Status> {
        self.endpoints.store(Arc::new(WeightedEndpoints::default()));
        Ok(())
    }
}

#[derive(Debug)]
struct RandomPicker {
    endpoints: Arc<ArcSwap<WeightedEndpoints>>,
}

impl Picker for RandomPicker {
    fn next(&self, _info: &CallInfo) -> Result<PickResult, Status> {
        let weighted = self.endpoints.load();
        if weighted.endpoints.is_empty() {
            return Err(no_endpoint());
        }
        match pick_one(weighted.sum_of_weights, &weighted.endpoints) {
            Some(ep) => Ok(PickResult::new(ep.clone())),
            None => Err(Status::unavailable("no endpoint with a positive weight")),
        }
    }
}

#[inline]
fn pick_one(sum_of_weights: u64, endpoints: &[Endpoint]) -> Option<&Endpoint> {
    if sum_of_weights == 0 {
        return None;
    }
    let mut weight = rand::thread_rng().gen_range(0..sum_of_weights);
    for ep in endpoints {
        let w = ep.weight() as u64;
        if weight < w {
            return Some(ep);
        }
        weight -= w;
    }
    None
}

#[derive(Debug, Default)]
struct WeightedEndpoints {
    sum_of_weights: u64,
    endpoints: Vec<Endpoint>,
}

impl From<Vec<Endpoint>> for WeightedEndpoints {
    fn from(endpoints: Vec<Endpoint>) -> Self {
        let sum_of_weights = endpoints.iter().map(|ep| ep.weight() as u64).sum();
        Self { sum_of_weights, endpoints }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::WEIGHT_KEY;
    use crate::status::Code;

    fn info() -> CallInfo {
        CallInfo { method: "/test.Svc/Call".into() }
    }

    #[test]
    fn test_empty_and_zero_weight() {
        let rb = RandomBalancer::new();
        assert_eq!(rb.picker().next(&info()).unwrap_err().code(), Code::Unavailable);
        rb.update(vec![Endpoint::new("a").with_metadata(WEIGHT_KEY, "0")]);
        assert_eq!(rb.picker().next(&info()).unwrap_err().code(), Code::Unavailable);
    }

    #[test]
    fn test_weights_bias_the_pick() {
        let rb = RandomBalancer::new();
        rb.update(vec![Endpoint::new("heavy").with_metadata(WEIGHT_KEY, "9"), Endpoint::new("light"), Endpoint::new("off").with_metadata(WEIGHT_KEY, "0")]);
        let picker = rb.picker();
        let mut heavy = 0;
        for _ in 0..2000 {
            let pick = picker.next(&info()).unwrap();
            assert_ne!(pick.endpoint().address().as_str(), "off");
            if pick.endpoint().address().as_str() == "heavy" {
                heavy += 1;
            }
        }
        // expected 1800
        assert!(heavy > 1500, "heavy picked {heavy} times");
    }
}
