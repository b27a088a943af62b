// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Load balancing over resolved endpoints.

mod random;
mod round_robin;

pub use random::RandomBalancer;
pub use round_robin::RoundRobinBalancer;

use crate::endpoint::Endpoint;
use crate::status::Status;
use faststr::FastStr;
use std::fmt;
use std::sync::Arc;

/// Name of the round-robin balancer.
pub const ROUND_ROBIN: &str = "round_robin";
/// Name of the weighted random balancer.
pub const RANDOM: &str = "random";

/// What a picker knows about the call it picks for.
#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Full method name.
    pub method: FastStr,
}

/// Feedback about the call an endpoint was picked for.
pub type Report = Box<dyn FnOnce(Result<(), &Status>) + Send>;

/// The result of one pick.
pub struct PickResult {
    endpoint: Endpoint,
    report: Option<Report>,
}

impl PickResult {
    /// Picks `endpoint` with no feedback.
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint, report: None }
    }

    /// Attaches a feedback callback, invoked once with the stream-open outcome.
    pub fn with_report(mut self, report: impl FnOnce(Result<(), &Status>) + Send + 'static) -> Self {
        self.report = Some(Box::new(report));
        self
    }

    /// The picked endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Reports the outcome to the balancer, if it asked for it.
    pub fn report(&mut self, outcome: Result<(), &Status>) {
        if let Some(report) = self.report.take() {
            report(outcome)
        }
    }
}

impl fmt::Debug for PickResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickResult")
            .field("endpoint", &self.endpoint)
            .field("report", &self.report.is_some())
            .finish()
    }
}

/// Chooses an endpoint per call.
pub trait Picker: Send + Sync {
    /// Picks an endpoint; fails with [`Code::Unavailable`](crate::status::Code::Unavailable) when none is usable.
    fn next(&self, info: &CallInfo) -> Result<PickResult, Status>;
}

/// A load-balancing policy.
pub trait Balancer: Send + Sync + 'static {
    /// Registered name of the policy.
    fn name(&self) -> &str;
    /// A picker over the current endpoint set.
    fn picker(&self) -> Arc<dyn Picker>;
    /// Replaces the endpoint set.
    fn update(&self, endpoints: Vec<Endpoint>);
    /// Releases the balancer's resources.
    fn close(&self) -> Result<(), Status>;
}

/// Builds a new balancer instance.
pub type BalancerBuilder = dyn Fn() -> Arc<dyn Balancer> + Send + Sync;

pub(crate) fn no_endpoint() -> Status {
    Status::unavailable("no endpoint available")
}
