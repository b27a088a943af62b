// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Endpoint is one network-addressable service instance.

use faststr::FastStr;
use std::collections::BTreeMap;
use std::fmt;

/// Metadata key holding the balancing weight of an endpoint.
pub const WEIGHT_KEY: &str = "weight";

const DEFAULT_SCHEME: &str = "mem";

/// One network-addressable service instance.
///
/// The address is the identity key: two endpoints with the same address are the same instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    address: FastStr,
    scheme: FastStr,
    metadata: BTreeMap<FastStr, FastStr>,
}

impl Endpoint {
    /// Creates an endpoint with the default scheme.
    pub fn new(address: impl Into<FastStr>) -> Self {
        Self {
            address: address.into(),
            scheme: FastStr::from_static_str(DEFAULT_SCHEME),
            metadata: BTreeMap::new(),
        }
    }

    /// Parses `scheme://address`; a bare address takes the default scheme.
    pub fn parse(target: &str) -> Self {
        match target.split_once("://") {
            Some((scheme, address)) => Self::new(address.to_owned()).with_scheme(scheme.to_owned()),
            None => Self::new(target.to_owned()),
        }
    }

    /// Sets the transport scheme.
    pub fn with_scheme(mut self, scheme: impl Into<FastStr>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<FastStr>, value: impl Into<FastStr>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The address, which is also the identity key.
    #[inline]
    pub fn address(&self) -> &FastStr {
        &self.address
    }

    /// The transport scheme used to reach the endpoint.
    #[inline]
    pub fn scheme(&self) -> &FastStr {
        &self.scheme
    }

    /// Free-form metadata.
    #[inline]
    pub fn metadata(&self) -> &BTreeMap<FastStr, FastStr> {
        &self.metadata
    }

    /// The balancing weight, defaulting to 1 when absent or malformed.
    pub fn weight(&self) -> u32 {
        self.metadata.get(WEIGHT_KEY).and_then(|w| w.parse().ok()).unwrap_or(1)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::Endpoint;

    #[test]
    fn test_parse_endpoint() {
        let ep = Endpoint::parse("tcp://10.0.0.1:8888");
        assert_eq!(ep.scheme().as_str(), "tcp");
        assert_eq!(ep.address().as_str(), "10.0.0.1:8888");
        let ep = Endpoint::parse("node-a");
        assert_eq!(ep.to_string(), "mem://node-a");
    }

    #[test]
    fn test_weight_defaults_to_one() {
        assert_eq!(Endpoint::new("a").weight(), 1);
        assert_eq!(Endpoint::new("a").with_metadata("weight", "5").weight(), 5);
        assert_eq!(Endpoint::new("a").with_metadata("weight", "x").weight(), 1);
    }
}
