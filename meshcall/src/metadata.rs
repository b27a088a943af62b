// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Request-scoped metadata and the call context threaded through every RPC.

use crate::status::Status;
use faststr::FastStr;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Header carrying the content type, `application/meshcall+<codec>`.
pub const CONTENT_TYPE: &str = "content-type";
/// Header naming the compressor used for messages sent on this stream.
pub const ENCODING: &str = "meshcall-encoding";
/// Header listing compressors the sender can decode.
pub const ACCEPT_ENCODING: &str = "meshcall-accept-encoding";
/// Header carrying the remaining call budget in milliseconds.
pub const TIMEOUT: &str = "meshcall-timeout";

/// Prefix of [`CONTENT_TYPE`] values.
pub const CONTENT_TYPE_PREFIX: &str = "application/meshcall";

/// An ordered multi-map of lower-cased keys to values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<FastStr, Vec<FastStr>>,
}

impl Metadata {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all values of `key` with `value`.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<FastStr>) {
        self.entries.insert(normalize(key.as_ref()), vec![value.into()]);
    }

    /// Appends `value` to the values of `key`.
    pub fn append(&mut self, key: impl AsRef<str>, value: impl Into<FastStr>) {
        self.entries.entry(normalize(key.as_ref())).or_default().push(value.into());
    }

    /// The first value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(|v| v.as_str())
    }

    /// Every value of `key`.
    pub fn get_all(&self, key: &str) -> &[FastStr] {
        let found = match self.entries.get(key) {
            Some(v) => Some(v),
            None => self.entries.get(normalize(key).as_str()),
        };
        found.map(|v| v.as_slice()).unwrap_or_default()
    }

    /// Removes `key`, returning its values.
    pub fn remove(&mut self, key: &str) -> Option<Vec<FastStr>> {
        self.entries.remove(normalize(key).as_str())
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        !self.get_all(key).is_empty()
    }

    /// Appends every entry of `other`.
    pub fn merge(&mut self, other: &Metadata) {
        for (k, vs) in &other.entries {
            self.entries.entry(k.clone()).or_default().extend(vs.iter().cloned());
        }
    }

    /// Iterates `(key, values)` in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[FastStr])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<FastStr>> FromIterator<(K, V)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut md = Metadata::new();
        for (k, v) in iter {
            md.append(k, v);
        }
        md
    }
}

fn normalize(key: &str) -> FastStr {
    if key.bytes().any(|b| b.is_ascii_uppercase()) {
        FastStr::new(key.to_ascii_lowercase())
    } else {
        FastStr::new(key)
    }
}

/// The request-scoped context of one RPC.
///
/// Carries the cancellation signal, the deadline and the metadata exchanged
/// with the peer. Metadata accessors return copies: mutations made after a read
/// are never observed by the reader.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
    outgoing: Arc<Metadata>,
    incoming: Arc<Metadata>,
    peer: Option<FastStr>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}

impl CallContext {
    /// A context with no deadline and no metadata.
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
            outgoing: Default::default(),
            incoming: Default::default(),
            peer: None,
        }
    }

    /// Derives a context whose cancellation follows this one but can also be cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    /// Tightens the deadline to at most `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Tightens the deadline to at most `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(d) if d < deadline => d,
            _ => deadline,
        });
        self
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Cancels this context and every child.
    pub fn cancel(&self) {
        self.cancel.cancel()
    }

    /// The error this context has already failed with, if any.
    pub fn err(&self) -> Option<Status> {
        if self.cancel.is_cancelled() {
            return Some(Status::canceled("context canceled"));
        }
        match self.deadline {
            Some(d) if d <= Instant::now() => Some(Status::deadline_exceeded("context deadline exceeded")),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> Status {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => Status::canceled("context canceled"),
                _ = tokio::time::sleep_until(deadline) => Status::deadline_exceeded("context deadline exceeded"),
            },
            None => {
                self.cancel.cancelled().await;
                Status::canceled("context canceled")
            },
        }
    }

    /// A copy of the metadata to send to the peer.
    pub fn outgoing_metadata(&self) -> Metadata {
        Metadata::clone(&self.outgoing)
    }

    /// Replaces the metadata to send to the peer.
    pub fn with_outgoing_metadata(mut self, md: Metadata) -> Self {
        self.outgoing = Arc::new(md);
        self
    }

    /// Appends one outgoing entry.
    pub fn append_outgoing(&mut self, key: impl AsRef<str>, value: impl Into<FastStr>) {
        Arc::make_mut(&mut self.outgoing).append(key, value);
    }

    /// A copy of the metadata received from the peer.
    pub fn incoming_metadata(&self) -> Metadata {
        Metadata::clone(&self.incoming)
    }

    pub(crate) fn with_incoming_metadata(mut self, md: Metadata) -> Self {
        self.incoming = Arc::new(md);
        self
    }

    /// The remote address, on the server side.
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub(crate) fn with_peer(mut self, peer: FastStr) -> Self {
        self.peer = Some(peer);
        self
    }
}

/// Encodes a timeout for the [`TIMEOUT`] header.
pub fn encode_timeout(timeout: Duration) -> String {
    // round up so a sub-millisecond budget is not sent as zero
    let ms = timeout.as_micros().div_ceil(1000);
    ms.to_string()
}

/// Decodes a [`TIMEOUT`] header value.
pub fn decode_timeout(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_millis)
}
