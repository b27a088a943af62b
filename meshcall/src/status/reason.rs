// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Application-level error reasons.

use super::{Code, Detail, Status};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error as StdError;

/// The reason detail carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReasonInfo {
    /// The logical grouping the reason belongs to, e.g. `user.v1`.
    pub domain: String,
    /// Short upper snake case identity, e.g. `USER_NOT_FOUND`.
    pub reason: String,
    /// Free-form structured context.
    pub metadata: BTreeMap<String, String>,
}

/// A reason declared by the application, mapping `(domain, reason)` to a fixed code.
///
/// ```
/// use meshcall::status::{Code, Reason};
///
/// const USER_NOT_FOUND: Reason = Reason::new("user.v1", "USER_NOT_FOUND", Code::NotFound);
///
/// let st = USER_NOT_FOUND.status("no user 7");
/// assert_eq!(st.code(), Code::NotFound);
/// assert!(USER_NOT_FOUND.matches(&st));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reason {
    domain: &'static str,
    reason: &'static str,
    code: Code,
}

impl Reason {
    /// Declares a reason.
    pub const fn new(domain: &'static str, reason: &'static str, code: Code) -> Self {
        Self { domain, reason, code }
    }

    /// The reason's domain.
    pub const fn domain(&self) -> &'static str {
        self.domain
    }

    /// The reason's short name.
    pub const fn reason(&self) -> &'static str {
        self.reason
    }

    /// The code this reason maps to.
    pub const fn code(&self) -> Code {
        self.code
    }

    /// Builds a status carrying this reason.
    pub fn status(&self, message: impl Into<faststr::FastStr>) -> Status {
        self.status_with_metadata(message, BTreeMap::new())
    }

    /// Builds a status carrying this reason and extra metadata.
    pub fn status_with_metadata(&self, message: impl Into<faststr::FastStr>, metadata: BTreeMap<String, String>) -> Status {
        Status::new(self.code, message).with_details([Detail::Reason(ReasonInfo {
            domain: self.domain.to_owned(),
            reason: self.reason.to_owned(),
            metadata,
        })])
    }

    /// Whether `status` carries this reason.
    pub fn matches(&self, status: &Status) -> bool {
        status.reason().map_or(false, |r| r.domain == self.domain && r.reason == self.reason)
    }
}

/// Whether `err` carries any of the given reasons.
pub fn is_reason(err: &(dyn StdError + 'static), reasons: &[Reason]) -> bool {
    let st = Status::from_error(err);
    reasons.iter().any(|r| r.matches(&st))
}
