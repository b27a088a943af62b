// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! The status model shared by every layer of meshcall.
//!
//! Every failure, whether it comes from the transport, the framing layer or the
//! application, is represented as exactly one [`Status`]. Errors that were not
//! produced by meshcall are wrapped with [`Code::Unknown`], never coerced into
//! [`Code::Ok`].

mod code;
mod reason;

pub use code::Code;
pub use reason::{is_reason, Reason, ReasonInfo};

use faststr::FastStr;
use serde::{Deserialize, Serialize};
use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Builds a [`Status`] from a code and a format string.
///
/// ```
/// use meshcall::status::Code;
/// let st = meshcall::status!(Code::NotFound, "user {} not found", 42);
/// assert_eq!(st.message(), "user 42 not found");
/// ```
#[macro_export]
macro_rules! status {
    ($code:expr, $($arg:tt)+) => {
        $crate::status::Status::errorf($code, format_args!($($arg)+))
    };
}

/// A typed attachment carried by a [`Status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Detail {
    /// Application-level error identity.
    Reason(ReasonInfo),
    /// Captured call-stack frames.
    Stack(Vec<String>),
    /// Any other payload, identified by its type name.
    Any {
        /// Name of the encoded type.
        type_name: String,
        /// Encoded value.
        value: Vec<u8>,
    },
}

/// The canonical error representation.
#[derive(Clone, thiserror::Error)]
#[error("rpc error: code = {code} desc = {message}")]
pub struct Status {
    code: Code,
    message: FastStr,
    details: Vec<Detail>,
    #[source]
    source: Option<Arc<dyn StdError + Send + Sync + 'static>>,
}

/// Status as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusWire {
    /// Numeric code.
    pub code: i32,
    /// Human readable message.
    pub message: String,
    /// Ordered details.
    pub details: Vec<Detail>,
}

impl Status {
    /// Creates a status with the given code and message.
    pub fn new(code: Code, message: impl Into<FastStr>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Vec::new(),
            source: None,
        }
    }

    /// Creates a status from preformatted arguments, see the [`status!`](crate::status!) macro.
    pub fn errorf(code: Code, args: fmt::Arguments<'_>) -> Self {
        match args.as_str() {
            Some(s) => Self::new(code, FastStr::from_static_str(s)),
            None => Self::new(code, args.to_string()),
        }
    }

    /// A status representing success.
    pub fn ok() -> Self {
        Self::new(Code::Ok, FastStr::empty())
    }

    /// Wraps an owned foreign error, keeping it as the source.
    ///
    /// A [`Code::Ok`] is degraded to [`Code::Unknown`]: a failure never reads as success.
    pub fn wrap<E>(code: Code, err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let code = if code == Code::Ok { Code::Unknown } else { code };
        Self {
            code,
            message: err.to_string().into(),
            details: Vec::new(),
            source: Some(Arc::new(err)),
        }
    }

    /// Recovers the status carried by `err`, searching its source chain.
    /// Foreign errors are wrapped as [`Code::Unknown`].
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        Self::from_error_code(err, Code::Unknown)
    }

    /// Like [`Status::from_error`], but foreign errors are wrapped with `code`.
    pub fn from_error_code(err: &(dyn StdError + 'static), code: Code) -> Self {
        if let Some(st) = find_status(err) {
            return st.clone();
        }
        let code = if code == Code::Ok { Code::Unknown } else { code };
        Self::new(code, err.to_string())
    }

    /// Like [`Status::from_error_code`], but a found status whose code is
    /// [`Code::Unknown`] is re-coded to `code`.
    pub fn cover_error(err: &(dyn StdError + 'static), code: Code) -> Self {
        let mut st = Self::from_error_code(err, code);
        if st.code == Code::Unknown && code != Code::Ok {
            st.code = code;
        }
        st
    }

    /// The status code.
    #[inline]
    pub fn code(&self) -> Code {
        self.code
    }

    /// The status message.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The HTTP status code this status maps to.
    #[inline]
    pub fn http_code(&self) -> u16 {
        self.code.http_code()
    }

    /// Whether the code is [`Code::Ok`].
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    /// The attached details in insertion order.
    pub fn details(&self) -> &[Detail] {
        &self.details
    }

    /// Appends details, preserving insertion order.
    pub fn with_details(mut self, details: impl IntoIterator<Item = Detail>) -> Self {
        self.details.extend(details);
        self
    }

    /// Captures the current call stack and attaches it as a [`Detail::Stack`].
    ///
    /// The stack is captured at most once per status.
    pub fn with_stack(mut self) -> Self {
        if self.stack().is_none() {
            self.details.push(Detail::Stack(capture_frames(Backtrace::force_capture())));
        }
        self
    }

    /// The captured stack frames, if any.
    pub fn stack(&self) -> Option<&[String]> {
        self.details.iter().find_map(|d| match d {
            Detail::Stack(frames) => Some(frames.as_slice()),
            _ => None,
        })
    }

    /// The first reason detail, if any.
    pub fn reason(&self) -> Option<&ReasonInfo> {
        self.details.iter().find_map(|d| match d {
            Detail::Reason(r) => Some(r),
            _ => None,
        })
    }

    /// Converts into the wire representation.
    pub fn to_wire(&self) -> StatusWire {
        StatusWire {
            code: self.code.as_i32(),
            message: self.message.to_string(),
            details: self.details.clone(),
        }
    }

    /// Rebuilds a status from its wire representation.
    pub fn from_wire(wire: StatusWire) -> Self {
        Self {
            code: Code::from_i32(wire.code),
            message: wire.message.into(),
            details: wire.details,
            source: None,
        }
    }
}

macro_rules! code_constructors {
    ($($(#[$doc:meta])* $name:ident => $code:ident),+ $(,)?) => {
        impl Status {
            $(
                $(#[$doc])*
                pub fn $name(message: impl Into<FastStr>) -> Self {
                    Self::new(Code::$code, message)
                }
            )+
        }
    };
}

code_constructors! {
    /// A [`Code::Canceled`] status.
    canceled => Canceled,
    /// A [`Code::Unknown`] status.
    unknown => Unknown,
    /// A [`Code::InvalidArgument`] status.
    invalid_argument => InvalidArgument,
    /// A [`Code::DeadlineExceeded`] status.
    deadline_exceeded => DeadlineExceeded,
    /// A [`Code::NotFound`] status.
    not_found => NotFound,
    /// A [`Code::ResourceExhausted`] status.
    resource_exhausted => ResourceExhausted,
    /// A [`Code::FailedPrecondition`] status.
    failed_precondition => FailedPrecondition,
    /// A [`Code::Unimplemented`] status.
    unimplemented => Unimplemented,
    /// A [`Code::Internal`] status.
    internal => Internal,
    /// A [`Code::Unavailable`] status.
    unavailable => Unavailable,
}

/// Whether `err` carries a status with the given code.
///
/// Foreign errors count as [`Code::Unknown`].
pub fn is_code(err: &(dyn StdError + 'static), code: Code) -> bool {
    match find_status(err) {
        Some(st) => st.code == code,
        None => code == Code::Unknown,
    }
}

fn find_status<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a Status> {
    let mut cur = Some(err);
    while let Some(e) = cur {
        if let Some(st) = e.downcast_ref::<Status>() {
            return Some(st);
        }
        cur = e.source();
    }
    None
}

fn capture_frames(bt: Backtrace) -> Vec<String> {
    bt.to_string().lines().map(|l| l.trim().to_owned()).filter(|l| !l.is_empty()).collect()
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Status");
        d.field("code", &self.code).field("message", &self.message);
        if !self.details.is_empty() {
            d.field("details", &self.details);
        }
        if let Some(source) = &self.source {
            d.field("source", source);
        }
        d.finish()
    }
}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.message == other.message && self.details == other.details
    }
}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::TimedOut => Code::DeadlineExceeded,
            _ => Code::Unavailable,
        };
        Status::wrap(code, err)
    }
}

impl From<tokio::time::error::Elapsed> for Status {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Status::wrap(Code::DeadlineExceeded, err)
    }
}

impl From<bincode::Error> for Status {
    fn from(err: bincode::Error) -> Self {
        Status::wrap(Code::Internal, err)
    }
}

impl From<serde_json::Error> for Status {
    fn from(err: serde_json::Error) -> Self {
        Status::wrap(Code::Internal, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[derive(Debug, thiserror::Error)]
    #[error("disk on fire")]
    struct Foreign;

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] Status);

    #[test]
    fn test_http_code_is_projection_of_code() {
        for code in Code::ALL {
            assert_eq!(Status::new(code, "x").http_code(), code.http_code());
        }
        assert_eq!(Status::canceled("bye").http_code(), 499);
        assert_eq!(Status::not_found("x").http_code(), 404);
        assert_eq!(Status::ok().http_code(), 200);
    }

    #[test]
    fn test_foreign_errors_are_wrapped_as_unknown() {
        let st = Status::from_error(&Foreign);
        assert_eq!(st.code(), Code::Unknown);
        assert_eq!(st.message(), "disk on fire");
        assert!(!st.is_ok());

        let st = Status::from_error_code(&Foreign, Code::Ok);
        assert_eq!(st.code(), Code::Unknown);

        let st = Status::from_error_code(&Foreign, Code::DataLoss);
        assert_eq!(st.code(), Code::DataLoss);
    }

    #[test]
    fn test_status_found_through_source_chain() {
        let inner = Status::not_found("missing");
        let st = Status::from_error(&Outer(inner.clone()));
        assert_eq!(st, inner);
        assert!(is_code(&Outer(inner), Code::NotFound));
        assert!(is_code(&Foreign, Code::Unknown));
    }

    #[test]
    fn test_cover_error_recodes_unknown_only() {
        let st = Status::cover_error(&Status::unknown("?"), Code::Internal);
        assert_eq!(st.code(), Code::Internal);
        let st = Status::cover_error(&Status::not_found("x"), Code::Internal);
        assert_eq!(st.code(), Code::NotFound);
    }

    #[test]
    fn test_details_keep_insertion_order_and_stack_is_captured_once() {
        let st = Status::internal("boom")
            .with_details([Detail::Any {
                type_name: "a".into(),
                value: vec![1],
            }])
            .with_stack()
            .with_stack()
            .with_details([Detail::Any {
                type_name: "b".into(),
                value: vec![2],
            }]);
        assert_eq!(st.details().len(), 3);
        assert_matches!(&st.details()[0], Detail::Any { type_name, .. } if type_name == "a");
        assert_matches!(&st.details()[1], Detail::Stack(_));
        assert_matches!(&st.details()[2], Detail::Any { type_name, .. } if type_name == "b");
    }

    #[test]
    fn test_wire_round_trip_degrades_unknown_codes() {
        let st = Status::unavailable("down").with_stack();
        assert_eq!(Status::from_wire(st.to_wire()), st);
        let st = Status::from_wire(StatusWire {
            code: 99,
            message: "odd".into(),
            details: vec![],
        });
        assert_eq!(st.code(), Code::Unknown);
        assert_eq!(st.http_code(), 500);
    }

    #[test]
    fn test_status_macro() {
        let st = crate::status!(Code::Aborted, "conflict on {}", "k1");
        assert_eq!(st.code(), Code::Aborted);
        assert_eq!(st.message(), "conflict on k1");
        assert_eq!(st.to_string(), "rpc error: code = ABORTED desc = conflict on k1");
    }

    #[test]
    fn test_io_errors_map_to_transport_codes() {
        let st: Status = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert_eq!(st.code(), Code::Unavailable);
        assert!(st.source().is_some());
        let st: Status = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(st.code(), Code::DeadlineExceeded);
    }

    #[test]
    fn test_codec_errors_keep_their_source() {
        let bin: Status = bincode::deserialize::<String>(&[1]).unwrap_err().into();
        let json: Status = serde_json::from_slice::<String>(b"{").unwrap_err().into();
        for st in [bin, json] {
            assert_eq!(st.code(), Code::Internal);
            let source = st.source().expect("codec error kept as source");
            assert_eq!(source.to_string(), st.message());
        }
    }
}
