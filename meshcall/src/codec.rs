// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Message codecs, selected per stream by content-subtype.

use crate::metadata::CONTENT_TYPE_PREFIX;
use crate::status::Status;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::fmt::Debug;

/// Serde codec used to marshal messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Codec {
    /// Bincode codec using [bincode](https://docs.rs/bincode) crate.
    #[default]
    Bincode,
    /// JSON codec using [serde_json](https://docs.rs/serde_json) crate.
    Json,
}

impl Codec {
    /// The content-subtype naming this codec.
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Bincode => "bincode",
            Codec::Json => "json",
        }
    }

    /// Looks a codec up by content-subtype.
    pub fn from_content_subtype(subtype: &str) -> Option<Codec> {
        match subtype.to_ascii_lowercase().as_str() {
            "bincode" => Some(Codec::Bincode),
            "json" => Some(Codec::Json),
            _ => None,
        }
    }

    /// The full content type, e.g. `application/meshcall+json`.
    pub fn content_type(&self) -> String {
        format!("{CONTENT_TYPE_PREFIX}+{}", self.name())
    }

    /// Resolves a content type header.
    ///
    /// A bare `application/meshcall` selects the default codec; anything that is
    /// not a meshcall content type, or names an unknown subtype, yields `None`.
    pub fn from_content_type(content_type: &str) -> Option<Codec> {
        let rest = content_type.strip_prefix(CONTENT_TYPE_PREFIX)?;
        if rest.is_empty() {
            return Some(Codec::default());
        }
        match rest.strip_prefix('+').or_else(|| rest.strip_prefix(';')) {
            Some(subtype) => Self::from_content_subtype(subtype),
            None => None,
        }
    }

    /// Marshals a message.
    pub fn marshal<T: Serialize + ?Sized>(&self, msg: &T) -> Result<Bytes, Status> {
        let buf = match self {
            Codec::Bincode => bincode::serialize(msg)?,
            Codec::Json => serde_json::to_vec(msg)?,
        };
        Ok(Bytes::from(buf))
    }

    /// Unmarshals a message.
    pub fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, Status> {
        match self {
            Codec::Bincode => Ok(bincode::deserialize(data)?),
            Codec::Json => Ok(serde_json::from_slice(data)?),
        }
    }
}

/// A type-erased RPC message.
///
/// Implemented for every serializable type, so generated stubs and interceptors
/// can move requests and replies around without knowing their concrete types.
pub trait Message: Any + Send + Sync + Debug {
    /// Marshals the message with `codec`.
    fn encode(&self, codec: Codec) -> Result<Bytes, Status>;
    /// Borrows the message as [`Any`] for downcasting.
    fn as_any(&self) -> &dyn Any;
    /// Converts the boxed message into [`Any`] for downcasting.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T> Message for T
where
    T: Serialize + Any + Send + Sync + Debug,
{
    fn encode(&self, codec: Codec) -> Result<Bytes, Status> {
        codec.marshal(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Decodes a payload into a boxed message of a type fixed at the call site.
pub type Decoder = fn(Codec, &[u8]) -> Result<Box<dyn Message>, Status>;

/// The [`Decoder`] for `T`.
pub fn decode_message<T>(codec: Codec, data: &[u8]) -> Result<Box<dyn Message>, Status>
where
    T: DeserializeOwned + Message,
{
    Ok(Box::new(codec.unmarshal::<T>(data)?))
}

/// Unboxes a message into its concrete type.
pub fn downcast<T: Message>(msg: Box<dyn Message>) -> Result<T, Status> {
    msg.into_any()
        .downcast::<T>()
        .map(|b| *b)
        .map_err(|_| Status::internal(format!("message is not a {}", std::any::type_name::<T>())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        name: String,
        times: u32,
    }

    #[test]
    fn test_content_type_negotiation() {
        assert_eq!(Codec::from_content_type("application/meshcall"), Some(Codec::Bincode));
        assert_eq!(Codec::from_content_type("application/meshcall+json"), Some(Codec::Json));
        assert_eq!(Codec::from_content_type("application/meshcall;JSON"), Some(Codec::Json));
        assert_eq!(Codec::from_content_type("application/meshcall+xml"), None);
        assert_eq!(Codec::from_content_type("text/plain"), None);
        assert_eq!(Codec::from_content_type(&Codec::Json.content_type()), Some(Codec::Json));
    }

    #[test]
    fn test_erased_message_decodes_to_concrete_type() {
        for codec in [Codec::Bincode, Codec::Json] {
            let msg: Box<dyn Message> = Box::new(Greeting { name: "ann".into(), times: 2 });
            let data = msg.encode(codec).unwrap();
            let back = decode_message::<Greeting>(codec, &data).unwrap();
            assert_eq!(back.as_any().downcast_ref::<Greeting>(), Some(&Greeting { name: "ann".into(), times: 2 }));
            assert!(downcast::<Greeting>(back).is_ok());
        }
    }

    #[test]
    fn test_downcast_mismatch_is_internal() {
        let msg: Box<dyn Message> = Box::new(7u32);
        let err = downcast::<String>(msg).unwrap_err();
        assert_eq!(err.code(), crate::status::Code::Internal);
    }

    #[test]
    fn test_garbage_payload_is_internal() {
        let err = Codec::Json.unmarshal::<Greeting>(b"{not json").unwrap_err();
        assert_eq!(err.code(), crate::status::Code::Internal);
    }
}
