//! Message codecs.
//!
//! A codec serializes typed messages to wire bytes and back. Two formats are
//! provided:
//! - [`ProtoCodec`]: binary protobuf via prost (wire name "proto")
//! - [`JsonCodec`]: JSON via serde_json (wire name "json")
//!
//! The codec's wire name is used for content-type negotiation in the form
//! `application/<name>` (unary) or `application/<protocol>+<name>` (streams).

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::RpcError;

/// Bound for messages that can travel over the wire in either format.
///
/// Generated message types satisfy this automatically: prost for the binary
/// encoding, serde for the JSON encoding.
pub trait WireMessage:
    prost::Message + Serialize + DeserializeOwned + Default + 'static
{
}

impl<T> WireMessage for T where
    T: prost::Message + Serialize + DeserializeOwned + Default + 'static
{
}

/// Defines a type that is capable of encoding and decoding messages using a
/// specific format.
///
/// Round-trip property: `decode(encode(m)) == m` for any valid message `m`.
pub trait Codec: Send + Sync {
    /// The name of the codec's format (e.g., "proto", "json"), consumed in
    /// the form of the `content-type` header.
    fn name(&self) -> &'static str;

    /// Serialize a message into the codec's format.
    fn encode<M: WireMessage>(&self, message: &M) -> Result<Bytes, RpcError>;

    /// Deserialize data in the codec's format into a typed message.
    fn decode<M: WireMessage>(&self, source: &[u8]) -> Result<M, RpcError>;
}

/// Binary protobuf codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoCodec;

impl Codec for ProtoCodec {
    fn name(&self) -> &'static str {
        "proto"
    }

    fn encode<M: WireMessage>(&self, message: &M) -> Result<Bytes, RpcError> {
        let mut buf = BytesMut::with_capacity(message.encoded_len());
        message
            .encode(&mut buf)
            .map_err(|e| RpcError::Encode(format!("protobuf encoding failed: {e}")))?;
        Ok(buf.freeze())
    }

    fn decode<M: WireMessage>(&self, source: &[u8]) -> Result<M, RpcError> {
        M::decode(source).map_err(|e| RpcError::Decode(format!("protobuf decoding failed: {e}")))
    }
}

/// JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode<M: WireMessage>(&self, message: &M) -> Result<Bytes, RpcError> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(|e| RpcError::Encode(format!("JSON encoding failed: {e}")))
    }

    fn decode<M: WireMessage>(&self, source: &[u8]) -> Result<M, RpcError> {
        serde_json::from_slice(source)
            .map_err(|e| RpcError::Decode(format!("JSON decoding failed: {e}")))
    }
}

/// The codec chosen for a client, fixed per client in its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecKind {
    /// Binary protobuf ([`ProtoCodec`]).
    #[default]
    Proto,
    /// JSON ([`JsonCodec`]).
    Json,
}

impl CodecKind {
    /// Parse a codec from its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "proto" => Some(CodecKind::Proto),
            "json" => Some(CodecKind::Json),
            _ => None,
        }
    }

    /// The wire name of the chosen codec.
    pub fn as_str(&self) -> &'static str {
        match self {
            CodecKind::Proto => ProtoCodec.name(),
            CodecKind::Json => JsonCodec.name(),
        }
    }
}

impl Codec for CodecKind {
    fn name(&self) -> &'static str {
        self.as_str()
    }

    fn encode<M: WireMessage>(&self, message: &M) -> Result<Bytes, RpcError> {
        match self {
            CodecKind::Proto => ProtoCodec.encode(message),
            CodecKind::Json => JsonCodec.encode(message),
        }
    }

    fn decode<M: WireMessage>(&self, source: &[u8]) -> Result<M, RpcError> {
        match self {
            CodecKind::Proto => ProtoCodec.decode(source),
            CodecKind::Json => JsonCodec.decode(source),
        }
    }
}
