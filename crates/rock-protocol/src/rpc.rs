//! RPC payload carried in request and reply bodies.
//!
//! A body is two frames: the codec header, then the encoded value.

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::codec::Codec;
use crate::error::{ProtocolError, ProtocolResult};

/// A method call: `{method, args}` with keyword arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl RpcRequest {
    /// Creates a request. `null` means no arguments; any other non-object
    /// value is rejected.
    pub fn new(method: impl Into<String>, args: Value) -> ProtocolResult<Self> {
        let args = match args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            Value::Array(_) => return Err(ProtocolError::InvalidArgs("array")),
            Value::String(_) => return Err(ProtocolError::InvalidArgs("string")),
            Value::Number(_) => return Err(ProtocolError::InvalidArgs("number")),
            Value::Bool(_) => return Err(ProtocolError::InvalidArgs("bool")),
        };
        Ok(Self {
            method: method.into(),
            args,
        })
    }
}

/// Encodes a value as `[header, payload]` body frames.
pub fn encode_body<T: Serialize + ?Sized>(codec: Codec, value: &T) -> ProtocolResult<Vec<Bytes>> {
    Ok(vec![codec.header_frame(), codec.encode(value)?])
}

/// Decodes `[header, payload]` body frames, returning the codec the peer used.
pub fn decode_body<T: DeserializeOwned>(body: &[Bytes]) -> ProtocolResult<(Codec, T)> {
    let header = body.first().ok_or(ProtocolError::MissingFrame("codec header"))?;
    let codec = Codec::from_header(header)?;
    let payload = body.get(1).ok_or(ProtocolError::MissingFrame("payload"))?;
    Ok((codec, codec.decode(payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_body_in_both_codecs() {
        let request = RpcRequest::new("add", json!({"a": 1, "b": [true, null]})).unwrap();
        for codec in [Codec::Json, Codec::MsgPack] {
            let body = encode_body(codec, &request).unwrap();
            assert_eq!(body[0], codec.header_frame());
            let (seen, decoded): (Codec, RpcRequest) = decode_body(&body).unwrap();
            assert_eq!(seen, codec);
            assert_eq!(decoded, request);
        }
    }

    #[test]
    fn missing_args_default_to_empty() {
        let body = vec![
            Codec::Json.header_frame(),
            Bytes::from_static(br#"{"method":"info"}"#),
        ];
        let (_, request): (_, RpcRequest) = decode_body(&body).unwrap();
        assert_eq!(request.method, "info");
        assert!(request.args.is_empty());
    }

    #[test]
    fn null_args_mean_none() {
        assert!(RpcRequest::new("ping", Value::Null).unwrap().args.is_empty());
    }

    #[test]
    fn non_object_args_are_rejected() {
        assert!(matches!(
            RpcRequest::new("ping", json!([1, 2])),
            Err(ProtocolError::InvalidArgs("array"))
        ));
        assert!(matches!(
            RpcRequest::new("ping", json!(7)),
            Err(ProtocolError::InvalidArgs("number"))
        ));
    }

    #[test]
    fn decode_body_errors() {
        assert!(matches!(
            decode_body::<Value>(&[]),
            Err(ProtocolError::MissingFrame("codec header"))
        ));
        assert!(matches!(
            decode_body::<Value>(&[Codec::Json.header_frame()]),
            Err(ProtocolError::MissingFrame("payload"))
        ));
        assert!(matches!(
            decode_body::<Value>(&[Bytes::from_static(b"xml"), Bytes::new()]),
            Err(ProtocolError::UnknownCodec(_))
        ));
        assert!(matches!(
            decode_body::<Value>(&[Codec::Json.header_frame(), Bytes::from_static(b"{")]),
            Err(ProtocolError::Decode { .. })
        ));
    }
}
