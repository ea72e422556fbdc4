//! Payload codecs selected by a one-word header.
//!
//! A logical channel picks its codec once (clients from their config,
//! services from the header the client sent) and keeps it for the session.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{ProtocolError, ProtocolResult};

/// Payload encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    /// Human-readable JSON, header `json`.
    #[default]
    #[serde(rename = "json")]
    Json,
    /// Compact MessagePack, header `mpack`.
    #[serde(rename = "mpack")]
    MsgPack,
}

impl Codec {
    /// Header token carried in front of encoded payloads.
    pub const fn header(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::MsgPack => "mpack",
        }
    }

    /// Header token as a frame.
    pub fn header_frame(self) -> Bytes {
        Bytes::from_static(self.header().as_bytes())
    }

    /// Resolves a header frame to its codec.
    pub fn from_header(header: &[u8]) -> ProtocolResult<Self> {
        match header {
            b"json" => Ok(Self::Json),
            b"mpack" => Ok(Self::MsgPack),
            other => Err(ProtocolError::UnknownCodec(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    /// Encodes a value. Total for any map, sequence or scalar.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> ProtocolResult<Bytes> {
        let encoded = match self {
            Self::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
            Self::MsgPack => rmp_serde::to_vec_named(value).map_err(|e| e.to_string()),
        };
        encoded
            .map(Bytes::from)
            .map_err(|message| ProtocolError::Encode {
                codec: self,
                message,
            })
    }

    /// Decodes a value, failing with [`ProtocolError::Decode`] on malformed input.
    pub fn decode<T: DeserializeOwned>(self, data: &[u8]) -> ProtocolResult<T> {
        let decoded = match self {
            Self::Json => serde_json::from_slice(data).map_err(|e| e.to_string()),
            Self::MsgPack => rmp_serde::from_slice(data).map_err(|e| e.to_string()),
        };
        decoded.map_err(|message| ProtocolError::Decode {
            codec: self,
            message,
        })
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.header())
    }
}

impl FromStr for Codec {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_header(s.trim().to_ascii_lowercase().as_bytes())
    }
}
