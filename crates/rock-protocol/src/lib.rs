//! Wire protocol shared by the rock broker, its workers and its clients.
//!
//! # Framing
//!
//! Every message on a stream is a multipart message:
//!
//! ```text
//! +---------------+-------------+----------+-------------+----------+-----
//! | total (4 BE)  | len0 (4 BE) | frame 0  | len1 (4 BE) | frame 1  | ...
//! +---------------+-------------+----------+-------------+----------+-----
//! ```
//!
//! # Envelope
//!
//! Frames follow the majordomo layout: an optional empty delimiter, a
//! protocol signature (`MDPC01` for clients, `MDPW01` for workers), then
//! either a service name (clients) or a one-byte command (workers).
//!
//! # Example
//!
//! ```rust
//! use bytes::Bytes;
//! use rock_protocol::{ClientMessage, decode_multipart, encode_multipart};
//!
//! let request = ClientMessage::new("echo", vec![Bytes::from_static(b"hi")]);
//! let wire = encode_multipart(&request.to_frames()).unwrap();
//! let frames = decode_multipart(&wire).unwrap();
//! assert_eq!(ClientMessage::parse(frames).unwrap(), request);
//! ```

mod codec;
mod endpoint;
mod envelope;
mod error;
mod framing;
mod rpc;

pub use codec::Codec;
pub use endpoint::{BoxReader, BoxWriter, Endpoint};
pub use envelope::{
    CLIENT_SIGNATURE, ClientMessage, Command, PeerKind, WORKER_SIGNATURE, WorkerMessage,
    classify,
};
pub use error::{ProtocolError, ProtocolResult};
pub use framing::{FrameReader, FrameWriter, Multipart, decode_multipart, dump, encode_multipart};
pub use rpc::{RpcRequest, decode_body, encode_body};

/// Maximum size of one multipart message on the wire (16 MiB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;
