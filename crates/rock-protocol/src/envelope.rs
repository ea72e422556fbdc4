//! Broker envelope: signatures, commands and message layouts.
//!
//! ```text
//! client -> broker   "" | MDPC01 | service | body...
//! broker -> client   "" | MDPC01 | service | body...
//! worker -> broker   "" | MDPW01 | READY     | service
//!                    "" | MDPW01 | REPLY     | client | "" | body...
//!                    "" | MDPW01 | HEARTBEAT
//!                    "" | MDPW01 | DISCONNECT
//! broker -> worker   "" | MDPW01 | REQUEST   | client | "" | body...
//!                    "" | MDPW01 | HEARTBEAT
//!                    "" | MDPW01 | DISCONNECT
//! ```
//!
//! The leading empty delimiter is optional when parsing.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;

use crate::error::{ProtocolError, ProtocolResult};
use crate::framing::Multipart;

/// Client-side protocol signature, majordomo client v0.1.
pub const CLIENT_SIGNATURE: &[u8] = b"MDPC01";

/// Worker-side protocol signature, majordomo worker v0.1.
pub const WORKER_SIGNATURE: &[u8] = b"MDPW01";

/// Worker control commands. Fixed single-byte tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Ready = 0x01,
    Request = 0x02,
    Reply = 0x03,
    Heartbeat = 0x04,
    Disconnect = 0x05,
}

impl Command {
    /// The command byte.
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// The command as a one-byte frame.
    pub fn frame(self) -> Bytes {
        Bytes::copy_from_slice(&[self.as_byte()])
    }

    /// Parses a command frame.
    pub fn from_frame(frame: &[u8]) -> ProtocolResult<Self> {
        match frame {
            [0x01] => Ok(Self::Ready),
            [0x02] => Ok(Self::Request),
            [0x03] => Ok(Self::Reply),
            [0x04] => Ok(Self::Heartbeat),
            [0x05] => Ok(Self::Disconnect),
            other => Err(ProtocolError::UnknownCommand(other.to_vec())),
        }
    }

    /// Upper-case command name, for logs.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Request => "REQUEST",
            Self::Reply => "REPLY",
            Self::Heartbeat => "HEARTBEAT",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which side of the broker a message came from, by signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    Client,
    Worker,
}

/// Classifies a message by its signature frame.
pub fn classify(frames: &[Bytes]) -> ProtocolResult<PeerKind> {
    let signature = match frames.first() {
        Some(first) if first.is_empty() => frames.get(1),
        first => first,
    }
    .ok_or(ProtocolError::MissingFrame("signature"))?;

    match signature.as_ref() {
        CLIENT_SIGNATURE => Ok(PeerKind::Client),
        WORKER_SIGNATURE => Ok(PeerKind::Worker),
        other => Err(ProtocolError::InvalidSignature {
            expected: "MDPC01 or MDPW01",
            found: String::from_utf8_lossy(other).into_owned(),
        }),
    }
}

/// Frame cursor shared by the parsers.
struct Frames(VecDeque<Bytes>);

impl Frames {
    fn new(frames: Multipart) -> Self {
        let mut frames = VecDeque::from(frames);
        if frames.front().is_some_and(|f| f.is_empty()) {
            frames.pop_front();
        }
        Self(frames)
    }

    fn next(&mut self, what: &'static str) -> ProtocolResult<Bytes> {
        self.0.pop_front().ok_or(ProtocolError::MissingFrame(what))
    }

    fn signature(&mut self, expected: &'static [u8]) -> ProtocolResult<()> {
        let found = self.next("signature")?;
        if found.as_ref() != expected {
            return Err(ProtocolError::InvalidSignature {
                expected: if expected == CLIENT_SIGNATURE {
                    "MDPC01"
                } else {
                    "MDPW01"
                },
                found: String::from_utf8_lossy(&found).into_owned(),
            });
        }
        Ok(())
    }

    fn service(&mut self) -> ProtocolResult<String> {
        let frame = self.next("service")?;
        if frame.is_empty() {
            return Err(ProtocolError::malformed("empty service name"));
        }
        String::from_utf8(frame.to_vec()).map_err(|_| ProtocolError::InvalidServiceName)
    }

    /// Reads `client | "" ` and returns the client identity.
    fn correlation(&mut self) -> ProtocolResult<Bytes> {
        let client = self.next("client identity")?;
        if client.is_empty() {
            return Err(ProtocolError::malformed("empty client identity"));
        }
        let delimiter = self.next("delimiter")?;
        if !delimiter.is_empty() {
            return Err(ProtocolError::malformed(
                "expected empty frame after client identity",
            ));
        }
        Ok(client)
    }

    fn rest(self) -> Vec<Bytes> {
        self.0.into()
    }
}

/// A client request or a reply routed back to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    /// Service name.
    pub service: String,
    /// Payload frames.
    pub body: Vec<Bytes>,
}

impl ClientMessage {
    /// Creates a client message.
    pub fn new(service: impl Into<String>, body: Vec<Bytes>) -> Self {
        Self {
            service: service.into(),
            body,
        }
    }

    /// Wire frames, delimiter first.
    pub fn to_frames(&self) -> Multipart {
        let mut frames = Vec::with_capacity(3 + self.body.len());
        frames.push(Bytes::new());
        frames.push(Bytes::from_static(CLIENT_SIGNATURE));
        frames.push(Bytes::copy_from_slice(self.service.as_bytes()));
        frames.extend(self.body.iter().cloned());
        frames
    }

    /// Parses and validates a client-side message.
    pub fn parse(frames: Multipart) -> ProtocolResult<Self> {
        let mut frames = Frames::new(frames);
        frames.signature(CLIENT_SIGNATURE)?;
        let service = frames.service()?;
        Ok(Self {
            service,
            body: frames.rest(),
        })
    }
}

/// A worker-side protocol message, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    /// Worker announces it serves `service`.
    Ready { service: String },
    /// Broker hands a client request to a worker.
    Request { client: Bytes, body: Vec<Bytes> },
    /// Worker answers the request it was handed.
    Reply { client: Bytes, body: Vec<Bytes> },
    /// Liveness probe.
    Heartbeat,
    /// Peer is going away.
    Disconnect,
}

impl WorkerMessage {
    /// The command this message carries.
    pub fn command(&self) -> Command {
        match self {
            Self::Ready { .. } => Command::Ready,
            Self::Request { .. } => Command::Request,
            Self::Reply { .. } => Command::Reply,
            Self::Heartbeat => Command::Heartbeat,
            Self::Disconnect => Command::Disconnect,
        }
    }

    /// Wire frames, delimiter first.
    pub fn to_frames(&self) -> Multipart {
        let mut frames = vec![
            Bytes::new(),
            Bytes::from_static(WORKER_SIGNATURE),
            self.command().frame(),
        ];
        match self {
            Self::Ready { service } => frames.push(Bytes::copy_from_slice(service.as_bytes())),
            Self::Request { client, body } | Self::Reply { client, body } => {
                frames.push(client.clone());
                frames.push(Bytes::new());
                frames.extend(body.iter().cloned());
            }
            Self::Heartbeat | Self::Disconnect => {}
        }
        frames
    }

    /// Parses and validates a worker-side message.
    ///
    /// Trailing frames after HEARTBEAT and DISCONNECT are ignored.
    pub fn parse(frames: Multipart) -> ProtocolResult<Self> {
        let mut frames = Frames::new(frames);
        frames.signature(WORKER_SIGNATURE)?;
        let command = Command::from_frame(&frames.next("command")?)?;

        match command {
            Command::Ready => Ok(Self::Ready {
                service: frames.service()?,
            }),
            Command::Request => {
                let client = frames.correlation()?;
                Ok(Self::Request {
                    client,
                    body: frames.rest(),
                })
            }
            Command::Reply => {
                let client = frames.correlation()?;
                Ok(Self::Reply {
                    client,
                    body: frames.rest(),
                })
            }
            Command::Heartbeat => Ok(Self::Heartbeat),
            Command::Disconnect => Ok(Self::Disconnect),
        }
    }
}
