//! Length-prefixed multipart framing.
//!
//! A message is a 4-byte big-endian body length followed by the body. The
//! body is a run of frames, each a 4-byte big-endian length plus that many
//! bytes. Empty frames are legal (the envelope delimiter is one); a body with
//! no frames at all is not.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_MESSAGE_SIZE;
use crate::error::{ProtocolError, ProtocolResult};

/// An ordered sequence of binary frames.
pub type Multipart = Vec<Bytes>;

const PREFIX: usize = 4;

fn body_len(frames: &[Bytes]) -> u64 {
    frames
        .iter()
        .map(|frame| (PREFIX + frame.len()) as u64)
        .sum()
}

/// Encodes frames into one wire message, length prefix included.
pub fn encode_multipart(frames: &[Bytes]) -> ProtocolResult<Vec<u8>> {
    if frames.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }

    let len = body_len(frames);
    if len > u64::from(MAX_MESSAGE_SIZE) {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut buffer = Vec::with_capacity(PREFIX + len as usize);
    buffer.put_u32(len as u32);
    for frame in frames {
        buffer.put_u32(frame.len() as u32);
        buffer.extend_from_slice(frame);
    }
    Ok(buffer)
}

/// Decodes one complete wire message (length prefix included).
pub fn decode_multipart(data: &[u8]) -> ProtocolResult<Multipart> {
    if data.len() < PREFIX {
        return Err(ProtocolError::IncompleteMessage {
            expected: PREFIX,
            received: data.len(),
        });
    }

    let len = read_u32(&data[..PREFIX]) as usize;
    if len > MAX_MESSAGE_SIZE as usize {
        return Err(ProtocolError::MessageTooLarge {
            size: len as u64,
            max: MAX_MESSAGE_SIZE,
        });
    }
    if data.len() < PREFIX + len {
        return Err(ProtocolError::IncompleteMessage {
            expected: PREFIX + len,
            received: data.len(),
        });
    }

    split_frames(Bytes::copy_from_slice(&data[PREFIX..PREFIX + len]))
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Splits a message body into frames without copying.
fn split_frames(body: Bytes) -> ProtocolResult<Multipart> {
    if body.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }

    let mut frames = Vec::new();
    let mut offset = 0;
    while offset < body.len() {
        if body.len() - offset < PREFIX {
            return Err(ProtocolError::IncompleteMessage {
                expected: offset + PREFIX,
                received: body.len(),
            });
        }
        let frame_len = read_u32(&body[offset..offset + PREFIX]) as usize;
        let start = offset + PREFIX;
        let end = start + frame_len;
        if end > body.len() {
            return Err(ProtocolError::IncompleteMessage {
                expected: end,
                received: body.len(),
            });
        }
        frames.push(body.slice(start..end));
        offset = end;
    }
    Ok(frames)
}

/// Renders frames for log output: printable text as-is, anything else as hex.
pub fn dump(frames: &[Bytes]) -> String {
    frames
        .iter()
        .map(|frame| {
            let printable = frame.iter().all(|b| (0x20..0x7f).contains(b));
            if printable {
                format!("[{:03}] {}", frame.len(), String::from_utf8_lossy(frame))
            } else {
                let hex: String = frame.iter().map(|b| format!("{b:02X}")).collect();
                format!("[{:03}] 0x{hex}", frame.len())
            }
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Reads multipart messages from an async byte stream.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wraps a reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads one message.
    ///
    /// Returns `Ok(None)` on a clean EOF before any byte of a new message.
    pub async fn read_multipart(&mut self) -> ProtocolResult<Option<Multipart>> {
        let mut len_buf = [0u8; PREFIX];
        match self.reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_MESSAGE_SIZE as usize {
            return Err(ProtocolError::MessageTooLarge {
                size: len as u64,
                max: MAX_MESSAGE_SIZE,
            });
        }
        if len == 0 {
            return Err(ProtocolError::EmptyMessage);
        }

        let mut body = BytesMut::zeroed(len);
        self.reader.read_exact(&mut body).await?;
        split_frames(body.freeze()).map(Some)
    }

    /// Unwraps the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Writes multipart messages to an async byte stream.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wraps a writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes and flushes one message.
    pub async fn write_multipart(&mut self, frames: &[Bytes]) -> ProtocolResult<()> {
        let data = encode_multipart(frames)?;
        self.writer.write_all(&data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shuts down the write half.
    pub async fn shutdown(&mut self) -> ProtocolResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Unwraps the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(parts: &[&'static [u8]]) -> Multipart {
        parts.iter().map(|p| Bytes::from_static(p)).collect()
    }

    #[test]
    fn encode_layout() {
        let bytes = encode_multipart(&frames(&[b"", b"ab"])).unwrap();
        assert_eq!(
            bytes,
            vec![0, 0, 0, 10, 0, 0, 0, 0, 0, 0, 0, 2, b'a', b'b'],
        );
    }

    #[test]
    fn encode_decode_keeps_empty_frames() {
        let message = frames(&[b"", b"MDPC01", b"echo", b"", b"payload"]);
        let decoded = decode_multipart(&encode_multipart(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn encode_rejects_no_frames() {
        assert!(matches!(
            encode_multipart(&[]),
            Err(ProtocolError::EmptyMessage)
        ));
    }

    #[test]
    fn decode_incomplete_length() {
        assert!(matches!(
            decode_multipart(&[0, 0]),
            Err(ProtocolError::IncompleteMessage { expected: 4, .. })
        ));
    }

    #[test]
    fn decode_truncated_frame() {
        // Body claims one 100-byte frame but carries 2 bytes.
        let data: Vec<u8> = vec![0, 0, 0, 6, 0, 0, 0, 100, 1, 2];
        assert!(matches!(
            decode_multipart(&data),
            Err(ProtocolError::IncompleteMessage { .. })
        ));
    }

    #[test]
    fn decode_message_too_large() {
        let data = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
        assert!(matches!(
            decode_multipart(&data),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn dump_mixes_text_and_hex() {
        let rendered = dump(&frames(&[b"", b"MDPW01", b"\x04"]));
        assert_eq!(rendered, "[000]  | [006] MDPW01 | [001] 0x04");
    }

    #[tokio::test]
    async fn reader_writer_stream() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let first = frames(&[b"", b"MDPW01", b"\x04"]);
        let second = frames(&[b"", b"MDPC01", b"echo", b"{}"]);
        writer.write_multipart(&first).await.unwrap();
        writer.write_multipart(&second).await.unwrap();
        drop(writer);

        assert_eq!(reader.read_multipart().await.unwrap(), Some(first));
        assert_eq!(reader.read_multipart().await.unwrap(), Some(second));
        assert_eq!(reader.read_multipart().await.unwrap(), None);
    }

    #[tokio::test]
    async fn reader_rejects_zero_length() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&0u32.to_be_bytes()).await.unwrap();

        let mut reader = FrameReader::new(server);
        assert!(matches!(
            reader.read_multipart().await,
            Err(ProtocolError::EmptyMessage)
        ));
    }
}
