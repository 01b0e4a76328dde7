//! DAP wire protocol codec
//!
//! The DAP protocol uses HTTP-style headers followed by JSON body:
//! ```text
//! Content-Length: <byte-length>\r\n
//! \r\n
//! <JSON body>
//! ```
//!
//! Decoding is push-based: raw bytes are appended to a [`FrameDecoder`],
//! which yields every complete frame it holds. A bad frame is reported and
//! skipped; the decoder keeps going from the next header.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::{Error, Result};

use super::types::ProtocolMessage;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Sanity check - 100MB should be plenty for any DAP message
const MAX_BODY_LEN: usize = 100 * 1024 * 1024;

/// Headers larger than this without a terminator are treated as garbage
const MAX_HEADER_LEN: usize = 8 * 1024;

/// Where the decoder is within the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    AwaitingHeader,
    AwaitingBody(usize),
}

/// Incremental frame decoder
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    state: DecodeState,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            state: DecodeState::AwaitingHeader,
        }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Bytes received but not yet consumed by a complete frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append raw bytes from the stream
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decode the next complete frame, if the buffer holds one
    ///
    /// `Some(Err(_))` reports a discarded frame; call again to continue.
    pub fn next_frame(&mut self) -> Option<Result<ProtocolMessage>> {
        loop {
            match self.state {
                DecodeState::AwaitingHeader => {
                    let Some(end) = find(&self.buf, HEADER_TERMINATOR) else {
                        if self.buf.len() > MAX_HEADER_LEN {
                            // Keep a tail in case the terminator straddles the cut
                            let keep = HEADER_TERMINATOR.len() - 1;
                            let drop = self.buf.len() - keep;
                            self.buf.advance(drop);
                            return Some(Err(Error::DapProtocol(format!(
                                "Discarded {} bytes without a frame header",
                                drop
                            ))));
                        }
                        return None;
                    };

                    let header = self.buf.split_to(end + HEADER_TERMINATOR.len());
                    match parse_content_length(&header[..end]) {
                        Ok(len) => self.state = DecodeState::AwaitingBody(len),
                        Err(e) => return Some(Err(e)),
                    }
                }
                DecodeState::AwaitingBody(len) => {
                    if self.buf.len() < len {
                        return None;
                    }
                    let body = self.buf.split_to(len);
                    self.state = DecodeState::AwaitingHeader;
                    return Some(serde_json::from_slice(&body).map_err(|e| {
                        Error::DapProtocol(format!("Invalid JSON body: {}", e))
                    }));
                }
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parse the Content-Length header, ignoring other headers (like Content-Type)
fn parse_content_length(header: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(header)
        .map_err(|_| Error::DapProtocol("Frame header is not valid UTF-8".to_string()))?;

    let value = text
        .split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("Content-Length"))
        .map(|(_, value)| value.trim())
        .ok_or_else(|| Error::DapProtocol("Missing Content-Length header".to_string()))?;

    let len: usize = value
        .parse()
        .map_err(|_| Error::DapProtocol(format!("Invalid Content-Length: {}", value)))?;

    if len > MAX_BODY_LEN {
        return Err(Error::DapProtocol(format!(
            "Content-Length too large: {} bytes",
            len
        )));
    }
    Ok(len)
}

/// Serialize a message into one complete frame
pub fn encode_message(message: &ProtocolMessage) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(message)?;
    let header = format!("Content-Length: {}\r\n\r\n", json.len());

    let mut frame = Vec::with_capacity(header.len() + json.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(&json);
    Ok(frame)
}

/// Write a DAP message to the stream
///
/// Adds the Content-Length header and writes the JSON body
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &ProtocolMessage,
) -> Result<()> {
    let frame = encode_message(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Pull-side adapter feeding a [`FrameDecoder`] from an async byte stream
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            chunk: vec![0u8; 16 * 1024],
        }
    }

    /// Read the next message
    ///
    /// Returns `Ok(None)` at end of stream. `Err(Error::DapProtocol)` reports
    /// a discarded frame and the reader stays usable; any other error is fatal.
    pub async fn read_message(&mut self) -> Result<Option<ProtocolMessage>> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return frame.map(Some);
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                if self.decoder.buffered() > 0 {
                    tracing::debug!(
                        bytes = self.decoder.buffered(),
                        "Stream ended inside a partial frame"
                    );
                }
                return Ok(None);
            }
            self.decoder.push(&self.chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dap::types::{EventMessage, RequestMessage};
    use std::io::Cursor;

    fn frame(json: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{}", json.len(), json).into_bytes()
    }

    #[test]
    fn test_decode_single_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&frame(r#"{"seq":1,"type":"request","command":"threads"}"#));

        let msg = decoder.next_frame().unwrap().unwrap();
        assert_eq!(msg.name(), "threads");
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decode_frame_split_across_reads() {
        let bytes = frame(r#"{"seq":4,"type":"event","event":"initialized"}"#);
        let mut decoder = FrameDecoder::new();

        decoder.push(&bytes[..10]);
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.state(), DecodeState::AwaitingHeader);

        decoder.push(&bytes[10..30]);
        assert!(decoder.next_frame().is_none());
        assert!(matches!(decoder.state(), DecodeState::AwaitingBody(_)));

        decoder.push(&bytes[30..]);
        let msg = decoder.next_frame().unwrap().unwrap();
        assert_eq!(msg.seq(), 4);
    }

    #[test]
    fn test_decode_multiple_frames_in_one_read() {
        let mut bytes = frame(r#"{"seq":1,"type":"event","event":"a"}"#);
        bytes.extend(frame(r#"{"seq":2,"type":"event","event":"b"}"#));
        bytes.extend(b"Content-Length: 99\r\n\r\n{\"partial");

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert_eq!(decoder.next_frame().unwrap().unwrap().name(), "a");
        assert_eq!(decoder.next_frame().unwrap().unwrap().name(), "b");
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.state(), DecodeState::AwaitingBody(99));
    }

    #[test]
    fn test_extra_headers_are_ignored() {
        let json = r#"{"seq":1,"type":"event","event":"x"}"#;
        let raw = format!(
            "Content-Type: application/json\r\ncontent-length: {}\r\n\r\n{}",
            json.len(),
            json
        );
        let mut decoder = FrameDecoder::new();
        decoder.push(raw.as_bytes());
        assert_eq!(decoder.next_frame().unwrap().unwrap().name(), "x");
    }

    #[test]
    fn test_missing_length_is_reported_and_skipped() {
        let mut bytes = b"X-Junk: 1\r\n\r\n".to_vec();
        bytes.extend(frame(r#"{"seq":5,"type":"event","event":"ok"}"#));

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert!(matches!(
            decoder.next_frame(),
            Some(Err(Error::DapProtocol(ref m))) if m.contains("Missing Content-Length")
        ));
        assert_eq!(decoder.next_frame().unwrap().unwrap().seq(), 5);
    }

    #[test]
    fn test_bad_json_body_is_reported_and_skipped() {
        let mut bytes = frame("{not json}");
        bytes.extend(frame(r#"{"seq":6,"type":"event","event":"ok"}"#));

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert!(matches!(decoder.next_frame(), Some(Err(Error::DapProtocol(_)))));
        assert_eq!(decoder.next_frame().unwrap().unwrap().seq(), 6);
    }

    #[test]
    fn test_encode_exact_bytes() {
        let msg = ProtocolMessage::Event(EventMessage {
            seq: 3,
            event: "initialized".to_string(),
            body: None,
        });
        let bytes = encode_message(&msg).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let (header, body) = text.split_once("\r\n\r\n").unwrap();
        assert_eq!(header, format!("Content-Length: {}", body.len()));
        assert!(!body.ends_with('\n'));
        let back: ProtocolMessage = serde_json::from_str(body).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_length_counts_utf8_bytes() {
        let msg = ProtocolMessage::Event(EventMessage {
            seq: 1,
            event: "output".to_string(),
            body: Some(serde_json::json!({ "output": "héllo ✓" })),
        });
        let bytes = encode_message(&msg).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), msg);
    }

    #[tokio::test]
    async fn test_frame_reader_until_eof() {
        let mut data = frame(r#"{"seq":1,"type":"request","command":"initialize"}"#);
        data.extend(frame(r#"{"seq":2,"type":"request","command":"launch"}"#));
        let mut reader = FrameReader::new(Cursor::new(data));

        assert_eq!(reader.read_message().await.unwrap().unwrap().seq(), 1);
        assert_eq!(reader.read_message().await.unwrap().unwrap().seq(), 2);
        assert!(reader.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_message() {
        let mut output = Vec::new();
        let msg = ProtocolMessage::Request(RequestMessage {
            seq: 1,
            command: "threads".to_string(),
            arguments: None,
        });
        write_message(&mut output, &msg).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        assert!(text.starts_with("Content-Length: "));
        assert!(text.ends_with("\"command\":\"threads\"}"));
    }
}
