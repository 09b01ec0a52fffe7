//! Stdio framing for JSON-RPC envelopes
//!
//! Two framings are spoken: one JSON document per line, or an LSP-style
//! `Content-Length: N\r\n\r\n` header followed by exactly `N` bytes of JSON.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single frame
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    #[default]
    Line,
    Length,
}

/// A decoded frame; malformed payloads are surfaced rather than ending the stream
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Value),
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct JsonRpcCodec {
    framing: Framing,
    /// Body length announced by a parsed header, awaiting its bytes
    pending_body: Option<usize>,
}

impl JsonRpcCodec {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            pending_body: None,
        }
    }

    fn parse(bytes: &[u8]) -> Frame {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => Frame::Message(value),
            Err(e) => Frame::Malformed(format!(
                "{}: {}",
                e,
                String::from_utf8_lossy(&bytes[..bytes.len().min(200)])
            )),
        }
    }

    fn decode_line(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        loop {
            let Some(newline) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_FRAME_BYTES {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
                }
                return Ok(None);
            };
            let line = src.split_to(newline + 1);
            let trimmed = trim_ascii(&line);
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(Self::parse(trimmed)));
        }
    }

    fn decode_length(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        if self.pending_body.is_none() {
            let Some(end) = find(src, HEADER_END) else {
                if src.len() > 8 * 1024 {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "header too long"));
                }
                return Ok(None);
            };
            let header = src.split_to(end + HEADER_END.len());
            let length = parse_content_length(&header)?;
            if length > MAX_FRAME_BYTES {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
            }
            self.pending_body = Some(length);
        }
        let Some(length) = self.pending_body else {
            return Ok(None);
        };
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }
        self.pending_body = None;
        let body = src.split_to(length);
        Ok(Some(Self::parse(&body)))
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_content_length(header: &[u8]) -> io::Result<usize> {
    let text = std::str::from_utf8(header)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "header is not UTF-8"))?;
    text.split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing Content-Length"))
}

impl Decoder for JsonRpcCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        match self.framing {
            Framing::Line => self.decode_line(src),
            Framing::Length => self.decode_length(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        // A final line without a trailing newline still counts
        if self.framing == Framing::Line {
            let rest = src.split_to(src.len());
            let trimmed = trim_ascii(&rest);
            if !trimmed.is_empty() {
                return Ok(Some(Self::parse(trimmed)));
            }
        } else {
            src.advance(src.len());
        }
        Ok(None)
    }
}

impl Encoder<Value> for JsonRpcCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> io::Result<()> {
        let body = serde_json::to_vec(&item)?;
        match self.framing {
            Framing::Line => {
                dst.reserve(body.len() + 1);
                dst.put_slice(&body);
                dst.put_u8(b'\n');
            }
            Framing::Length => {
                let header = format!("Content-Length: {}\r\n\r\n", body.len());
                dst.reserve(header.len() + body.len());
                dst.put_slice(header.as_bytes());
                dst.put_slice(&body);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_all(codec: &mut JsonRpcCodec, buf: &mut BytesMut) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn test_line_framing_handles_partial_input() {
        let mut codec = JsonRpcCodec::new(Framing::Line);
        let mut buf = BytesMut::from(&b"{\"id\":1}\n\n{\"id\""[..]);
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames, vec![Frame::Message(json!({"id": 1}))]);

        buf.extend_from_slice(b":2}\r\n");
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames, vec![Frame::Message(json!({"id": 2}))]);
    }

    #[test]
    fn test_malformed_line_does_not_stop_decoding() {
        let mut codec = JsonRpcCodec::new(Framing::Line);
        let mut buf = BytesMut::from(&b"not json\n{\"ok\":true}\n"[..]);
        let frames = decode_all(&mut codec, &mut buf);
        assert!(matches!(frames[0], Frame::Malformed(_)));
        assert_eq!(frames[1], Frame::Message(json!({"ok": true})));
    }

    #[test]
    fn test_length_framing_round_trip() {
        let mut codec = JsonRpcCodec::new(Framing::Length);
        let mut buf = BytesMut::new();
        codec.encode(json!({"method": "ping"}), &mut buf).unwrap();
        assert!(buf.starts_with(b"Content-Length: 17\r\n\r\n"));

        // feed it back one byte at a time
        let bytes = buf.split();
        let mut input = BytesMut::new();
        let mut frames = Vec::new();
        for b in bytes.iter() {
            input.put_u8(*b);
            if let Some(frame) = codec.decode(&mut input).unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![Frame::Message(json!({"method": "ping"}))]);
    }

    #[test]
    fn test_missing_content_length_is_error() {
        let mut codec = JsonRpcCodec::new(Framing::Length);
        let mut buf = BytesMut::from(&b"X-Other: 1\r\n\r\n{}"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_trailing_line_at_eof() {
        let mut codec = JsonRpcCodec::new(Framing::Line);
        let mut buf = BytesMut::from(&b"{\"last\":1}"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(
            codec.decode_eof(&mut buf).unwrap(),
            Some(Frame::Message(json!({"last": 1})))
        );
    }
}
