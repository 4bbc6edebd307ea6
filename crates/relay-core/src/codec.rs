//! Streaming encoder/decoder for the wire message `[span, type, args, header?]`.
//!
//! There is no length prefix: MessagePack values self-delimit, so the
//! decoder's job is "attempt to consume one complete top-level value from an
//! append-only buffer", not "read N bytes then parse". [`Decoder::decode_next`]
//! is written around that: it hands `rmpv::decode::read_value` a cursor over
//! the buffered bytes and inspects whether the failure means "incomplete" or
//! "garbage", since `rmpv` surfaces both as I/O errors from its internal
//! reader and the difference only shows up in the error's `io::ErrorKind`.

use std::io::{self, Cursor};

use bytes::{Buf, BytesMut};
use rmpv::Value;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::ProtocolError;

/// Encodes `(span, message_type, args)` as a MessagePack array.
///
/// `args` is serialized as-is — callers pass a tuple (or any `Serialize`
/// sequence) and it becomes the third element of the wire array, matching
/// `[span, type, [args...]]` from the wire format.
pub fn encode<T: Serialize>(span: u64, message_type: u64, args: &T) -> Result<Vec<u8>, ProtocolError> {
    rmp_serde::to_vec(&(span, message_type, args)).map_err(|source| ProtocolError::Encode {
        message_type,
        source,
    })
}

/// A decoded, fully-owned wire message.
///
/// `rmpv::Value` owns its strings and byte arrays once decoded, so — unlike
/// the zero-copy `msgpack::object` this type is descended from — there is no
/// need to separately retain the raw frame bytes to keep the parsed view
/// valid; dropping the input buffer after a successful decode is always
/// safe.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    span: u64,
    message_type: u64,
    args: Value,
    header: Vec<(Vec<u8>, Vec<u8>)>,
}

impl DecodedMessage {
    pub fn span(&self) -> u64 {
        self.span
    }

    pub fn message_type(&self) -> u64 {
        self.message_type
    }

    /// The decoded `args` array, as a zero-indexed MessagePack value.
    pub fn args(&self) -> &Value {
        &self.args
    }

    /// Looks up a header entry by key. Headers are carried for the sake of
    /// in-tree consumers that read them (e.g. the worker's invocation
    /// headers accessor); nothing in this runtime writes them, per the
    /// design note that only the read path is required.
    pub fn get_header(&self, key: &[u8]) -> Option<&[u8]> {
        self.header
            .iter()
            .find(|(k, _)| k.as_slice() == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Deserializes `args[n]` into `T`. Every message variant in this
    /// runtime carries exactly one logical payload per slot in `args`
    /// (`args[0]` for a single-value variant, `args[0]` and `args[1]` for a
    /// two-field variant such as `terminate(code, reason)`), so callers
    /// index directly rather than deserializing the whole array as a tuple.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, ProtocolError> {
        let elements = self.args_slice()?;
        let value = elements.get(index).ok_or_else(|| ProtocolError::PayloadDecode {
            message_type: self.message_type,
            reason: format!("args has no element {index}"),
        })?;
        rmpv::ext::from_value(value.clone()).map_err(|err| ProtocolError::PayloadDecode {
            message_type: self.message_type,
            reason: err.to_string(),
        })
    }

    pub fn arg_count(&self) -> usize {
        self.args_slice().map(<[Value]>::len).unwrap_or(0)
    }

    fn args_slice(&self) -> Result<&[Value], ProtocolError> {
        self.args.as_array().map(Vec::as_slice).ok_or_else(|| ProtocolError::FrameFormat(
            "args must be a MessagePack array".to_string(),
        ))
    }

    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let elements = value
            .as_array()
            .ok_or_else(|| ProtocolError::FrameFormat("top-level value must be an array".to_string()))?;
        if elements.len() < 3 {
            return Err(ProtocolError::FrameFormat(format!(
                "expected at least 3 elements, got {}",
                elements.len()
            )));
        }
        let span = elements[0]
            .as_u64()
            .ok_or_else(|| ProtocolError::FrameFormat("span must be a u64".to_string()))?;
        let message_type = elements[1]
            .as_u64()
            .ok_or_else(|| ProtocolError::FrameFormat("type must be a u64".to_string()))?;
        if !elements[2].is_array() {
            return Err(ProtocolError::FrameFormat("args must be an array".to_string()));
        }
        let args = elements[2].clone();
        let header = match elements.get(3) {
            Some(Value::Array(entries)) => entries
                .iter()
                .filter_map(|entry| {
                    let pair = entry.as_array()?;
                    let key = pair.first()?.as_slice()?.to_vec();
                    let val = pair.get(1)?.as_slice()?.to_vec();
                    Some((key, val))
                })
                .collect(),
            _ => Vec::new(),
        };
        Ok(Self {
            span,
            message_type,
            args,
            header,
        })
    }
}

/// Incremental decoder over an append-only byte buffer.
///
/// Reused across reads from the socket: [`Decoder::feed`] appends whatever
/// the transport just produced, and [`Decoder::decode_next`] is called in a
/// loop until it returns `Ok(None)`, at which point the caller goes back to
/// reading more bytes from the socket.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempts to consume one complete top-level MessagePack value.
    ///
    /// Returns `Ok(None)` if the buffer does not yet hold a complete value
    /// (the buffer is left untouched, regardless of where the prefix was cut
    /// — feeding the remaining bytes later always resumes cleanly); `Err` is
    /// fatal and the caller must terminate the session.
    pub fn decode_next(&mut self) -> Result<Option<DecodedMessage>, ProtocolError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let mut cursor = Cursor::new(&self.buf[..]);
        match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => {
                let consumed = cursor.position() as usize;
                let message = DecodedMessage::from_value(value)?;
                self.buf.advance(consumed);
                Ok(Some(message))
            }
            Err(err) => {
                if is_incomplete(&err) {
                    Ok(None)
                } else {
                    Err(ProtocolError::Parse(err.to_string()))
                }
            }
        }
    }
}

fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    io_source(err)
        .map(|io_err| io_err.kind() == io::ErrorKind::UnexpectedEof)
        .unwrap_or(false)
}

fn io_source(err: &rmpv::decode::Error) -> Option<&io::Error> {
    match err {
        rmpv::decode::Error::InvalidMarkerRead(e) => Some(e),
        rmpv::decode::Error::InvalidDataRead(e) => Some(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_span_type_and_args() {
        let bytes = encode(7, 2, &("hello",)).unwrap();
        let mut decoder = Decoder::new();
        decoder.feed(&bytes);
        let message = decoder.decode_next().unwrap().unwrap();
        assert_eq!(message.span(), 7);
        assert_eq!(message.message_type(), 2);
        let value: String = message.arg(0).unwrap();
        assert_eq!(value, "hello");
        assert!(decoder.decode_next().unwrap().is_none());
    }

    #[test]
    fn partial_prefix_reports_need_more_bytes_without_side_effects() {
        let bytes = encode(1, 0, &("node",)).unwrap();
        let mut decoder = Decoder::new();
        decoder.feed(&bytes[..bytes.len() - 1]);
        assert!(decoder.decode_next().unwrap().is_none());
        decoder.feed(&bytes[bytes.len() - 1..]);
        let message = decoder.decode_next().unwrap().unwrap();
        assert_eq!(message.span(), 1);
    }

    #[test]
    fn locator_round_trip_scenario() {
        // Exact bytes for a locator resolve round trip: invoke<resolve>("node").
        let request: Vec<u8> = vec![147, 1, 0, 145, 164, b'n', b'o', b'd', b'e'];
        let mut decoder = Decoder::new();
        decoder.feed(&request);
        let message = decoder.decode_next().unwrap().unwrap();
        assert_eq!(message.span(), 1);
        assert_eq!(message.message_type(), 0);
        let name: String = message.arg(0).unwrap();
        assert_eq!(name, "node");

        let response: Vec<u8> = vec![
            147, 1, 0, 145, 146, 164, b'e', b'c', b'h', b'o', 164, b'h', b't', b't', b'p',
        ];
        let mut decoder = Decoder::new();
        decoder.feed(&response);
        let message = decoder.decode_next().unwrap().unwrap();
        let value: Vec<String> = message.arg(0).unwrap();
        assert_eq!(value, vec!["echo".to_string(), "http".to_string()]);
    }

    #[test]
    fn frame_missing_array_shape_is_a_format_error() {
        let bytes = rmp_serde::to_vec(&42u64).unwrap();
        let mut decoder = Decoder::new();
        decoder.feed(&bytes);
        assert!(matches!(
            decoder.decode_next(),
            Err(ProtocolError::FrameFormat(_))
        ));
    }
}
