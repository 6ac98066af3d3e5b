//! Envelope types and incremental framing.
//!
//! Every request and response is a single self-delimited JSON document. Transports
//! may fragment (or coalesce) documents arbitrarily, so [`FrameDecoder`] accumulates
//! bytes and yields a value only once a syntactically complete document is buffered.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;

/// Protocol version written into every response envelope.
pub const PROTOCOL_VERSION: &str = "1.0";

/// A request envelope: `{ version, method, params, id }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub version: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Value, id: impl Into<Value>) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            method: method.into(),
            params,
            id: id.into(),
        }
    }

    /// Validate a decoded JSON document as a request envelope.
    ///
    /// On failure the request `id` is still recovered (or `null`) so the error
    /// envelope can echo it.
    pub fn from_value(value: Value) -> std::result::Result<Self, (Value, RpcError)> {
        let id = value.get("id").cloned().unwrap_or(Value::Null);

        let Value::Object(mut obj) = value else {
            return Err((id, RpcError::InvalidRequest("envelope must be a JSON object".into())));
        };

        let version = match obj.remove("version") {
            Some(Value::String(v)) => v,
            Some(_) => {
                return Err((id, RpcError::InvalidRequest("version must be a string".into())))
            }
            None => return Err((id, RpcError::InvalidRequest("missing version".into()))),
        };
        if !is_supported_version(&version) {
            return Err((id, RpcError::UnsupportedVersion(version)));
        }

        let method = match obj.remove("method") {
            Some(Value::String(m)) if !m.is_empty() => m,
            Some(_) => {
                return Err((
                    id,
                    RpcError::InvalidRequest("method must be a non-empty string".into()),
                ))
            }
            None => return Err((id, RpcError::InvalidRequest("missing method".into()))),
        };

        let params = match obj.remove("params") {
            None | Some(Value::Null) => Value::Object(Default::default()),
            Some(p) => p,
        };

        Ok(Self {
            version,
            method,
            params,
            id,
        })
    }
}

/// A response envelope. Exactly one of `result` and `error` is meaningful;
/// the presence of `error` decides which.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default)]
    pub id: Value,
}

/// The `error` member of an error envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, err: &RpcError) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            result: None,
            error: Some(ErrorBody {
                code: err.code().as_str().to_string(),
                message: err.to_string(),
                data: err.data(),
            }),
            id,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Error code, if this is an error envelope.
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

fn is_supported_version(version: &str) -> bool {
    version.split('.').next() == Some("1")
}

/// Serialize an envelope as one JSON document followed by a newline.
pub fn encode<T: Serialize>(envelope: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(envelope)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Why the decoder rejected buffered input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The next document is not valid JSON. The buffer is discarded.
    Malformed(String),
    /// A document grew beyond the frame limit.
    TooLarge { limit: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(reason) => write!(f, "{reason}"),
            Self::TooLarge { limit } => write!(f, "frame exceeds {limit} bytes"),
        }
    }
}

impl From<FrameError> for RpcError {
    fn from(err: FrameError) -> Self {
        RpcError::Parse(err.to_string())
    }
}

/// Accumulates bytes from a stream and yields complete JSON documents.
///
/// Boundaries are found by a byte scanner that remembers where it stopped,
/// so each pushed byte is looked at once. `serde_json` only sees a document
/// after its closing byte has arrived.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_bytes: usize,
    scan: ScanState,
}

/// Progress through the document at the front of the buffer.
#[derive(Debug, Default)]
struct ScanState {
    /// Bytes of the current document already scanned. Zero means no document
    /// has started yet.
    offset: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
    /// The document is a bare number or literal, which ends at a delimiter.
    bare: bool,
}

impl ScanState {
    /// Scan `buf` from where the last call stopped. Returns the length of the
    /// first document once its last byte is present.
    fn advance(&mut self, buf: &[u8]) -> Option<usize> {
        let &first = buf.first()?;
        if self.offset == 0 {
            match first {
                b'{' | b'[' => self.depth = 1,
                b'"' => self.in_string = true,
                // Cannot start a document; hand the byte to the parser for the error.
                b'}' | b']' | b',' | b':' => return Some(1),
                _ => self.bare = true,
            }
            self.offset = 1;
        }

        for (i, &b) in buf.iter().enumerate().skip(self.offset) {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                    if self.depth == 0 {
                        return Some(i + 1);
                    }
                }
            } else if self.bare {
                if b.is_ascii_whitespace() || b"{}[],:\"".contains(&b) {
                    return Some(i);
                }
            } else {
                match b {
                    b'"' => self.in_string = true,
                    b'{' | b'[' => self.depth += 1,
                    b'}' | b']' => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            return Some(i + 1);
                        }
                    }
                    _ => {}
                }
            }
        }
        self.offset = buf.len();
        None
    }
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_bytes,
            scan: ScanState::default(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete document, or `Ok(None)` if more bytes are needed.
    pub fn next_frame(&mut self) -> std::result::Result<Option<Value>, FrameError> {
        if self.scan.offset == 0 {
            let Some(start) = self.buf.iter().position(|b| !b.is_ascii_whitespace()) else {
                self.buf.clear();
                return Ok(None);
            };
            self.buf.drain(..start);
        }

        let Some(end) = self.scan.advance(&self.buf) else {
            if self.scan.offset > self.max_frame_bytes {
                return Err(self.discard_oversized());
            }
            return Ok(None);
        };
        if end > self.max_frame_bytes {
            return Err(self.discard_oversized());
        }

        let parsed = serde_json::from_slice::<Value>(&self.buf[..end]);
        self.scan = ScanState::default();
        match parsed {
            Ok(value) => {
                self.buf.drain(..end);
                Ok(Some(value))
            }
            Err(e) => {
                self.buf.clear();
                Err(FrameError::Malformed(e.to_string()))
            }
        }
    }

    fn discard_oversized(&mut self) -> FrameError {
        self.buf.clear();
        self.scan = ScanState::default();
        FrameError::TooLarge {
            limit: self.max_frame_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fragmented_envelope_is_buffered_until_complete() {
        let bytes = encode(&Request::new("ping", json!({}), 7)).unwrap();
        let mut decoder = FrameDecoder::new(1024);

        let (head, tail) = bytes.split_at(bytes.len() / 2);
        decoder.push(head);
        assert_eq!(decoder.next_frame().unwrap(), None);

        decoder.push(tail);
        let value = decoder.next_frame().unwrap().unwrap();
        assert_eq!(value["method"], "ping");
        assert_eq!(value["id"], 7);
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn coalesced_envelopes_come_out_in_order() {
        let mut decoder = FrameDecoder::new(1024);
        decoder.push(br#"{"id":1}{"id":2}
 {"id":3"#);

        assert_eq!(decoder.next_frame().unwrap().unwrap()["id"], 1);
        assert_eq!(decoder.next_frame().unwrap().unwrap()["id"], 2);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.push(b"}");
        assert_eq!(decoder.next_frame().unwrap().unwrap()["id"], 3);
    }

    #[test]
    fn garbage_is_rejected_and_discarded() {
        let mut decoder = FrameDecoder::new(1024);
        decoder.push(b"{\"id\": ]");
        assert!(matches!(decoder.next_frame(), Err(FrameError::Malformed(_))));
        assert_eq!(decoder.buffered(), 0);

        decoder.push(br#"{"id":4}"#);
        assert_eq!(decoder.next_frame().unwrap().unwrap()["id"], 4);
    }

    #[test]
    fn oversized_partial_frame_is_rejected() {
        let mut decoder = FrameDecoder::new(16);
        decoder.push(br#"{"content": "aaaaaaaaaaaaaaaaaaaaaaaa"#);
        assert_eq!(
            decoder.next_frame(),
            Err(FrameError::TooLarge { limit: 16 })
        );
    }

    #[test]
    fn large_frame_in_small_chunks_is_scanned_once() {
        let content = "x".repeat(2 * 1024 * 1024);
        let bytes = encode(&Request::new(
            "storeKnowledge",
            json!({"content": content, "domain": "bulk"}),
            11,
        ))
        .unwrap();
        let mut decoder = FrameDecoder::new(bytes.len());

        let chunks: Vec<&[u8]> = bytes.chunks(4096).collect();
        let (last, head) = chunks.split_last().unwrap();
        for chunk in head {
            decoder.push(chunk);
            assert_eq!(decoder.next_frame().unwrap(), None);
            assert_eq!(decoder.scan.offset, decoder.buffered());
        }
        decoder.push(last);
        let value = decoder.next_frame().unwrap().unwrap();
        assert_eq!(value["id"], 11);
        assert_eq!(value["params"]["content"].as_str().map(str::len), Some(content.len()));
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn brackets_and_quotes_inside_strings_do_not_end_a_frame() {
        let frame = br#"{"content":"}] {[ \"quoted\" \\","id":5} {"id":6}"#;
        let mut decoder = FrameDecoder::new(1024);
        let mut frames = Vec::new();
        for byte in frame.iter() {
            decoder.push(std::slice::from_ref(byte));
            while let Some(value) = decoder.next_frame().unwrap() {
                frames.push(value);
            }
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["content"], "}] {[ \"quoted\" \\");
        assert_eq!(frames[0]["id"], 5);
        assert_eq!(frames[1]["id"], 6);
    }

    #[test]
    fn stray_closer_is_rejected_immediately() {
        let mut decoder = FrameDecoder::new(1024);
        decoder.push(b"}}not json");
        assert!(matches!(decoder.next_frame(), Err(FrameError::Malformed(_))));
        assert_eq!(decoder.buffered(), 0);
        decoder.push(br#" {"id":8}"#);
        assert_eq!(decoder.next_frame().unwrap().unwrap()["id"], 8);
    }

    #[test]
    fn request_validation_recovers_id() {
        let (id, err) = Request::from_value(json!({"id": 9, "method": "ping"})).unwrap_err();
        assert_eq!(id, json!(9));
        assert!(matches!(err, RpcError::InvalidRequest(_)));

        let (_, err) =
            Request::from_value(json!({"version": "2.0", "method": "ping", "id": 1})).unwrap_err();
        assert!(matches!(err, RpcError::UnsupportedVersion(_)));

        let req = Request::from_value(json!({"version": "1.3", "method": "ping", "id": "a"})).unwrap();
        assert_eq!(req.params, json!({}));
        assert_eq!(req.id, json!("a"));
    }

    #[test]
    fn error_envelope_shape() {
        let resp = Response::failure(json!(3), &RpcError::UnknownMethod("nope".into()));
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["version"], PROTOCOL_VERSION);
        assert_eq!(value["error"]["code"], "UNKNOWN_METHOD");
        assert_eq!(value["id"], 3);
        assert!(value.get("result").is_none());

        let back: Response = serde_json::from_value(value).unwrap();
        assert!(!back.is_success());
        assert_eq!(back.error_code(), Some("UNKNOWN_METHOD"));
    }
}
