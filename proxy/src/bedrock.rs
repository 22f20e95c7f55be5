//! Parser for the AWS `application/vnd.amazon.eventstream` binary framing used
//! by Bedrock's streaming responses. Length-prefixed: a 4-byte total length, a
//! 4-byte headers length, a 4-byte prelude CRC, the header block, the payload,
//! and a trailing 4-byte message CRC. CRCs are read but never verified here —
//! that's left to whoever renders the flow.

use base64::Engine;
use bytes::Bytes;
use std::collections::HashMap;

const PRELUDE_LEN: usize = 8;
const PRELUDE_AND_CRC_LEN: usize = PRELUDE_LEN + 4;
const TRAILING_CRC_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Integer(i32),
    Long(i64),
    ByteArray(Bytes),
    String(String),
    Timestamp(i64),
    Uuid([u8; 16]),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BedrockMessage {
    pub headers: HashMap<String, HeaderValue>,
    pub payload: Bytes,
}

impl BedrockMessage {
    /// Value of the `:message-type` header (`event` or `exception`), when present.
    pub fn message_type(&self) -> Option<&str> {
        match self.headers.get(":message-type") {
            Some(HeaderValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn is_exception(&self) -> bool {
        self.message_type() == Some("exception")
    }

    fn header_string(&self, key: &str) -> Option<&str> {
        match self.headers.get(key) {
            Some(HeaderValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Event name per the `:message-type` discriminator: `event` uses
    /// `:event-type` verbatim, `exception` uses `:exception-type` prefixed
    /// with `"exception:"`.
    pub fn event_name(&self) -> Option<String> {
        match self.message_type() {
            Some("event") => self.header_string(":event-type").map(str::to_string),
            Some("exception") => self
                .header_string(":exception-type")
                .map(|s| format!("exception:{s}")),
            _ => None,
        }
    }

    /// Payload as text. If the payload is a JSON object with a base64-encoded
    /// `bytes` field, that field is decoded; otherwise the payload is surfaced
    /// as a lossy UTF-8 string.
    pub fn decoded_data(&self) -> String {
        if let Ok(serde_json::Value::Object(obj)) = serde_json::from_slice(&self.payload)
            && let Some(serde_json::Value::String(encoded)) = obj.get("bytes")
            && let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded)
        {
            return String::from_utf8_lossy(&decoded).to_string();
        }
        String::from_utf8_lossy(&self.payload).to_string()
    }
}

#[derive(Debug, Default)]
pub struct BedrockEventStreamParser {
    buffer: Vec<u8>,
}

#[derive(Debug)]
pub enum BedrockParseError {
    HeaderTooShort,
    UnknownHeaderType(u8),
    Truncated,
}

impl BedrockEventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<BedrockMessage>, BedrockParseError> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();

        loop {
            if self.buffer.len() < PRELUDE_LEN {
                break;
            }
            let total_len = u32::from_be_bytes(self.buffer[0..4].try_into().unwrap()) as usize;
            if self.buffer.len() < total_len {
                break;
            }

            let headers_len = u32::from_be_bytes(self.buffer[4..8].try_into().unwrap()) as usize;
            if total_len < PRELUDE_AND_CRC_LEN + headers_len + TRAILING_CRC_LEN {
                return Err(BedrockParseError::Truncated);
            }

            let headers_start = PRELUDE_AND_CRC_LEN;
            let headers_end = headers_start + headers_len;
            let payload_end = total_len - TRAILING_CRC_LEN;

            let headers = parse_headers(&self.buffer[headers_start..headers_end])?;
            let payload = Bytes::copy_from_slice(&self.buffer[headers_end..payload_end]);

            messages.push(BedrockMessage { headers, payload });
            self.buffer.drain(..total_len);
        }

        Ok(messages)
    }

    /// Discards whatever partial message remains buffered at stream end,
    /// returning its length. A trailing fragment can't be framed without its
    /// length prefix, so there's nothing to parse here, only to report.
    pub fn flush(&mut self) -> usize {
        let remaining = self.buffer.len();
        self.buffer.clear();
        remaining
    }
}

fn parse_headers(mut buf: &[u8]) -> Result<HashMap<String, HeaderValue>, BedrockParseError> {
    let mut headers = HashMap::new();

    while !buf.is_empty() {
        if buf.len() < 2 {
            return Err(BedrockParseError::HeaderTooShort);
        }
        let name_len = buf[0] as usize;
        buf = &buf[1..];
        if buf.len() < name_len + 1 {
            return Err(BedrockParseError::HeaderTooShort);
        }
        let name = String::from_utf8_lossy(&buf[..name_len]).to_string();
        buf = &buf[name_len..];

        let value_type = buf[0];
        buf = &buf[1..];

        let (value, rest) = parse_value(value_type, buf)?;
        headers.insert(name, value);
        buf = rest;
    }

    Ok(headers)
}

fn parse_value(ty: u8, mut buf: &[u8]) -> Result<(HeaderValue, &[u8]), BedrockParseError> {
    Ok(match ty {
        0 => (HeaderValue::Bool(true), buf),
        1 => (HeaderValue::Bool(false), buf),
        2 => {
            require(buf, 1)?;
            let v = buf[0] as i8;
            (HeaderValue::Byte(v), &buf[1..])
        }
        3 => {
            require(buf, 2)?;
            let v = i16::from_be_bytes(buf[0..2].try_into().unwrap());
            (HeaderValue::Short(v), &buf[2..])
        }
        4 => {
            require(buf, 4)?;
            let v = i32::from_be_bytes(buf[0..4].try_into().unwrap());
            (HeaderValue::Integer(v), &buf[4..])
        }
        5 => {
            require(buf, 8)?;
            let v = i64::from_be_bytes(buf[0..8].try_into().unwrap());
            (HeaderValue::Long(v), &buf[8..])
        }
        6 => {
            require(buf, 2)?;
            let len = u16::from_be_bytes(buf[0..2].try_into().unwrap()) as usize;
            buf = &buf[2..];
            require(buf, len)?;
            (
                HeaderValue::ByteArray(Bytes::copy_from_slice(&buf[..len])),
                &buf[len..],
            )
        }
        7 => {
            require(buf, 2)?;
            let len = u16::from_be_bytes(buf[0..2].try_into().unwrap()) as usize;
            buf = &buf[2..];
            require(buf, len)?;
            (
                HeaderValue::String(String::from_utf8_lossy(&buf[..len]).to_string()),
                &buf[len..],
            )
        }
        8 => {
            require(buf, 8)?;
            let v = i64::from_be_bytes(buf[0..8].try_into().unwrap());
            (HeaderValue::Timestamp(v), &buf[8..])
        }
        9 => {
            require(buf, 16)?;
            let mut uuid = [0u8; 16];
            uuid.copy_from_slice(&buf[..16]);
            (HeaderValue::Uuid(uuid), &buf[16..])
        }
        other => return Err(BedrockParseError::UnknownHeaderType(other)),
    })
}

fn require(buf: &[u8], len: usize) -> Result<(), BedrockParseError> {
    if buf.len() < len {
        Err(BedrockParseError::HeaderTooShort)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_string_header(name: &str, value: &str) -> Vec<u8> {
        let mut out = vec![name.len() as u8];
        out.extend_from_slice(name.as_bytes());
        out.push(7);
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
        out
    }

    fn encode_message(headers: &[u8], payload: &[u8]) -> Vec<u8> {
        let total_len = PRELUDE_AND_CRC_LEN + headers.len() + payload.len() + TRAILING_CRC_LEN;
        let mut out = Vec::new();
        out.extend_from_slice(&(total_len as u32).to_be_bytes());
        out.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes()); // prelude crc, unverified
        out.extend_from_slice(headers);
        out.extend_from_slice(payload);
        out.extend_from_slice(&0u32.to_be_bytes()); // message crc, unverified
        out
    }

    #[test]
    fn parses_single_event_message() {
        let headers = encode_string_header(":message-type", "event");
        let msg = encode_message(&headers, b"{\"token\":\"hi\"}");

        let mut parser = BedrockEventStreamParser::new();
        let out = parser.push(&msg).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message_type(), Some("event"));
        assert_eq!(&out[0].payload[..], b"{\"token\":\"hi\"}");
    }

    #[test]
    fn handles_split_across_chunks() {
        let headers = encode_string_header(":message-type", "event");
        let msg = encode_message(&headers, b"payload");

        let mut parser = BedrockEventStreamParser::new();
        assert!(parser.push(&msg[..5]).unwrap().is_empty());
        let out = parser.push(&msg[5..]).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn recognizes_exception_messages() {
        let headers = encode_string_header(":message-type", "exception");
        let msg = encode_message(&headers, b"{\"message\":\"boom\"}");

        let mut parser = BedrockEventStreamParser::new();
        let out = parser.push(&msg).unwrap();
        assert!(out[0].is_exception());
    }

    #[test]
    fn event_name_uses_event_type_header() {
        let mut headers = encode_string_header(":message-type", "event");
        headers.extend(encode_string_header(":event-type", "chunk"));
        let msg = encode_message(&headers, b"{\"token\":\"hi\"}");

        let mut parser = BedrockEventStreamParser::new();
        let out = parser.push(&msg).unwrap();
        assert_eq!(out[0].event_name().as_deref(), Some("chunk"));
    }

    #[test]
    fn exception_event_name_is_prefixed() {
        let mut headers = encode_string_header(":message-type", "exception");
        headers.extend(encode_string_header(":exception-type", "ValidationException"));
        let msg = encode_message(&headers, b"{\"message\":\"boom\"}");

        let mut parser = BedrockEventStreamParser::new();
        let out = parser.push(&msg).unwrap();
        assert_eq!(out[0].event_name().as_deref(), Some("exception:ValidationException"));
    }

    #[test]
    fn decodes_base64_bytes_field() {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"hello world");
        let payload = format!("{{\"bytes\":\"{encoded}\"}}");

        let headers = encode_string_header(":message-type", "event");
        let msg = encode_message(&headers, payload.as_bytes());

        let mut parser = BedrockEventStreamParser::new();
        let out = parser.push(&msg).unwrap();
        assert_eq!(out[0].decoded_data(), "hello world");
    }

    #[test]
    fn flush_reports_leftover_partial_bytes() {
        let headers = encode_string_header(":message-type", "event");
        let msg = encode_message(&headers, b"payload");

        let mut parser = BedrockEventStreamParser::new();
        assert!(parser.push(&msg[..5]).unwrap().is_empty());
        assert_eq!(parser.flush(), 5);
    }
}
