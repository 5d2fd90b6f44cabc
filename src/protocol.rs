//! Event socket framing: header blocks, length-delimited bodies and
//! message classification.

use crate::{
    buffer::{find_blank_line, EslBuffer},
    command::EslResponse,
    constants::*,
    error::{EslError, EslResult},
    event::EslEvent,
};
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use std::collections::HashMap;

/// Message classes, keyed on `Content-Type`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    /// Greeting sent by the switch when the socket opens
    AuthRequest,
    /// Result of execute/filter/event/auth, text in `Reply-Text`
    CommandReply,
    /// Result of `api`, text in the body
    ApiResponse,
    /// Asynchronous notification
    EventPlain,
    /// The switch is about to close the socket
    DisconnectNotice,
    /// Anything else
    Unknown(String),
}

impl MessageType {
    pub fn from_content_type(content_type: &str) -> Self {
        match content_type {
            CONTENT_TYPE_AUTH_REQUEST => MessageType::AuthRequest,
            CONTENT_TYPE_COMMAND_REPLY => MessageType::CommandReply,
            CONTENT_TYPE_API_RESPONSE => MessageType::ApiResponse,
            CONTENT_TYPE_TEXT_EVENT_PLAIN => MessageType::EventPlain,
            CONTENT_TYPE_DISCONNECT_NOTICE => MessageType::DisconnectNotice,
            _ => MessageType::Unknown(content_type.to_string()),
        }
    }

    /// `true` for the two shapes that answer a command
    pub fn is_reply(&self) -> bool {
        matches!(self, MessageType::CommandReply | MessageType::ApiResponse)
    }
}

/// One framed unit: header block plus optional raw body
#[derive(Debug, Clone)]
pub struct EslMessage {
    pub message_type: MessageType,
    /// Outer headers, values taken verbatim
    pub headers: HashMap<String, String>,
    /// Exactly `Content-Length` bytes, when declared and non-zero
    pub body: Option<Bytes>,
}

impl EslMessage {
    pub fn new(
        message_type: MessageType,
        headers: HashMap<String, String>,
        body: Option<Bytes>,
    ) -> Self {
        Self {
            message_type,
            headers,
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .map(String::as_str)
    }

    /// Body as text; a body that is not UTF-8 is a protocol error
    pub fn body_text(&self) -> EslResult<Option<String>> {
        self.body
            .as_deref()
            .map(|b| utf8_body(b, "body"))
            .transpose()
    }

    pub fn into_response(self) -> EslResult<EslResponse> {
        EslResponse::from_message(self)
    }

    /// Decode a `text/event-plain` message into its event fields.
    ///
    /// The switch wraps the event in an envelope: the outer body holds the
    /// percent-encoded event headers, optionally followed by the event's own
    /// `Content-Length` delimited payload. A message with an empty outer body
    /// carries its fields in the outer headers instead.
    pub fn into_event(self) -> EslResult<EslEvent> {
        if self.message_type != MessageType::EventPlain {
            return Err(EslError::protocol_error("Message is not an event"));
        }

        match self.body {
            Some(body) if !body.is_empty() => decode_event_body(&body),
            _ => {
                let mut event = EslEvent::new();
                for (key, raw) in self.headers {
                    let value = percent_decode_field(&raw)?;
                    event.set_header(key, value);
                }
                Ok(event)
            }
        }
    }
}

#[derive(Debug)]
enum ParseState {
    WaitingForHeaders,
    WaitingForBody {
        message_type: MessageType,
        headers: HashMap<String, String>,
        body_length: usize,
    },
}

/// Incremental framer fed with socket reads
pub struct EslParser {
    buffer: EslBuffer,
    state: ParseState,
}

impl EslParser {
    pub fn new() -> Self {
        Self {
            buffer: EslBuffer::new(),
            state: ParseState::WaitingForHeaders,
        }
    }

    pub fn add_data(&mut self, data: &[u8]) -> EslResult<()> {
        self.buffer
            .extend_from_slice(data)
    }

    /// Try to frame one complete message from what has been buffered.
    ///
    /// `Ok(None)` means more data is needed. Any error leaves the stream at an
    /// unknown offset and the connection must be dropped.
    pub fn parse_message(&mut self) -> EslResult<Option<EslMessage>> {
        loop {
            match std::mem::replace(&mut self.state, ParseState::WaitingForHeaders) {
                ParseState::WaitingForHeaders => {
                    self.buffer
                        .skip_blank_lines();
                    let end = match self
                        .buffer
                        .find_header_end()
                    {
                        Some(end) => end,
                        None => return Ok(None),
                    };

                    let raw = self
                        .buffer
                        .take(end.consumed)
                        .ok_or_else(|| EslError::protocol_error("header block vanished"))?;
                    let text = std::str::from_utf8(&raw[..end.header_len])
                        .map_err(|_| EslError::protocol_error("Invalid UTF-8 in headers"))?;
                    let headers = parse_headers(text)?;

                    let message_type = MessageType::from_content_type(
                        headers
                            .get(HEADER_CONTENT_TYPE)
                            .map(String::as_str)
                            .unwrap_or(""),
                    );

                    let body_length = match headers.get(HEADER_CONTENT_LENGTH) {
                        Some(value) => parse_content_length(value)?,
                        None => 0,
                    };

                    if body_length == 0 {
                        return Ok(Some(EslMessage::new(message_type, headers, None)));
                    }

                    self.state = ParseState::WaitingForBody {
                        message_type,
                        headers,
                        body_length,
                    };
                }
                ParseState::WaitingForBody {
                    message_type,
                    headers,
                    body_length,
                } => {
                    return match self
                        .buffer
                        .take(body_length)
                    {
                        Some(body) => Ok(Some(EslMessage::new(message_type, headers, Some(body)))),
                        None => {
                            self.state = ParseState::WaitingForBody {
                                message_type,
                                headers,
                                body_length,
                            };
                            Ok(None)
                        }
                    };
                }
            }
        }
    }
}

impl Default for EslParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Split one header line on the first `": "`.
///
/// A bare `Key:` is accepted as an empty value.
fn split_header_line(line: &str) -> EslResult<(&str, &str)> {
    if let Some((key, value)) = line.split_once(": ") {
        return Ok((key, value));
    }
    if let Some(key) = line.strip_suffix(':') {
        return Ok((key, ""));
    }
    Err(EslError::InvalidHeader {
        header: line.to_string(),
    })
}

/// Parse a header block; duplicate keys keep the last value.
pub(crate) fn parse_headers(text: &str) -> EslResult<HashMap<String, String>> {
    let mut headers = HashMap::new();
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let (key, value) = split_header_line(line)?;
        headers.insert(key.to_string(), value.to_string());
    }
    Ok(headers)
}

fn parse_content_length(value: &str) -> EslResult<usize> {
    let length: usize = value
        .trim()
        .parse()
        .map_err(|_| EslError::InvalidHeader {
            header: format!("{}: {}", HEADER_CONTENT_LENGTH, value),
        })?;
    if length > MAX_MESSAGE_SIZE {
        return Err(EslError::protocol_error(format!(
            "Content-Length {} exceeds limit {}",
            length, MAX_MESSAGE_SIZE
        )));
    }
    Ok(length)
}

/// Strict percent-decoding of an event field value.
///
/// Every `%` must introduce two hex digits and the decoded bytes must be
/// UTF-8. `+` is left as is.
pub fn percent_decode_field(raw: &str) -> EslResult<String> {
    let bytes = raw.as_bytes();
    let mut pos = 0;
    while let Some(offset) = bytes[pos..]
        .iter()
        .position(|&b| b == b'%')
    {
        let at = pos + offset;
        let escape_ok = bytes
            .get(at + 1..at + 3)
            .map_or(false, |hex| hex.iter().all(u8::is_ascii_hexdigit));
        if !escape_ok {
            return Err(EslError::protocol_error(format!(
                "malformed percent escape in {:?}",
                raw
            )));
        }
        pos = at + 3;
    }

    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| EslError::protocol_error(format!("percent-decoded {:?} is not UTF-8", raw)))
}

fn utf8_body(bytes: &[u8], what: &str) -> EslResult<String> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| EslError::protocol_error(format!("Invalid UTF-8 in {}", what)))
}

/// Decode the body of an event envelope into fields plus optional payload.
fn decode_event_body(body: &[u8]) -> EslResult<EslEvent> {
    let (header_section, rest) = match find_blank_line(body) {
        Some(end) => (&body[..end.header_len], &body[end.consumed..]),
        None => (body, &body[body.len()..]),
    };

    let text = std::str::from_utf8(header_section)
        .map_err(|_| EslError::protocol_error("Invalid UTF-8 in event headers"))?;

    let mut event = EslEvent::new();
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let (key, raw) = split_header_line(line)?;
        event.set_header(key.to_string(), percent_decode_field(raw)?);
    }

    let payload_length = match event.header(HEADER_CONTENT_LENGTH) {
        Some(value) => parse_content_length(value)?,
        None => 0,
    };
    if payload_length > rest.len() {
        return Err(EslError::protocol_error(format!(
            "event declares {} body bytes but only {} follow",
            payload_length,
            rest.len()
        )));
    }
    if payload_length > 0 {
        let payload = utf8_body(&rest[..payload_length], "event body")?;
        event.set_header(EVENT_BODY_FIELD.to_string(), payload);
    }

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};

    fn envelope(body: &str) -> String {
        format!(
            "Content-Length: {}\nContent-Type: text/event-plain\n\n{}",
            body.len(),
            body
        )
    }

    fn parse_one(data: &[u8]) -> EslMessage {
        let mut parser = EslParser::new();
        parser
            .add_data(data)
            .unwrap();
        parser
            .parse_message()
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_parse_headers_first_separator_only() {
        let headers = parse_headers("Reply-Text: +OK Job-UUID: abc\r\nEmpty:\r\n").unwrap();
        assert_eq!(
            headers
                .get("Reply-Text")
                .map(String::as_str),
            Some("+OK Job-UUID: abc")
        );
        assert_eq!(
            headers
                .get("Empty")
                .map(String::as_str),
            Some("")
        );
    }

    #[test]
    fn test_parse_headers_duplicate_last_wins() {
        let headers = parse_headers("A: 1\nA: 2\n").unwrap();
        assert_eq!(headers.get("A").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_parse_headers_rejects_unsplittable_line() {
        assert!(matches!(
            parse_headers("no separator here"),
            Err(EslError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn test_parse_auth_request() {
        let message = parse_one(b"Content-Type: auth/request\r\n\r\n");
        assert_eq!(message.message_type, MessageType::AuthRequest);
        assert!(message.body.is_none());
    }

    #[test]
    fn test_parse_api_response() {
        let message = parse_one(b"Content-Type: api/response\r\nContent-Length: 5\r\n\r\nready");
        assert_eq!(message.message_type, MessageType::ApiResponse);
        assert_eq!(message.body_text().unwrap(), Some("ready".to_string()));
    }

    #[test]
    fn test_command_reply_not_decoded() {
        let message = parse_one(b"Content-Type: command/reply\nReply-Text: %2BOK\n\n");
        assert_eq!(message.message_type, MessageType::CommandReply);
        assert_eq!(message.header(HEADER_REPLY_TEXT), Some("%2BOK"));
    }

    #[test]
    fn test_body_is_byte_exact() {
        let mut parser = EslParser::new();
        parser
            .add_data(b"Content-Type: api/response\nContent-Length: 3\n\nabcContent-Type: command/reply\nReply-Text: +OK\n\n")
            .unwrap();

        let first = parser
            .parse_message()
            .unwrap()
            .unwrap();
        assert_eq!(first.body.as_deref(), Some(&b"abc"[..]));

        let second = parser
            .parse_message()
            .unwrap()
            .unwrap();
        assert_eq!(second.message_type, MessageType::CommandReply);
        assert!(parser
            .parse_message()
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_incomplete_body_waits() {
        let mut parser = EslParser::new();
        parser
            .add_data(b"Content-Type: api/response\nContent-Length: 10\n\ntest")
            .unwrap();
        assert!(parser
            .parse_message()
            .unwrap()
            .is_none());

        parser
            .add_data(b"-12345")
            .unwrap();
        let message = parser
            .parse_message()
            .unwrap()
            .unwrap();
        assert_eq!(message.body_text().unwrap(), Some("test-12345".to_string()));
    }

    #[test]
    fn test_split_header_block() {
        let mut parser = EslParser::new();
        parser
            .add_data(b"Content-Type: command/re")
            .unwrap();
        assert!(parser
            .parse_message()
            .unwrap()
            .is_none());
        parser
            .add_data(b"ply\nReply-Text: +OK\n\n")
            .unwrap();
        let message = parser
            .parse_message()
            .unwrap()
            .unwrap();
        assert_eq!(message.message_type, MessageType::CommandReply);
    }

    #[test]
    fn test_non_numeric_content_length_rejected() {
        let mut parser = EslParser::new();
        parser
            .add_data(b"Content-Type: api/response\nContent-Length: abc\n\n")
            .unwrap();
        assert!(parser
            .parse_message()
            .is_err());
    }

    #[test]
    fn test_oversized_content_length_rejected() {
        let mut parser = EslParser::new();
        let data = format!(
            "Content-Type: api/response\nContent-Length: {}\n\n",
            MAX_MESSAGE_SIZE + 1
        );
        parser
            .add_data(data.as_bytes())
            .unwrap();
        assert!(matches!(
            parser.parse_message(),
            Err(EslError::ProtocolError { .. })
        ));
    }

    #[test]
    fn test_unknown_content_type() {
        let message = parse_one(b"Content-Type: log/data\nContent-Length: 2\n\nhi");
        assert_eq!(message.message_type, MessageType::Unknown("log/data".to_string()));
    }

    #[test]
    fn test_event_envelope_decoding() {
        let body = "Event-Name: HEARTBEAT\nUp-Time: 0%20years%2C%200%20days\nUnique-ID: abc\n\n";
        let event = parse_one(envelope(body).as_bytes())
            .into_event()
            .unwrap();

        assert_eq!(event.event_name(), Some("HEARTBEAT"));
        assert_eq!(event.header("Up-Time"), Some("0 years, 0 days"));
        assert_eq!(event.unique_id(), Some("abc"));
        assert!(event
            .body()
            .is_none());
    }

    #[test]
    fn test_event_inner_body() {
        let payload = "+OK Status\nline two\n";
        let body = format!(
            "Event-Name: BACKGROUND_JOB\nJob-UUID: job-1\nContent-Length: {}\n\n{}",
            payload.len(),
            payload
        );
        let event = parse_one(envelope(&body).as_bytes())
            .into_event()
            .unwrap();

        assert_eq!(event.job_uuid(), Some("job-1"));
        assert_eq!(event.body(), Some(payload));
    }

    #[test]
    fn test_event_inner_body_truncated() {
        let body = "Event-Name: CUSTOM\nContent-Length: 50\n\nshort";
        let result = parse_one(envelope(body).as_bytes()).into_event();
        assert!(matches!(result, Err(EslError::ProtocolError { .. })));
    }

    #[test]
    fn test_api_body_not_utf8_rejected() {
        let message = parse_one(b"Content-Type: api/response\nContent-Length: 2\n\n\xff\xfe");
        assert_eq!(message.body.as_deref(), Some(&b"\xff\xfe"[..]));
        assert!(matches!(
            message.body_text(),
            Err(EslError::ProtocolError { .. })
        ));
    }

    #[test]
    fn test_event_inner_body_not_utf8_rejected() {
        let mut inner = b"Event-Name: CUSTOM\nContent-Length: 2\n\n".to_vec();
        inner.extend_from_slice(&[0xff, 0xfe]);
        let mut data = format!(
            "Content-Length: {}\nContent-Type: text/event-plain\n\n",
            inner.len()
        )
        .into_bytes();
        data.extend_from_slice(&inner);

        let result = parse_one(&data).into_event();
        assert!(matches!(result, Err(EslError::ProtocolError { .. })));
    }

    #[test]
    fn test_event_fields_in_outer_headers() {
        let message = parse_one(
            b"Content-Type: text/event-plain\r\nEvent-Name: HEARTBEAT\r\nContent-Length: 0\r\n\r\n",
        );
        let event = message
            .into_event()
            .unwrap();
        assert_eq!(&event["Event-Name"], "HEARTBEAT");
    }

    #[test]
    fn test_event_malformed_percent_is_error() {
        let body = "Event-Name: CUSTOM\nX-Bad: 50%zz\n\n";
        let result = parse_one(envelope(body).as_bytes()).into_event();
        assert!(matches!(result, Err(EslError::ProtocolError { .. })));
    }

    #[test]
    fn test_percent_decode_strict() {
        assert_eq!(percent_decode_field("a%20b").unwrap(), "a b");
        assert_eq!(percent_decode_field("+OK").unwrap(), "+OK");
        assert!(percent_decode_field("100%").is_err());
        assert!(percent_decode_field("%4").is_err());
        assert!(percent_decode_field("%G1").is_err());
        assert!(percent_decode_field("%FF").is_err());
    }

    #[test]
    fn test_percent_round_trip() {
        let samples = [
            "plain",
            "0 years, 0 days",
            "sip:user@10.1.30.170:5060;transport=TCP",
            "{\"json\": [1, 2]}",
            "100% + ünïcødé",
            "",
        ];
        for sample in samples {
            let encoded = utf8_percent_encode(sample, NON_ALPHANUMERIC).to_string();
            assert_eq!(percent_decode_field(&encoded).unwrap(), sample);
        }
    }
}
