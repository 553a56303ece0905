//! CoAP message types.
//!
//! This module defines the message model exchanged with the LwM2M server:
//! - Header fields: type, code, message ID, token
//! - Options (Uri-Path, Uri-Query, Content-Format, Observe, ...)
//! - Payload
//!
//! Messages are encoded to and from the RFC 7252 binary format by
//! [`crate::codec`].

use std::fmt;

/// CoAP message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Confirmable = 0,
    NonConfirmable = 1,
    Acknowledgement = 2,
    Reset = 3,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageType::Confirmable),
            1 => Some(MessageType::NonConfirmable),
            2 => Some(MessageType::Acknowledgement),
            3 => Some(MessageType::Reset),
            _ => None,
        }
    }

    pub fn short_name(self) -> &'static str {
        match self {
            MessageType::Confirmable => "CON",
            MessageType::NonConfirmable => "NON",
            MessageType::Acknowledgement => "ACK",
            MessageType::Reset => "RST",
        }
    }
}

/// CoAP method or response code, stored as `class << 5 | detail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(pub u8);

impl Code {
    pub const EMPTY: Code = Code::new(0, 0);

    pub const GET: Code = Code::new(0, 1);
    pub const POST: Code = Code::new(0, 2);
    pub const PUT: Code = Code::new(0, 3);
    pub const DELETE: Code = Code::new(0, 4);

    pub const CREATED: Code = Code::new(2, 1);
    pub const DELETED: Code = Code::new(2, 2);
    pub const VALID: Code = Code::new(2, 3);
    pub const CHANGED: Code = Code::new(2, 4);
    pub const CONTENT: Code = Code::new(2, 5);

    pub const BAD_REQUEST: Code = Code::new(4, 0);
    pub const UNAUTHORIZED: Code = Code::new(4, 1);
    pub const BAD_OPTION: Code = Code::new(4, 2);
    pub const FORBIDDEN: Code = Code::new(4, 3);
    pub const NOT_FOUND: Code = Code::new(4, 4);
    pub const METHOD_NOT_ALLOWED: Code = Code::new(4, 5);
    pub const NOT_ACCEPTABLE: Code = Code::new(4, 6);
    pub const UNSUPPORTED_CONTENT_FORMAT: Code = Code::new(4, 15);

    pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);
    pub const SERVICE_UNAVAILABLE: Code = Code::new(5, 3);

    pub const fn new(class: u8, detail: u8) -> Self {
        Code((class << 5) | (detail & 0x1F))
    }

    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(self) -> u8 {
        self.0 & 0x1F
    }

    pub fn is_empty(self) -> bool {
        self == Code::EMPTY
    }

    pub fn is_request(self) -> bool {
        self.class() == 0 && !self.is_empty()
    }

    pub fn is_response(self) -> bool {
        self.class() >= 2
    }

    pub fn is_success(self) -> bool {
        self.class() == 2
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Code::GET => write!(f, "GET"),
            Code::POST => write!(f, "POST"),
            Code::PUT => write!(f, "PUT"),
            Code::DELETE => write!(f, "DELETE"),
            code => write!(f, "{}.{:02}", code.class(), code.detail()),
        }
    }
}

/// Option numbers used by LwM2M.
pub mod option {
    pub const IF_MATCH: u16 = 1;
    pub const URI_HOST: u16 = 3;
    pub const ETAG: u16 = 4;
    pub const IF_NONE_MATCH: u16 = 5;
    pub const OBSERVE: u16 = 6;
    pub const URI_PORT: u16 = 7;
    pub const LOCATION_PATH: u16 = 8;
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;
    pub const MAX_AGE: u16 = 14;
    pub const URI_QUERY: u16 = 15;
    pub const ACCEPT: u16 = 17;
    pub const LOCATION_QUERY: u16 = 20;
    pub const SIZE1: u16 = 60;
}

/// Payload content formats understood by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentFormat {
    TextPlain,
    LinkFormat,
    Opaque,
    SenmlJson,
    Other(u16),
}

impl ContentFormat {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => ContentFormat::TextPlain,
            40 => ContentFormat::LinkFormat,
            42 => ContentFormat::Opaque,
            110 => ContentFormat::SenmlJson,
            other => ContentFormat::Other(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            ContentFormat::TextPlain => 0,
            ContentFormat::LinkFormat => 40,
            ContentFormat::Opaque => 42,
            ContentFormat::SenmlJson => 110,
            ContentFormat::Other(value) => value,
        }
    }
}

/// A single CoAP option. Values are kept raw; typed accessors live on
/// [`Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

/// A CoAP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Vec<u8>,
    /// Options in insertion order. The codec sorts them when encoding.
    pub options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(message_type: MessageType, code: Code, message_id: u16) -> Self {
        Self {
            message_type,
            code,
            message_id,
            token: Vec::new(),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// A confirmable request.
    pub fn request(code: Code, message_id: u16, token: Vec<u8>) -> Self {
        Self {
            token,
            ..Self::new(MessageType::Confirmable, code, message_id)
        }
    }

    /// An empty acknowledgement, used to accept a confirmable message
    /// before a separate response.
    pub fn empty_ack(message_id: u16) -> Self {
        Self::new(MessageType::Acknowledgement, Code::EMPTY, message_id)
    }

    /// A reset message rejecting `message_id`.
    pub fn reset(message_id: u16) -> Self {
        Self::new(MessageType::Reset, Code::EMPTY, message_id)
    }

    /// A piggybacked response to `request` carrying `code`.
    pub fn piggybacked_response(request: &Message, code: Code) -> Self {
        let message_type = match request.message_type {
            MessageType::Confirmable => MessageType::Acknowledgement,
            _ => MessageType::NonConfirmable,
        };
        Self {
            token: request.token.clone(),
            ..Self::new(message_type, code, request.message_id)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn is_confirmable(&self) -> bool {
        self.message_type == MessageType::Confirmable
    }

    // ========================================================================
    // Option builders
    // ========================================================================

    pub fn add_option(&mut self, number: u16, value: Vec<u8>) -> &mut Self {
        self.options.push(CoapOption { number, value });
        self
    }

    pub fn add_string_option(&mut self, number: u16, value: &str) -> &mut Self {
        self.add_option(number, value.as_bytes().to_vec())
    }

    /// Add an unsigned integer option using the shortest big-endian encoding.
    pub fn add_uint_option(&mut self, number: u16, value: u32) -> &mut Self {
        self.add_option(number, encode_uint(value))
    }

    /// Replace every instance of option `number` with a single value.
    pub fn set_uint_option(&mut self, number: u16, value: u32) -> &mut Self {
        self.options.retain(|o| o.number != number);
        self.add_uint_option(number, value)
    }

    pub fn set_uri_path<S: AsRef<str>>(&mut self, segments: &[S]) -> &mut Self {
        self.options.retain(|o| o.number != option::URI_PATH);
        for segment in segments {
            self.add_string_option(option::URI_PATH, segment.as_ref());
        }
        self
    }

    pub fn add_uri_query(&mut self, query: &str) -> &mut Self {
        self.add_string_option(option::URI_QUERY, query)
    }

    pub fn set_content_format(&mut self, format: ContentFormat) -> &mut Self {
        self.set_uint_option(option::CONTENT_FORMAT, u32::from(format.to_u16()))
    }

    pub fn set_observe(&mut self, sequence: u32) -> &mut Self {
        // Observe values are 24 bits on the wire.
        self.set_uint_option(option::OBSERVE, sequence & 0x00FF_FFFF)
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) -> &mut Self {
        self.payload = payload;
        self
    }

    // ========================================================================
    // Option accessors
    // ========================================================================

    pub fn option_values(&self, number: u16) -> impl Iterator<Item = &[u8]> {
        self.options
            .iter()
            .filter(move |o| o.number == number)
            .map(|o| o.value.as_slice())
    }

    pub fn has_option(&self, number: u16) -> bool {
        self.options.iter().any(|o| o.number == number)
    }

    pub fn uint_option(&self, number: u16) -> Option<u32> {
        self.option_values(number).next().map(decode_uint)
    }

    fn string_options(&self, number: u16) -> Vec<String> {
        self.option_values(number)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    pub fn uri_path(&self) -> Vec<String> {
        self.string_options(option::URI_PATH)
    }

    pub fn uri_query(&self) -> Vec<String> {
        self.string_options(option::URI_QUERY)
    }

    pub fn location_path(&self) -> Vec<String> {
        self.string_options(option::LOCATION_PATH)
    }

    pub fn content_format(&self) -> Option<ContentFormat> {
        self.uint_option(option::CONTENT_FORMAT)
            .map(|v| ContentFormat::from_u16(v as u16))
    }

    pub fn accept(&self) -> Option<ContentFormat> {
        self.uint_option(option::ACCEPT)
            .map(|v| ContentFormat::from_u16(v as u16))
    }

    pub fn observe(&self) -> Option<u32> {
        self.uint_option(option::OBSERVE)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} mid={} token={}",
            self.message_type.short_name(),
            self.code,
            self.message_id,
            hex_token(&self.token)
        )?;
        let path = self.uri_path();
        if !path.is_empty() {
            write!(f, " /{}", path.join("/"))?;
        }
        if !self.payload.is_empty() {
            write!(f, " ({} bytes)", self.payload.len())?;
        }
        Ok(())
    }
}

fn hex_token(token: &[u8]) -> String {
    token.iter().map(|b| format!("{:02x}", b)).collect()
}

pub(crate) fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

pub(crate) fn decode_uint(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_display() {
        assert_eq!(Code::GET.to_string(), "GET");
        assert_eq!(Code::CONTENT.to_string(), "2.05");
        assert_eq!(Code::NOT_FOUND.to_string(), "4.04");
        assert_eq!(Code::CONTENT.0, 69);
        assert_eq!(Code::CREATED.0, 65);
    }

    #[test]
    fn test_code_classes() {
        assert!(Code::POST.is_request());
        assert!(!Code::EMPTY.is_request());
        assert!(Code::CHANGED.is_success());
        assert!(Code::BAD_REQUEST.is_response());
        assert!(!Code::BAD_REQUEST.is_success());
    }

    #[test]
    fn test_uint_encoding() {
        assert_eq!(encode_uint(0), Vec::<u8>::new());
        assert_eq!(encode_uint(40), vec![40]);
        assert_eq!(encode_uint(300), vec![0x01, 0x2C]);
        assert_eq!(decode_uint(&[]), 0);
        assert_eq!(decode_uint(&[0x01, 0x2C]), 300);
    }

    #[test]
    fn test_options() {
        let mut msg = Message::request(Code::GET, 1, vec![0xAB]);
        msg.set_uri_path(&["3", "0", "1"])
            .set_content_format(ContentFormat::SenmlJson)
            .set_observe(0);

        assert_eq!(msg.uri_path(), vec!["3", "0", "1"]);
        assert_eq!(msg.content_format(), Some(ContentFormat::SenmlJson));
        assert_eq!(msg.observe(), Some(0));
        assert_eq!(msg.accept(), None);

        msg.set_observe(7);
        assert_eq!(msg.option_values(option::OBSERVE).count(), 1);
        assert_eq!(msg.observe(), Some(7));
    }

    #[test]
    fn test_piggybacked_response() {
        let request = Message::request(Code::GET, 0x1234, vec![1, 2, 3]);
        let response = Message::piggybacked_response(&request, Code::CONTENT);
        assert_eq!(response.message_type, MessageType::Acknowledgement);
        assert_eq!(response.message_id, 0x1234);
        assert_eq!(response.token, vec![1, 2, 3]);
    }

    #[test]
    fn test_display() {
        let mut msg = Message::request(Code::POST, 10, vec![0x0a, 0xff]);
        msg.set_uri_path(&["rd"]);
        assert_eq!(msg.to_string(), "CON POST mid=10 token=0aff /rd");
    }
}
