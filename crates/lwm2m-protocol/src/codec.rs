//! CoAP binary codec (RFC 7252 section 3).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! |   Options (if any) ...
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! ```

use crate::message::{CoapOption, Code, Message, MessageType};
use thiserror::Error;

const VERSION: u8 = 1;
const PAYLOAD_MARKER: u8 = 0xFF;
const MAX_TOKEN_LENGTH: usize = 8;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Message is shorter than the 4-byte header ({0} bytes)")]
    TooShort(usize),

    #[error("Unsupported CoAP version {0}")]
    InvalidVersion(u8),

    #[error("Invalid token length {0}")]
    InvalidTokenLength(usize),

    #[error("Reserved option nibble 15 outside the payload marker")]
    ReservedOptionNibble,

    #[error("Message truncated inside {0}")]
    Truncated(&'static str),

    #[error("Payload marker followed by an empty payload")]
    EmptyPayload,

    #[error("Empty message carries a token, options or payload")]
    NonEmptyEmptyMessage,

    #[error("Option value of {0} bytes is too long")]
    OptionTooLong(usize),

    #[error("Encoded message is {size} bytes, limit is {limit}")]
    MessageTooLarge { size: usize, limit: usize },
}

/// Encode a message into its wire representation.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    if message.token.len() > MAX_TOKEN_LENGTH {
        return Err(CodecError::InvalidTokenLength(message.token.len()));
    }
    if message.code.is_empty()
        && (!message.token.is_empty() || !message.options.is_empty() || !message.payload.is_empty())
    {
        return Err(CodecError::NonEmptyEmptyMessage);
    }

    let mut buffer = Vec::with_capacity(16 + message.token.len() + message.payload.len());
    buffer.push((VERSION << 6) | ((message.message_type as u8) << 4) | message.token.len() as u8);
    buffer.push(message.code.0);
    buffer.extend_from_slice(&message.message_id.to_be_bytes());
    buffer.extend_from_slice(&message.token);

    // Options must appear in ascending order; the sort is stable so
    // repeated options (Uri-Path) keep their relative order.
    let mut options: Vec<&CoapOption> = message.options.iter().collect();
    options.sort_by_key(|o| o.number);

    let mut previous = 0u16;
    for option in options {
        let delta = option.number - previous;
        let length = option.value.len();
        if length > usize::from(u16::MAX) + 269 {
            return Err(CodecError::OptionTooLong(length));
        }

        let (delta_nibble, delta_ext) = split_extended(usize::from(delta));
        let (length_nibble, length_ext) = split_extended(length);
        buffer.push((delta_nibble << 4) | length_nibble);
        buffer.extend_from_slice(&delta_ext);
        buffer.extend_from_slice(&length_ext);
        buffer.extend_from_slice(&option.value);
        previous = option.number;
    }

    if !message.payload.is_empty() {
        buffer.push(PAYLOAD_MARKER);
        buffer.extend_from_slice(&message.payload);
    }

    Ok(buffer)
}

/// Encode a message, refusing to produce a datagram over `limit` bytes.
pub fn encode_limited(message: &Message, limit: usize) -> Result<Vec<u8>, CodecError> {
    let bytes = encode(message)?;
    if bytes.len() > limit {
        return Err(CodecError::MessageTooLarge {
            size: bytes.len(),
            limit,
        });
    }
    Ok(bytes)
}

/// Split an option delta or length into its 4-bit nibble and extended bytes.
fn split_extended(value: usize) -> (u8, Vec<u8>) {
    match value {
        0..=12 => (value as u8, Vec::new()),
        13..=268 => (13, vec![(value - 13) as u8]),
        _ => (14, ((value - 269) as u16).to_be_bytes().to_vec()),
    }
}

/// Decode a datagram into a message.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    if bytes.len() < 4 {
        return Err(CodecError::TooShort(bytes.len()));
    }

    let version = bytes[0] >> 6;
    if version != VERSION {
        return Err(CodecError::InvalidVersion(version));
    }
    // Two bits can only hold valid message types.
    let message_type = MessageType::from_u8((bytes[0] >> 4) & 0x03)
        .ok_or(CodecError::InvalidVersion(version))?;
    let token_length = usize::from(bytes[0] & 0x0F);
    if token_length > MAX_TOKEN_LENGTH {
        return Err(CodecError::InvalidTokenLength(token_length));
    }
    let code = Code(bytes[1]);
    let message_id = u16::from_be_bytes([bytes[2], bytes[3]]);

    let mut offset = 4;
    let token = bytes
        .get(offset..offset + token_length)
        .ok_or(CodecError::Truncated("token"))?
        .to_vec();
    offset += token_length;

    let mut options = Vec::new();
    let mut number = 0u16;
    let mut payload = Vec::new();

    while offset < bytes.len() {
        let byte = bytes[offset];
        offset += 1;

        if byte == PAYLOAD_MARKER {
            if offset == bytes.len() {
                return Err(CodecError::EmptyPayload);
            }
            payload = bytes[offset..].to_vec();
            break;
        }

        let delta = read_extended(bytes, &mut offset, byte >> 4, "option delta")?;
        let length = read_extended(bytes, &mut offset, byte & 0x0F, "option length")?;

        number = u16::try_from(usize::from(number) + delta)
            .map_err(|_| CodecError::Truncated("option number"))?;
        let value = bytes
            .get(offset..offset + length)
            .ok_or(CodecError::Truncated("option value"))?
            .to_vec();
        offset += length;

        options.push(CoapOption { number, value });
    }

    if code.is_empty() && (!token.is_empty() || !options.is_empty() || !payload.is_empty()) {
        return Err(CodecError::NonEmptyEmptyMessage);
    }

    Ok(Message {
        message_type,
        code,
        message_id,
        token,
        options,
        payload,
    })
}

fn read_extended(
    bytes: &[u8],
    offset: &mut usize,
    nibble: u8,
    context: &'static str,
) -> Result<usize, CodecError> {
    match nibble {
        0..=12 => Ok(usize::from(nibble)),
        13 => {
            let b = *bytes.get(*offset).ok_or(CodecError::Truncated(context))?;
            *offset += 1;
            Ok(usize::from(b) + 13)
        }
        14 => {
            let ext = bytes
                .get(*offset..*offset + 2)
                .ok_or(CodecError::Truncated(context))?;
            *offset += 2;
            Ok(usize::from(u16::from_be_bytes([ext[0], ext[1]])) + 269)
        }
        _ => Err(CodecError::ReservedOptionNibble),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{option, ContentFormat};

    #[test]
    fn test_encode_get() {
        let mut msg = Message::request(Code::GET, 0x7d34, vec![]);
        msg.set_uri_path(&["temperature"]);

        let bytes = encode(&msg).unwrap();
        // RFC 7252 Figure 16 style: CON GET, Uri-Path "temperature"
        assert_eq!(&bytes[..4], &[0x40, 0x01, 0x7d, 0x34]);
        assert_eq!(bytes[4], 0xBB);
        assert_eq!(&bytes[5..], b"temperature");
    }

    #[test]
    fn test_decode_piggybacked_content() {
        let bytes = [
            0x62, 0x45, 0x00, 0x2A, 0xCA, 0xFE, // ACK 2.05 mid 42, token cafe
            0xC1, 0x00, // Content-Format (12): text/plain
            0xFF, b'2', b'2',
        ];
        let msg = decode(&bytes).unwrap();
        assert_eq!(msg.message_type, MessageType::Acknowledgement);
        assert_eq!(msg.code, Code::CONTENT);
        assert_eq!(msg.message_id, 42);
        assert_eq!(msg.token, vec![0xCA, 0xFE]);
        assert_eq!(msg.content_format(), Some(ContentFormat::TextPlain));
        assert_eq!(msg.payload, b"22");
    }

    #[test]
    fn test_round_trip_with_extended_options() {
        let mut msg = Message::request(Code::POST, 1, vec![1, 2, 3, 4]);
        msg.set_uri_path(&["rd"])
            .add_uri_query("ep=a-rather-long-endpoint-name-that-needs-an-extended-length")
            .add_uri_query("lt=300")
            .set_content_format(ContentFormat::LinkFormat)
            .add_uint_option(option::SIZE1, 1152)
            .set_payload(b"</1/0>,</3/0>".to_vec());

        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded.uri_path(), vec!["rd"]);
        assert_eq!(decoded.uri_query(), msg.uri_query());
        assert_eq!(decoded.content_format(), Some(ContentFormat::LinkFormat));
        assert_eq!(decoded.uint_option(option::SIZE1), Some(1152));
        assert_eq!(decoded.payload, msg.payload);
    }

    #[test]
    fn test_option_order_is_stable() {
        let mut msg = Message::request(Code::GET, 1, vec![]);
        msg.set_observe(0);
        msg.set_uri_path(&["3", "0", "1"]);

        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded.options[0].number, option::OBSERVE);
        assert_eq!(decoded.uri_path(), vec!["3", "0", "1"]);
    }

    #[test]
    fn test_empty_messages() {
        let ack = encode(&Message::empty_ack(0x1234)).unwrap();
        assert_eq!(ack, vec![0x60, 0x00, 0x12, 0x34]);

        let rst = decode(&[0x70, 0x00, 0x00, 0x05]).unwrap();
        assert_eq!(rst.message_type, MessageType::Reset);
        assert!(rst.is_empty());
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode(&[0x40, 0x01]), Err(CodecError::TooShort(2)));
        assert_eq!(
            decode(&[0x80, 0x01, 0x00, 0x01]),
            Err(CodecError::InvalidVersion(2))
        );
        assert_eq!(
            decode(&[0x49, 0x01, 0x00, 0x01]),
            Err(CodecError::InvalidTokenLength(9))
        );
        assert_eq!(
            decode(&[0x42, 0x01, 0x00, 0x01, 0xAA]),
            Err(CodecError::Truncated("token"))
        );
        assert_eq!(
            decode(&[0x40, 0x01, 0x00, 0x01, 0xFF]),
            Err(CodecError::EmptyPayload)
        );
        assert_eq!(
            decode(&[0x40, 0x01, 0x00, 0x01, 0xB5, b'a']),
            Err(CodecError::Truncated("option value"))
        );
        assert_eq!(
            decode(&[0x41, 0x00, 0x00, 0x01, 0xAA]),
            Err(CodecError::NonEmptyEmptyMessage)
        );
    }

    #[test]
    fn test_size_limit() {
        let mut msg = Message::request(Code::POST, 1, vec![]);
        msg.set_payload(vec![0u8; 100]);
        assert!(matches!(
            encode_limited(&msg, 64),
            Err(CodecError::MessageTooLarge { limit: 64, .. })
        ));
        assert!(encode_limited(&msg, 1152).is_ok());
    }
}
