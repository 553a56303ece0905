//! LwM2M payload content formats.
//!
//! - text/plain (0) and opaque (42) for single resources
//! - CoRE link format (40) for registration and Discover
//! - SenML JSON (110) for multi-resource Read and Write

use std::fmt;

use lwm2m_core::{ResourcePath, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::ContentFormat;

/// Errors that can occur while decoding a payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentError {
    #[error("Invalid link format: {0}")]
    InvalidLink(String),

    #[error("Invalid SenML payload: {0}")]
    InvalidSenml(String),

    #[error("SenML record has no value: {0}")]
    MissingValue(String),

    #[error("Invalid base64 in SenML data value")]
    InvalidBase64,
}

// ============================================================================
// text/plain and opaque
// ============================================================================

/// Encode a single value, choosing opaque for byte strings and text/plain
/// for everything else.
pub fn encode_single(value: &Value) -> (ContentFormat, Vec<u8>) {
    match value {
        Value::Opaque(bytes) => (ContentFormat::Opaque, bytes.clone()),
        other => (ContentFormat::TextPlain, other.to_text()),
    }
}

// ============================================================================
// CoRE link format
// ============================================================================

/// A single `<target>;attr=value` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub target: String,
    pub attributes: Vec<(String, Option<String>)>,
}

impl Link {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.push((name.into(), Some(value.to_string())));
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }
}

impl From<ResourcePath> for Link {
    fn from(path: ResourcePath) -> Self {
        Link::new(path.to_string())
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.target)?;
        for (name, value) in &self.attributes {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

/// Serialize links as a comma-separated link-format document.
pub fn format_links(links: &[Link]) -> String {
    links
        .iter()
        .map(Link::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a link-format document.
pub fn parse_links(text: &str) -> Result<Vec<Link>, ContentError> {
    text.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.split(';');
            let target = parts
                .next()
                .and_then(|t| t.trim().strip_prefix('<'))
                .and_then(|t| t.strip_suffix('>'))
                .ok_or_else(|| ContentError::InvalidLink(entry.to_string()))?;

            let attributes = parts
                .map(|attr| match attr.split_once('=') {
                    Some((name, value)) => (
                        name.trim().to_string(),
                        Some(value.trim().trim_matches('"').to_string()),
                    ),
                    None => (attr.trim().to_string(), None),
                })
                .collect();

            Ok(Link {
                target: target.to_string(),
                attributes,
            })
        })
        .collect()
}

// ============================================================================
// SenML JSON
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct Record {
    #[serde(skip_serializing_if = "Option::is_none")]
    bn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    v: Option<serde_json::Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vb: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vd: Option<String>,
}

/// Encode values under `base` as a SenML JSON array.
///
/// The first record carries the base name (`/3/0/`); every record names its
/// resource relative to it.
pub fn encode_senml(base: &ResourcePath, values: &[(ResourcePath, Value)]) -> Vec<u8> {
    let base_name = format!("{}/", base);
    let records: Vec<Record> = values
        .iter()
        .enumerate()
        .map(|(i, (path, value))| {
            let full = path.to_string();
            let relative = full
                .strip_prefix(base_name.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| full.clone());

            let mut record = Record {
                bn: (i == 0).then(|| base_name.clone()),
                n: Some(relative),
                ..Default::default()
            };
            match value {
                Value::Integer(v) => record.v = Some((*v).into()),
                Value::Float(v) => {
                    record.v = serde_json::Number::from_f64(*v);
                }
                Value::String(s) => record.vs = Some(s.clone()),
                Value::Boolean(b) => record.vb = Some(*b),
                Value::Opaque(bytes) => record.vd = Some(base64url_encode(bytes)),
            }
            record
        })
        .collect();

    // A Vec of plain structs cannot fail to serialize.
    serde_json::to_vec(&records).unwrap_or_default()
}

/// Decode a SenML JSON payload into absolute paths and loosely typed values.
///
/// Numbers without a fractional part decode as integers; the store widens
/// them where the resource is a float.
pub fn decode_senml(payload: &[u8]) -> Result<Vec<(ResourcePath, Value)>, ContentError> {
    let records: Vec<Record> = serde_json::from_slice(payload)
        .map_err(|e| ContentError::InvalidSenml(e.to_string()))?;

    let mut base = String::new();
    let mut values = Vec::with_capacity(records.len());

    for record in records {
        if let Some(bn) = record.bn {
            base = bn;
        }
        let name = format!("{}{}", base, record.n.unwrap_or_default());
        let path: ResourcePath = name
            .parse()
            .map_err(|e| ContentError::InvalidSenml(format!("{}: {}", name, e)))?;

        let value = if let Some(n) = record.v {
            match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            }
        } else if let Some(s) = record.vs {
            Value::String(s)
        } else if let Some(b) = record.vb {
            Value::Boolean(b)
        } else if let Some(d) = record.vd {
            Value::Opaque(base64url_decode(&d)?)
        } else {
            return Err(ContentError::MissingValue(name));
        };

        values.push((path, value));
    }

    Ok(values)
}

const BASE64URL: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Unpadded base64url, as used by SenML data values.
fn base64url_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4 / 3 + 3);
    for chunk in bytes.chunks(3) {
        let n = chunk
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, b)| acc | (u32::from(*b) << (16 - 8 * i)));
        for i in 0..=chunk.len() {
            out.push(char::from(BASE64URL[((n >> (18 - 6 * i)) & 0x3F) as usize]));
        }
    }
    out
}

fn base64url_decode(text: &str) -> Result<Vec<u8>, ContentError> {
    let sextets = text
        .trim_end_matches('=')
        .bytes()
        .map(|c| {
            BASE64URL
                .iter()
                .position(|b| *b == c)
                .map(|p| p as u32)
                .ok_or(ContentError::InvalidBase64)
        })
        .collect::<Result<Vec<u32>, _>>()?;

    if sextets.len() % 4 == 1 {
        return Err(ContentError::InvalidBase64);
    }

    let mut out = Vec::with_capacity(sextets.len() * 3 / 4);
    for chunk in sextets.chunks(4) {
        let n = chunk
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, s)| acc | (s << (18 - 6 * i)));
        for i in 0..chunk.len() - 1 {
            out.push((n >> (16 - 8 * i)) as u8);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_single() {
        assert_eq!(
            encode_single(&Value::Integer(42)),
            (ContentFormat::TextPlain, b"42".to_vec())
        );
        assert_eq!(
            encode_single(&Value::Boolean(true)),
            (ContentFormat::TextPlain, b"1".to_vec())
        );
        assert_eq!(
            encode_single(&Value::Opaque(vec![1, 2])),
            (ContentFormat::Opaque, vec![1, 2])
        );
    }

    #[test]
    fn test_link_format() {
        let links = vec![
            Link::from(ResourcePath::instance(1, 0)),
            Link::from(ResourcePath::resource(3303, 0, 5700)).with_attribute("pmin", 10),
        ];
        let text = format_links(&links);
        assert_eq!(text, "</1/0>,</3303/0/5700>;pmin=10");

        let parsed = parse_links(&text).unwrap();
        assert_eq!(parsed, links);
        assert_eq!(parsed[1].attribute("pmin"), Some("10"));
    }

    #[test]
    fn test_parse_links_with_quoted_attribute() {
        let parsed = parse_links(r#"</>;rt="oma.lwm2m";ct=110, </3/0>"#).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].attribute("rt"), Some("oma.lwm2m"));
        assert_eq!(parsed[1].target, "/3/0");

        assert!(parse_links("/3/0").is_err());
    }

    #[test]
    fn test_senml_encode() {
        let base = ResourcePath::instance(3, 0);
        let values = vec![
            (ResourcePath::resource(3, 0, 0), Value::from("Acme")),
            (ResourcePath::resource(3, 0, 9), Value::Integer(95)),
            (ResourcePath::resource(3, 0, 20), Value::Boolean(true)),
        ];
        let json: serde_json::Value =
            serde_json::from_slice(&encode_senml(&base, &values)).unwrap();

        assert_eq!(
            json,
            serde_json::json!([
                { "bn": "/3/0/", "n": "0", "vs": "Acme" },
                { "n": "9", "v": 95 },
                { "n": "20", "vb": true }
            ])
        );
    }

    #[test]
    fn test_senml_decode() {
        let payload = br#"[
            { "bn": "/3303/0/", "n": "5700", "v": 21.5 },
            { "n": "5701", "vs": "Cel" },
            { "n": "5750", "vd": "AQID" },
            { "bn": "/3/0/", "n": "13", "v": 1700000000 }
        ]"#;

        let values = decode_senml(payload).unwrap();
        assert_eq!(
            values,
            vec![
                (ResourcePath::resource(3303, 0, 5700), Value::Float(21.5)),
                (ResourcePath::resource(3303, 0, 5701), Value::from("Cel")),
                (ResourcePath::resource(3303, 0, 5750), Value::Opaque(vec![1, 2, 3])),
                (ResourcePath::resource(3, 0, 13), Value::Integer(1_700_000_000)),
            ]
        );
    }

    #[test]
    fn test_senml_decode_errors() {
        assert!(matches!(
            decode_senml(b"not json"),
            Err(ContentError::InvalidSenml(_))
        ));
        assert!(matches!(
            decode_senml(br#"[{ "bn": "/3/0/", "n": "1" }]"#),
            Err(ContentError::MissingValue(_))
        ));
        assert!(matches!(
            decode_senml(br#"[{ "bn": "/3/x/", "n": "1", "v": 1 }]"#),
            Err(ContentError::InvalidSenml(_))
        ));
    }

    #[test]
    fn test_base64url() {
        assert_eq!(base64url_encode(b""), "");
        assert_eq!(base64url_encode(b"f"), "Zg");
        assert_eq!(base64url_encode(b"fo"), "Zm8");
        assert_eq!(base64url_encode(b"foo"), "Zm9v");
        assert_eq!(base64url_encode(&[0xFB, 0xFF]), "-_8");
        assert_eq!(base64url_decode("Zm9vYg").unwrap(), b"foob");
        assert_eq!(base64url_decode("Zm8=").unwrap(), b"fo");
        assert_eq!(base64url_decode("Z"), Err(ContentError::InvalidBase64));
    }
}
