//! LwM2M operations carried over CoAP.
//!
//! Inbound server requests (Device Management and Information Reporting
//! interfaces) are mapped onto [`Operation`]; outbound Registration
//! interface requests are built by [`register_request`], [`update_request`]
//! and [`deregister_request`].

use lwm2m_core::{PathError, ResourcePath};
use thiserror::Error;

use crate::content::{format_links, Link};
use crate::message::{Code, ContentFormat, Message};

/// LwM2M enabler version announced on registration.
pub const LWM2M_VERSION: &str = "1.1";

/// Registration resource on the server.
pub const REGISTRATION_PATH: &str = "rd";

/// Errors that can occur while interpreting an inbound request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OperationError {
    #[error("Invalid path: {0}")]
    InvalidPath(#[from] PathError),

    #[error("Method {method} not allowed on {path}")]
    MethodNotAllowed { method: Code, path: String },

    #[error("Invalid attribute {0:?}")]
    InvalidAttribute(String),

    #[error("Unsupported content format {0}")]
    UnsupportedContentFormat(u16),
}

impl OperationError {
    /// Response code reported to the server.
    pub fn code(&self) -> Code {
        match self {
            OperationError::InvalidPath(PathError::Empty) => Code::METHOD_NOT_ALLOWED,
            OperationError::InvalidPath(_) => Code::BAD_REQUEST,
            OperationError::MethodNotAllowed { .. } => Code::METHOD_NOT_ALLOWED,
            OperationError::InvalidAttribute(_) => Code::BAD_REQUEST,
            OperationError::UnsupportedContentFormat(_) => Code::UNSUPPORTED_CONTENT_FORMAT,
        }
    }
}

/// Notification attribute names accepted by Write-Attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    MinPeriod,
    MaxPeriod,
    GreaterThan,
    LessThan,
    Step,
}

impl Attribute {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "pmin" => Some(Attribute::MinPeriod),
            "pmax" => Some(Attribute::MaxPeriod),
            "gt" => Some(Attribute::GreaterThan),
            "lt" => Some(Attribute::LessThan),
            "st" => Some(Attribute::Step),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Attribute::MinPeriod => "pmin",
            Attribute::MaxPeriod => "pmax",
            Attribute::GreaterThan => "gt",
            Attribute::LessThan => "lt",
            Attribute::Step => "st",
        }
    }
}

/// Notification attributes attached to a path.
///
/// `pmin`/`pmax` are in seconds. `gt`, `lt` and `st` only apply to numeric
/// resources.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NotificationAttributes {
    pub pmin: Option<u32>,
    pub pmax: Option<u32>,
    pub gt: Option<f64>,
    pub lt: Option<f64>,
    pub st: Option<f64>,
}

/// One Write-Attributes change: a new value, or `None` to clear it.
pub type AttributeChange = (Attribute, Option<f64>);

impl NotificationAttributes {
    /// Parse Uri-Query entries such as `pmin=10` or `gt` (clear).
    pub fn parse_changes<S: AsRef<str>>(queries: &[S]) -> Result<Vec<AttributeChange>, OperationError> {
        queries
            .iter()
            .map(|query| {
                let query = query.as_ref();
                let (name, value) = match query.split_once('=') {
                    Some((name, value)) => (name, Some(value)),
                    None => (query, None),
                };
                let attribute = Attribute::parse(name)
                    .ok_or_else(|| OperationError::InvalidAttribute(query.to_string()))?;

                let value = value
                    .map(|v| {
                        v.parse::<f64>()
                            .ok()
                            .filter(|n| n.is_finite())
                            .ok_or_else(|| OperationError::InvalidAttribute(query.to_string()))
                    })
                    .transpose()?;

                let is_period = matches!(attribute, Attribute::MinPeriod | Attribute::MaxPeriod);
                if let (true, Some(n)) = (is_period, value) {
                    if n < 0.0 || n.fract() != 0.0 || n > f64::from(u32::MAX) {
                        return Err(OperationError::InvalidAttribute(query.to_string()));
                    }
                }
                if let (Attribute::Step, Some(n)) = (attribute, value) {
                    if n <= 0.0 {
                        return Err(OperationError::InvalidAttribute(query.to_string()));
                    }
                }
                Ok((attribute, value))
            })
            .collect()
    }

    /// Apply changes, rejecting a result where `pmax < pmin` or `lt >= gt`.
    pub fn apply(&mut self, changes: &[AttributeChange]) -> Result<(), OperationError> {
        let mut next = *self;
        for (attribute, value) in changes {
            match attribute {
                Attribute::MinPeriod => next.pmin = value.map(|v| v as u32),
                Attribute::MaxPeriod => next.pmax = value.map(|v| v as u32),
                Attribute::GreaterThan => next.gt = *value,
                Attribute::LessThan => next.lt = *value,
                Attribute::Step => next.st = *value,
            }
        }

        if let (Some(pmin), Some(pmax)) = (next.pmin, next.pmax) {
            if pmax < pmin {
                return Err(OperationError::InvalidAttribute(format!(
                    "pmax={} below pmin={}",
                    pmax, pmin
                )));
            }
        }
        if let (Some(gt), Some(lt)) = (next.gt, next.lt) {
            if lt >= gt {
                return Err(OperationError::InvalidAttribute(format!(
                    "lt={} not below gt={}",
                    lt, gt
                )));
            }
        }

        *self = next;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Add the set attributes to a Discover link.
    pub fn annotate(&self, mut link: Link) -> Link {
        if let Some(v) = self.pmin {
            link = link.with_attribute("pmin", v);
        }
        if let Some(v) = self.pmax {
            link = link.with_attribute("pmax", v);
        }
        if let Some(v) = self.gt {
            link = link.with_attribute("gt", v);
        }
        if let Some(v) = self.lt {
            link = link.with_attribute("lt", v);
        }
        if let Some(v) = self.st {
            link = link.with_attribute("st", v);
        }
        link
    }
}

/// An inbound LwM2M operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// GET on an object, instance or resource.
    Read {
        path: ResourcePath,
        accept: Option<ContentFormat>,
    },
    /// GET with Accept: application/link-format.
    Discover { path: ResourcePath },
    /// PUT (replace) or POST (partial update) with a payload.
    Write {
        path: ResourcePath,
        format: ContentFormat,
        payload: Vec<u8>,
        replace: bool,
    },
    /// PUT with Uri-Query attributes and no payload.
    WriteAttributes {
        path: ResourcePath,
        changes: Vec<AttributeChange>,
    },
    /// POST on a resource; the payload carries the arguments.
    Execute { path: ResourcePath, args: String },
    /// GET with Observe: 0.
    Observe {
        path: ResourcePath,
        accept: Option<ContentFormat>,
    },
    /// GET with Observe: 1.
    CancelObserve { path: ResourcePath },
    /// DELETE on an object instance.
    Delete { path: ResourcePath },
}

impl Operation {
    /// Interpret an inbound CoAP request.
    pub fn from_request(request: &Message) -> Result<Self, OperationError> {
        let path = ResourcePath::from_segments(&request.uri_path())?;
        let not_allowed = || OperationError::MethodNotAllowed {
            method: request.code,
            path: path.to_string(),
        };

        match request.code {
            Code::GET => match (request.observe(), request.accept()) {
                (Some(0), accept) => Ok(Operation::Observe { path, accept }),
                (Some(1), _) => Ok(Operation::CancelObserve { path }),
                (_, Some(ContentFormat::LinkFormat)) => Ok(Operation::Discover { path }),
                (_, accept) => Ok(Operation::Read { path, accept }),
            },
            Code::PUT if request.payload.is_empty() && !request.uri_query().is_empty() => {
                let changes = NotificationAttributes::parse_changes(&request.uri_query())?;
                Ok(Operation::WriteAttributes { path, changes })
            }
            // POST on a resource is Execute, on an instance it is a partial write.
            Code::PUT | Code::POST
                if path.depth() >= 2 && !(request.code == Code::POST && path.is_resource()) =>
            {
                let format = request.content_format().unwrap_or(ContentFormat::TextPlain);
                if let ContentFormat::Other(n) = format {
                    return Err(OperationError::UnsupportedContentFormat(n));
                }
                Ok(Operation::Write {
                    path,
                    format,
                    payload: request.payload.clone(),
                    replace: request.code == Code::PUT,
                })
            }
            Code::POST if path.is_resource() && path.resource_instance_id().is_none() => {
                Ok(Operation::Execute {
                    path,
                    args: String::from_utf8_lossy(&request.payload).into_owned(),
                })
            }
            Code::DELETE if path.depth() == 2 => Ok(Operation::Delete { path }),
            _ => Err(not_allowed()),
        }
    }

    pub fn path(&self) -> &ResourcePath {
        match self {
            Operation::Read { path, .. }
            | Operation::Discover { path }
            | Operation::Write { path, .. }
            | Operation::WriteAttributes { path, .. }
            | Operation::Execute { path, .. }
            | Operation::Observe { path, .. }
            | Operation::CancelObserve { path }
            | Operation::Delete { path } => path,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Read { .. } => "read",
            Operation::Discover { .. } => "discover",
            Operation::Write { .. } => "write",
            Operation::WriteAttributes { .. } => "write-attributes",
            Operation::Execute { .. } => "execute",
            Operation::Observe { .. } => "observe",
            Operation::CancelObserve { .. } => "cancel-observe",
            Operation::Delete { .. } => "delete",
        }
    }
}

// ============================================================================
// Registration interface
// ============================================================================

/// Build `POST /rd?ep=<name>&lt=<lifetime>&lwm2m=1.1&b=U` with the object
/// instance list as payload.
///
/// Message ID and token are assigned by the transport.
pub fn register_request(endpoint: &str, lifetime: u32, objects: &[ResourcePath]) -> Message {
    let mut request = Message::request(Code::POST, 0, Vec::new());
    request
        .set_uri_path(&[REGISTRATION_PATH])
        .add_uri_query(&format!("ep={}", endpoint))
        .add_uri_query(&format!("lt={}", lifetime))
        .add_uri_query(&format!("lwm2m={}", LWM2M_VERSION))
        .add_uri_query("b=U")
        .set_content_format(ContentFormat::LinkFormat)
        .set_payload(object_links(objects).into_bytes());
    request
}

/// Build `POST /rd/<id>`. Lifetime and object list are only sent when they
/// changed.
pub fn update_request(
    location: &[String],
    lifetime: Option<u32>,
    objects: Option<&[ResourcePath]>,
) -> Message {
    let mut request = Message::request(Code::POST, 0, Vec::new());
    request.set_uri_path(location);
    if let Some(lifetime) = lifetime {
        request.add_uri_query(&format!("lt={}", lifetime));
    }
    if let Some(objects) = objects {
        request
            .set_content_format(ContentFormat::LinkFormat)
            .set_payload(object_links(objects).into_bytes());
    }
    request
}

/// Build `DELETE /rd/<id>`.
pub fn deregister_request(location: &[String]) -> Message {
    let mut request = Message::request(Code::DELETE, 0, Vec::new());
    request.set_uri_path(location);
    request
}

fn object_links(objects: &[ResourcePath]) -> String {
    let links: Vec<Link> = objects.iter().copied().map(Link::from).collect();
    format_links(&links)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::option;

    fn request(code: Code, path: &[&str]) -> Message {
        let mut msg = Message::request(code, 1, vec![0x01]);
        msg.set_uri_path(path);
        msg
    }

    #[test]
    fn test_read_and_discover() {
        let msg = request(Code::GET, &["3", "0", "1"]);
        assert_eq!(
            Operation::from_request(&msg).unwrap(),
            Operation::Read {
                path: ResourcePath::resource(3, 0, 1),
                accept: None
            }
        );

        let mut msg = request(Code::GET, &["3"]);
        msg.add_uint_option(option::ACCEPT, 40);
        assert_eq!(
            Operation::from_request(&msg).unwrap(),
            Operation::Discover {
                path: ResourcePath::object(3)
            }
        );
    }

    #[test]
    fn test_observe_and_cancel() {
        let mut msg = request(Code::GET, &["3303", "0", "5700"]);
        msg.set_observe(0);
        assert!(matches!(
            Operation::from_request(&msg).unwrap(),
            Operation::Observe { .. }
        ));

        msg.set_observe(1);
        assert_eq!(
            Operation::from_request(&msg).unwrap(),
            Operation::CancelObserve {
                path: ResourcePath::resource(3303, 0, 5700)
            }
        );
    }

    #[test]
    fn test_write_and_execute() {
        let mut msg = request(Code::PUT, &["3", "0", "1"]);
        msg.set_content_format(ContentFormat::TextPlain)
            .set_payload(b"newName".to_vec());
        assert_eq!(
            Operation::from_request(&msg).unwrap(),
            Operation::Write {
                path: ResourcePath::resource(3, 0, 1),
                format: ContentFormat::TextPlain,
                payload: b"newName".to_vec(),
                replace: true,
            }
        );

        let mut msg = request(Code::POST, &["3", "0", "4"]);
        msg.set_payload(b"0='now'".to_vec());
        assert_eq!(
            Operation::from_request(&msg).unwrap(),
            Operation::Execute {
                path: ResourcePath::resource(3, 0, 4),
                args: "0='now'".to_string()
            }
        );

        let msg = request(Code::POST, &["3", "0"]);
        assert!(matches!(
            Operation::from_request(&msg).unwrap(),
            Operation::Write { replace: false, .. }
        ));
    }

    #[test]
    fn test_method_not_allowed() {
        let msg = request(Code::POST, &["3"]);
        let err = Operation::from_request(&msg).unwrap_err();
        assert_eq!(err.code(), Code::METHOD_NOT_ALLOWED);

        let msg = request(Code::DELETE, &["3", "0", "1"]);
        assert!(Operation::from_request(&msg).is_err());

        let msg = request(Code::DELETE, &["3303", "0"]);
        assert!(matches!(
            Operation::from_request(&msg).unwrap(),
            Operation::Delete { .. }
        ));
    }

    #[test]
    fn test_bad_path() {
        let msg = request(Code::GET, &["3", "abc"]);
        assert_eq!(
            Operation::from_request(&msg).unwrap_err().code(),
            Code::BAD_REQUEST
        );
    }

    #[test]
    fn test_write_attributes() {
        let mut msg = request(Code::PUT, &["3303", "0", "5700"]);
        msg.add_uri_query("pmin=10").add_uri_query("pmax=60").add_uri_query("st");

        let op = Operation::from_request(&msg).unwrap();
        let Operation::WriteAttributes { changes, .. } = op else {
            panic!("Expected WriteAttributes");
        };
        assert_eq!(
            changes,
            vec![
                (Attribute::MinPeriod, Some(10.0)),
                (Attribute::MaxPeriod, Some(60.0)),
                (Attribute::Step, None),
            ]
        );

        let mut attrs = NotificationAttributes::default();
        attrs.apply(&changes).unwrap();
        assert_eq!(attrs.pmin, Some(10));
        assert_eq!(attrs.pmax, Some(60));
    }

    #[test]
    fn test_invalid_attributes() {
        assert!(NotificationAttributes::parse_changes(&["epmin=1"]).is_err());
        assert!(NotificationAttributes::parse_changes(&["pmin=-1"]).is_err());
        assert!(NotificationAttributes::parse_changes(&["pmax=1.5"]).is_err());
        assert!(NotificationAttributes::parse_changes(&["st=0"]).is_err());
        assert!(NotificationAttributes::parse_changes(&["gt=abc"]).is_err());

        let mut attrs = NotificationAttributes::default();
        let changes = NotificationAttributes::parse_changes(&["pmin=60", "pmax=10"]).unwrap();
        assert!(attrs.apply(&changes).is_err());
        assert!(attrs.is_empty());

        let changes = NotificationAttributes::parse_changes(&["gt=10", "lt=20"]).unwrap();
        assert!(attrs.apply(&changes).is_err());
    }

    #[test]
    fn test_annotate_link() {
        let attrs = NotificationAttributes {
            pmin: Some(5),
            gt: Some(30.5),
            ..Default::default()
        };
        let link = attrs.annotate(Link::from(ResourcePath::resource(3303, 0, 5700)));
        assert_eq!(link.to_string(), "</3303/0/5700>;pmin=5;gt=30.5");
    }

    #[test]
    fn test_register_request() {
        let objects = [ResourcePath::instance(1, 0), ResourcePath::instance(3, 0)];
        let msg = register_request("dev1", 300, &objects);

        assert_eq!(msg.code, Code::POST);
        assert_eq!(msg.uri_path(), vec!["rd"]);
        assert_eq!(msg.uri_query(), vec!["ep=dev1", "lt=300", "lwm2m=1.1", "b=U"]);
        assert_eq!(msg.content_format(), Some(ContentFormat::LinkFormat));
        assert_eq!(msg.payload, b"</1/0>,</3/0>");
    }

    #[test]
    fn test_update_and_deregister_requests() {
        let location = vec!["rd".to_string(), "5a3f".to_string()];

        let update = update_request(&location, None, None);
        assert_eq!(update.code, Code::POST);
        assert_eq!(update.uri_path(), vec!["rd", "5a3f"]);
        assert!(update.payload.is_empty());

        let update = update_request(&location, Some(600), None);
        assert_eq!(update.uri_query(), vec!["lt=600"]);

        let dereg = deregister_request(&location);
        assert_eq!(dereg.code, Code::DELETE);
        assert_eq!(dereg.uri_path(), vec!["rd", "5a3f"]);
    }
}
