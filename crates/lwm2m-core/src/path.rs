//! LwM2M path parsing and matching.
//!
//! LwM2M paths are slash-separated numeric identifiers like "/3303/0/5700"
//! (object / instance / resource, optionally followed by a resource
//! instance). This module parses them from strings or CoAP Uri-Path
//! segments and answers prefix questions used by Discover, multi-resource
//! Read and observe pruning.

use std::fmt;
use std::str::FromStr;

/// Identifier 65535 is reserved in LwM2M.
pub const MAX_ID: u16 = 65534;

/// A parsed LwM2M path.
///
/// Ordering follows the tree: an object sorts before its instances, an
/// instance before its resources. The store relies on this for range scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourcePath {
    object: u16,
    instance: Option<u16>,
    resource: Option<u16>,
    resource_instance: Option<u16>,
}

impl ResourcePath {
    /// Path to an object, e.g. "/3".
    pub const fn object(object: u16) -> Self {
        Self {
            object,
            instance: None,
            resource: None,
            resource_instance: None,
        }
    }

    /// Path to an object instance, e.g. "/3/0".
    pub const fn instance(object: u16, instance: u16) -> Self {
        Self {
            object,
            instance: Some(instance),
            resource: None,
            resource_instance: None,
        }
    }

    /// Path to a single resource, e.g. "/3/0/1".
    pub const fn resource(object: u16, instance: u16, resource: u16) -> Self {
        Self {
            object,
            instance: Some(instance),
            resource: Some(resource),
            resource_instance: None,
        }
    }

    /// Path to a resource instance of a multiple resource, e.g. "/3/0/7/1".
    pub const fn resource_instance(object: u16, instance: u16, resource: u16, ri: u16) -> Self {
        Self {
            object,
            instance: Some(instance),
            resource: Some(resource),
            resource_instance: Some(ri),
        }
    }

    /// Build a path from CoAP Uri-Path segments.
    pub fn from_segments<S: AsRef<str>>(segments: &[S]) -> Result<Self, PathError> {
        let ids = segments
            .iter()
            .map(|s| parse_id(s.as_ref()))
            .collect::<Result<Vec<u16>, PathError>>()?;

        match ids.as_slice() {
            [] => Err(PathError::Empty),
            [o] => Ok(Self::object(*o)),
            [o, i] => Ok(Self::instance(*o, *i)),
            [o, i, r] => Ok(Self::resource(*o, *i, *r)),
            [o, i, r, ri] => Ok(Self::resource_instance(*o, *i, *r, *ri)),
            _ => Err(PathError::TooDeep(ids.len())),
        }
    }

    pub fn object_id(&self) -> u16 {
        self.object
    }

    pub fn instance_id(&self) -> Option<u16> {
        self.instance
    }

    pub fn resource_id(&self) -> Option<u16> {
        self.resource
    }

    pub fn resource_instance_id(&self) -> Option<u16> {
        self.resource_instance
    }

    /// Number of segments (1 = object, 2 = instance, 3 = resource, 4 = resource instance).
    pub fn depth(&self) -> usize {
        1 + usize::from(self.instance.is_some())
            + usize::from(self.resource.is_some())
            + usize::from(self.resource_instance.is_some())
    }

    /// True for "/o/i/r" and "/o/i/r/ri" paths.
    pub fn is_resource(&self) -> bool {
        self.resource.is_some()
    }

    /// The instance this path belongs to, if it is at least instance-deep.
    pub fn instance_path(&self) -> Option<ResourcePath> {
        self.instance.map(|i| Self::instance(self.object, i))
    }

    /// Path segments as strings, ready to be sent as Uri-Path options.
    pub fn segments(&self) -> Vec<String> {
        [
            Some(self.object),
            self.instance,
            self.resource,
            self.resource_instance,
        ]
        .iter()
        .flatten()
        .map(|id| id.to_string())
        .collect()
    }

    /// Check if this path equals or lies below `prefix`.
    pub fn starts_with(&self, prefix: &ResourcePath) -> bool {
        if prefix.depth() > self.depth() {
            return false;
        }
        self.object == prefix.object
            && (prefix.instance.is_none() || self.instance == prefix.instance)
            && (prefix.resource.is_none() || self.resource == prefix.resource)
            && (prefix.resource_instance.is_none()
                || self.resource_instance == prefix.resource_instance)
    }
}

fn parse_id(segment: &str) -> Result<u16, PathError> {
    let id: u16 = segment
        .parse()
        .map_err(|_| PathError::InvalidSegment(segment.to_string()))?;
    if id > MAX_ID {
        return Err(PathError::ReservedId);
    }
    Ok(id)
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.object)?;
        for id in [self.instance, self.resource, self.resource_instance]
            .iter()
            .flatten()
        {
            write!(f, "/{}", id)?;
        }
        Ok(())
    }
}

impl FromStr for ResourcePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('/').trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(PathError::Empty);
        }
        let segments: Vec<&str> = trimmed.split('/').collect();
        Self::from_segments(&segments)
    }
}

impl TryFrom<&str> for ResourcePath {
    type Error = PathError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Errors that can occur when parsing a path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("Empty path")]
    Empty,
    #[error("Invalid path segment: {0:?}")]
    InvalidSegment(String),
    #[error("Identifier 65535 is reserved")]
    ReservedId,
    #[error("Path has {0} segments, at most 4 are allowed")]
    TooDeep(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_parsing() {
        let path: ResourcePath = "/3303/0/5700".parse().unwrap();
        assert_eq!(path, ResourcePath::resource(3303, 0, 5700));
        assert_eq!(path.segments(), vec!["3303", "0", "5700"]);
        assert_eq!(path.to_string(), "/3303/0/5700");
        assert_eq!(path.depth(), 3);
    }

    #[test]
    fn test_leading_slash_optional() {
        let a: ResourcePath = "3/0".parse().unwrap();
        let b: ResourcePath = "/3/0/".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.depth(), 2);
    }

    #[test]
    fn test_invalid_paths() {
        assert_eq!("/".parse::<ResourcePath>(), Err(PathError::Empty));
        assert!(matches!(
            "/3/x".parse::<ResourcePath>(),
            Err(PathError::InvalidSegment(_))
        ));
        assert_eq!(
            "/3/65535".parse::<ResourcePath>(),
            Err(PathError::ReservedId)
        );
        assert_eq!(
            "/1/2/3/4/5".parse::<ResourcePath>(),
            Err(PathError::TooDeep(5))
        );
    }

    #[test]
    fn test_path_starts_with() {
        let path = ResourcePath::resource(3, 0, 1);
        assert!(path.starts_with(&ResourcePath::object(3)));
        assert!(path.starts_with(&ResourcePath::instance(3, 0)));
        assert!(path.starts_with(&path));

        assert!(!path.starts_with(&ResourcePath::instance(3, 1)));
        assert!(!path.starts_with(&ResourcePath::object(1)));
        assert!(!ResourcePath::instance(3, 0).starts_with(&path));
    }

    #[test]
    fn test_tree_ordering() {
        let mut paths = vec![
            ResourcePath::resource(3, 0, 1),
            ResourcePath::instance(3, 0),
            ResourcePath::object(3),
            ResourcePath::resource(1, 0, 1),
        ];
        paths.sort();
        assert_eq!(
            paths,
            vec![
                ResourcePath::resource(1, 0, 1),
                ResourcePath::object(3),
                ResourcePath::instance(3, 0),
                ResourcePath::resource(3, 0, 1),
            ]
        );
    }
}
