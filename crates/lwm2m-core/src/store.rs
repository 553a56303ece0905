//! LwM2M resource store.
//!
//! The store maintains the current value of every resource hosted by the
//! client and enforces access flags and types at the write boundary.

use std::collections::BTreeMap;

use crate::model::{ConversionError, Operations, Value, ValueKind};
use crate::path::ResourcePath;

/// Errors returned by store operations.
///
/// These are reported back to the requesting peer and never end a session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResourceError {
    #[error("Resource not found: {0}")]
    NotFound(ResourcePath),

    #[error("Operation not permitted on {0}")]
    Unauthorized(ResourcePath),

    #[error("Bad request for {path}: {reason}")]
    BadRequest { path: ResourcePath, reason: String },

    #[error("Resource is not executable: {0}")]
    NotExecutable(ResourcePath),
}

impl ResourceError {
    fn bad_request(path: &ResourcePath, err: ConversionError) -> Self {
        ResourceError::BadRequest {
            path: *path,
            reason: err.to_string(),
        }
    }
}

/// A single resource: access flags plus a value, unless the resource is
/// purely executable.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    value: Option<Value>,
    operations: Operations,
}

impl Resource {
    pub fn new(value: Option<Value>, operations: Operations) -> Self {
        Self { value, operations }
    }

    /// A read-only resource.
    pub fn readable(value: impl Into<Value>) -> Self {
        Self::new(Some(value.into()), Operations::READ)
    }

    /// A read-write resource.
    pub fn writable(value: impl Into<Value>) -> Self {
        Self::new(Some(value.into()), Operations::READ_WRITE)
    }

    /// An executable resource without a value.
    pub fn executable() -> Self {
        Self::new(None, Operations::EXECUTE)
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn operations(&self) -> Operations {
        self.operations
    }

    /// The declared type, taken from the current value.
    pub fn kind(&self) -> Option<ValueKind> {
        self.value.as_ref().map(Value::kind)
    }
}

/// Trait for resource storage implementations.
pub trait ResourceStore: Send + Sync {
    /// Access flags and value type of a resource, without reading it.
    fn describe(&self, path: &ResourcePath) -> Result<(Operations, Option<ValueKind>), ResourceError>;

    /// Read a single readable resource.
    fn get(&self, path: &ResourcePath) -> Result<Value, ResourceError>;

    /// Write a resource on behalf of a peer, honouring the writable flag.
    ///
    /// Returns `true` if the stored value changed.
    fn set(&mut self, path: &ResourcePath, value: Value) -> Result<bool, ResourceError>;

    /// Write a resource on behalf of the device itself (sensor readings),
    /// bypassing the writable flag but not the type.
    fn update(&mut self, path: &ResourcePath, value: Value) -> Result<bool, ResourceError>;

    /// Check that a resource may be executed. Side effects are up to the
    /// caller's execute handlers.
    fn execute(&self, path: &ResourcePath, args: &str) -> Result<(), ResourceError>;

    /// All readable values at or below `prefix`.
    fn read_tree(&self, prefix: &ResourcePath) -> Result<Vec<(ResourcePath, Value)>, ResourceError>;

    /// Instance and resource paths at or below `prefix`.
    fn discover(&self, prefix: &ResourcePath) -> Result<Vec<(ResourcePath, Operations)>, ResourceError>;

    /// Insert or replace a resource.
    fn insert(&mut self, path: ResourcePath, resource: Resource);

    /// Remove everything at or below `prefix`, returning the removed paths.
    fn remove(&mut self, prefix: &ResourcePath) -> Vec<ResourcePath>;

    /// Object instances hosted by the store, for registration payloads.
    fn object_links(&self) -> Vec<ResourcePath>;
}

/// In-memory resource store keyed by path.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    resources: BTreeMap<ResourcePath, Resource>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource(&self, path: &ResourcePath) -> Option<&Resource> {
        self.resources.get(path)
    }

    pub fn contains(&self, path: &ResourcePath) -> bool {
        self.resources.contains_key(path)
    }

    /// Get the number of resources in the store.
    pub fn path_count(&self) -> usize {
        self.resources.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourcePath, &Resource)> {
        self.resources.iter()
    }

    /// Entries at or below `prefix`, using the tree ordering of paths.
    fn subtree<'a>(
        &'a self,
        prefix: &'a ResourcePath,
    ) -> impl Iterator<Item = (&'a ResourcePath, &'a Resource)> + 'a {
        self.resources
            .range(*prefix..)
            .take_while(move |(path, _)| path.starts_with(prefix))
    }

    fn write_value(
        &mut self,
        path: &ResourcePath,
        value: Value,
        check_acl: bool,
    ) -> Result<bool, ResourceError> {
        let resource = self
            .resources
            .get_mut(path)
            .ok_or(ResourceError::NotFound(*path))?;

        if check_acl && !resource.operations.write {
            return Err(ResourceError::Unauthorized(*path));
        }

        let kind = resource.kind().ok_or_else(|| ResourceError::BadRequest {
            path: *path,
            reason: "resource holds no value".to_string(),
        })?;
        let value = value
            .coerce(kind)
            .map_err(|e| ResourceError::bad_request(path, e))?;

        let changed = resource.value.as_ref() != Some(&value);
        resource.value = Some(value);
        Ok(changed)
    }

    /// Build a store from an objects file.
    ///
    /// The format nests object, instance and resource IDs, each resource
    /// carrying a type, an access string and a value:
    ///
    /// ```json
    /// { "3": { "0": {
    ///     "0": { "type": "STRING", "acl": "R", "value": "Acme" },
    ///     "4": { "type": "FUNCTION" }
    /// } } }
    /// ```
    ///
    /// Non-numeric keys (descriptions, flags) are ignored.
    pub fn from_objects_json(json: &str) -> Result<Self, ObjectsFileError> {
        let root: serde_json::Value = serde_json::from_str(json)?;
        let mut store = Self::new();

        for (object_id, instances) in numeric_entries(&root) {
            for (instance_id, resources) in numeric_entries(instances) {
                for (resource_id, spec) in numeric_entries(resources) {
                    let path = ResourcePath::resource(object_id, instance_id, resource_id);
                    store.insert(path, parse_resource_spec(&path, spec)?);
                }
            }
        }
        Ok(store)
    }
}

fn numeric_entries(value: &serde_json::Value) -> Vec<(u16, &serde_json::Value)> {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| k.parse::<u16>().ok().map(|id| (id, v)))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_resource_spec(
    path: &ResourcePath,
    spec: &serde_json::Value,
) -> Result<Resource, ObjectsFileError> {
    let type_name = spec
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("STRING")
        .to_ascii_uppercase();

    let kind = match type_name.as_str() {
        "FUNCTION" => {
            let acl = spec.get("acl").and_then(|a| a.as_str()).unwrap_or("E");
            return Ok(Resource::new(None, Operations::parse(acl)));
        }
        "INTEGER" | "TIME" => ValueKind::Integer,
        "FLOAT" => ValueKind::Float,
        "BOOLEAN" => ValueKind::Boolean,
        "OPAQUE" => ValueKind::Opaque,
        "STRING" | "OBJECT_LINK" => ValueKind::String,
        other => {
            return Err(ObjectsFileError::UnknownType {
                path: *path,
                type_name: other.to_string(),
            })
        }
    };

    let acl = spec.get("acl").and_then(|a| a.as_str()).unwrap_or("R");
    let value = Value::from_json(kind, spec.get("value").unwrap_or(&serde_json::Value::Null))
        .map_err(|e| ObjectsFileError::InvalidValue {
            path: *path,
            reason: e.to_string(),
        })?;

    Ok(Resource::new(Some(value), Operations::parse(acl)))
}

/// Errors that can occur when loading an objects file.
#[derive(Debug, thiserror::Error)]
pub enum ObjectsFileError {
    #[error("Failed to parse objects file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown resource type {type_name:?} at {path}")]
    UnknownType {
        path: ResourcePath,
        type_name: String,
    },

    #[error("Invalid value at {path}: {reason}")]
    InvalidValue { path: ResourcePath, reason: String },
}

impl ResourceStore for MemoryStore {
    fn describe(&self, path: &ResourcePath) -> Result<(Operations, Option<ValueKind>), ResourceError> {
        self.resources
            .get(path)
            .map(|r| (r.operations, r.kind()))
            .ok_or(ResourceError::NotFound(*path))
    }

    fn get(&self, path: &ResourcePath) -> Result<Value, ResourceError> {
        let resource = self
            .resources
            .get(path)
            .ok_or(ResourceError::NotFound(*path))?;

        if !resource.operations.read {
            return Err(ResourceError::Unauthorized(*path));
        }

        resource
            .value
            .clone()
            .ok_or(ResourceError::Unauthorized(*path))
    }

    fn set(&mut self, path: &ResourcePath, value: Value) -> Result<bool, ResourceError> {
        self.write_value(path, value, true)
    }

    fn update(&mut self, path: &ResourcePath, value: Value) -> Result<bool, ResourceError> {
        self.write_value(path, value, false)
    }

    fn execute(&self, path: &ResourcePath, _args: &str) -> Result<(), ResourceError> {
        let resource = self
            .resources
            .get(path)
            .ok_or(ResourceError::NotFound(*path))?;

        if resource.operations.execute {
            Ok(())
        } else {
            Err(ResourceError::NotExecutable(*path))
        }
    }

    fn read_tree(&self, prefix: &ResourcePath) -> Result<Vec<(ResourcePath, Value)>, ResourceError> {
        let mut found = false;
        let values: Vec<(ResourcePath, Value)> = self
            .subtree(prefix)
            .inspect(|_| found = true)
            .filter(|(_, r)| r.operations.read)
            .filter_map(|(path, r)| r.value.clone().map(|v| (*path, v)))
            .collect();

        if !found {
            return Err(ResourceError::NotFound(*prefix));
        }
        Ok(values)
    }

    fn discover(&self, prefix: &ResourcePath) -> Result<Vec<(ResourcePath, Operations)>, ResourceError> {
        let mut entries: Vec<(ResourcePath, Operations)> = Vec::new();
        let mut last_instance = None;

        for (path, resource) in self.subtree(prefix) {
            let instance = path.instance_path();
            if prefix.depth() < 2 && instance.is_some() && instance != last_instance {
                if let Some(instance) = instance {
                    entries.push((instance, Operations::default()));
                }
                last_instance = instance;
            }
            entries.push((*path, resource.operations));
        }

        if entries.is_empty() {
            return Err(ResourceError::NotFound(*prefix));
        }
        Ok(entries)
    }

    fn insert(&mut self, path: ResourcePath, resource: Resource) {
        self.resources.insert(path, resource);
    }

    fn remove(&mut self, prefix: &ResourcePath) -> Vec<ResourcePath> {
        let removed: Vec<ResourcePath> = self.subtree(prefix).map(|(p, _)| *p).collect();
        for path in &removed {
            self.resources.remove(path);
        }
        removed
    }

    fn object_links(&self) -> Vec<ResourcePath> {
        let mut links: Vec<ResourcePath> = self
            .resources
            .keys()
            .filter_map(ResourcePath::instance_path)
            .collect();
        links.dedup();
        links
    }
}
