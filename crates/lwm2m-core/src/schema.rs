//! LwM2M object definitions.
//!
//! The client needs to know which objects it hosts, which resources they
//! carry, their types and who may read, write or execute them. Definitions
//! come from three places:
//! - a small built-in set (Server and Device objects)
//! - a JSON inventory (`lwm2m-object-inventory.json`)
//! - OMA DDF XML files (`lwm2m-object-<id>.xml`)
//!
//! XML files are scanned with regular expressions rather than a full XML
//! parser; DDF files are flat and well-known, and only a handful of tags
//! are needed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::{Operations, Value, ValueKind};
use crate::path::ResourcePath;
use crate::store::{MemoryStore, Resource, ResourceStore};

/// Resource data types as named in DDF files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceType {
    String,
    Integer,
    UnsignedInteger,
    Float,
    Boolean,
    Opaque,
    Time,
    Objlnk,
    /// No type: executable resources.
    None,
}

impl ResourceType {
    /// Parse a DDF `<Type>` value. Empty means executable.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "string" | "corelnk" => ResourceType::String,
            "integer" => ResourceType::Integer,
            "unsigned integer" => ResourceType::UnsignedInteger,
            "float" => ResourceType::Float,
            "boolean" => ResourceType::Boolean,
            "opaque" => ResourceType::Opaque,
            "time" => ResourceType::Time,
            "objlnk" => ResourceType::Objlnk,
            _ => ResourceType::None,
        }
    }

    /// The value representation of this type, `None` for executables.
    pub fn value_kind(self) -> Option<ValueKind> {
        match self {
            ResourceType::String | ResourceType::Objlnk => Some(ValueKind::String),
            ResourceType::Integer | ResourceType::UnsignedInteger | ResourceType::Time => {
                Some(ValueKind::Integer)
            }
            ResourceType::Float => Some(ValueKind::Float),
            ResourceType::Boolean => Some(ValueKind::Boolean),
            ResourceType::Opaque => Some(ValueKind::Opaque),
            ResourceType::None => None,
        }
    }
}

/// Definition of a single resource within an object.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDefinition {
    pub id: u16,
    pub name: String,
    pub resource_type: ResourceType,
    pub operations: Operations,
    pub mandatory: bool,
    pub units: Option<String>,
    pub range_enumeration: Option<String>,
    pub description: Option<String>,
}

impl ResourceDefinition {
    /// Initial value of a freshly instantiated resource.
    ///
    /// Numbers start at the lower bound of their range ("a..b") or zero,
    /// strings start with their units, object links point at "0:0".
    pub fn default_value(&self) -> Option<Value> {
        let range_min = || {
            self.range_enumeration
                .as_deref()
                .filter(|r| r.contains(".."))
                .and_then(|r| r.split("..").next())
                .map(str::trim)
        };

        match self.resource_type {
            ResourceType::Boolean => Some(Value::Boolean(false)),
            ResourceType::Integer | ResourceType::UnsignedInteger => Some(Value::Integer(
                range_min().and_then(|m| m.parse().ok()).unwrap_or(0),
            )),
            ResourceType::Float => Some(Value::Float(
                range_min().and_then(|m| m.parse().ok()).unwrap_or(0.0),
            )),
            ResourceType::String => Some(Value::String(self.units.clone().unwrap_or_default())),
            ResourceType::Time => Some(Value::Integer(0)),
            ResourceType::Objlnk => Some(Value::String("0:0".to_string())),
            ResourceType::Opaque => Some(Value::Opaque(Vec::new())),
            ResourceType::None => None,
        }
    }

    fn new(id: u16, name: &str, resource_type: ResourceType, acl: &str, mandatory: bool) -> Self {
        Self {
            id,
            name: name.to_string(),
            resource_type,
            operations: Operations::parse(acl),
            mandatory,
            units: None,
            range_enumeration: None,
            description: None,
        }
    }
}

/// Definition of an LwM2M object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDefinition {
    pub id: u16,
    pub name: String,
    pub description: String,
    pub multiple_instances: bool,
    pub resources: BTreeMap<u16, ResourceDefinition>,
}

/// Errors that can occur while loading object definitions.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Failed to parse object inventory: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No ObjectID found in {0}")]
    MissingObjectId(String),

    #[error("Invalid identifier {0:?}")]
    InvalidId(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Unknown object {0}")]
    UnknownObject(u16),

    #[error("Object {0} is single-instance")]
    SingleInstance(u16),
}

/// Set of object definitions known to the client.
#[derive(Debug, Clone, Default)]
pub struct ObjectRegistry {
    objects: BTreeMap<u16, ObjectDefinition>,
}

impl ObjectRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in Server (1) and Device (3) objects.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.insert(server_object());
        registry.insert(device_object());
        registry
    }

    /// Add or replace a definition.
    pub fn insert(&mut self, object: ObjectDefinition) {
        self.objects.insert(object.id, object);
    }

    pub fn get(&self, object_id: u16) -> Option<&ObjectDefinition> {
        self.objects.get(&object_id)
    }

    /// Look up the definition of the resource a path points at.
    pub fn resource(&self, path: &ResourcePath) -> Option<&ResourceDefinition> {
        let resource_id = path.resource_id()?;
        self.get(path.object_id())?.resources.get(&resource_id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn object_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.objects.keys().copied()
    }

    /// Load definitions from a JSON inventory keyed by object ID.
    ///
    /// Returns the number of objects added.
    pub fn load_inventory_json(&mut self, json: &str) -> Result<usize, SchemaError> {
        let inventory: BTreeMap<String, wire::InventoryObject> = serde_json::from_str(json)?;
        let mut count = 0;
        for (_, object) in inventory {
            self.insert(object.try_into()?);
            count += 1;
        }
        Ok(count)
    }

    /// Serialize the registry into the JSON inventory format.
    pub fn to_inventory_json(&self) -> Result<String, SchemaError> {
        let inventory: BTreeMap<String, wire::InventoryObject> = self
            .objects
            .values()
            .map(|o| (o.id.to_string(), wire::InventoryObject::from(o)))
            .collect();
        Ok(serde_json::to_string_pretty(&inventory)?)
    }

    /// Load every `lwm2m-object-*.xml` file in a directory.
    ///
    /// Files that cannot be parsed are logged and skipped. Returns the
    /// number of objects added.
    pub fn load_ddf_dir(&mut self, dir: &Path) -> Result<usize, SchemaError> {
        let entries = std::fs::read_dir(dir).map_err(|source| SchemaError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("lwm2m-object-") && n.ends_with(".xml"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        let mut count = 0;
        for file in files {
            let xml = std::fs::read_to_string(&file).map_err(|source| SchemaError::Io {
                path: file.clone(),
                source,
            })?;
            match parse_ddf_xml(&xml) {
                Ok(object) => {
                    debug!(
                        "Parsed object {} ({}) with {} resources",
                        object.id,
                        object.name,
                        object.resources.len()
                    );
                    self.insert(object);
                    count += 1;
                }
                Err(e) => warn!("Skipping {}: {}", file.display(), e),
            }
        }
        Ok(count)
    }

    /// Create an object instance in `store`, populated with default values.
    ///
    /// Returns the number of resources created.
    pub fn instantiate(
        &self,
        store: &mut MemoryStore,
        object_id: u16,
        instance_id: u16,
    ) -> Result<usize, SchemaError> {
        let object = self
            .get(object_id)
            .ok_or(SchemaError::UnknownObject(object_id))?;

        if !object.multiple_instances && instance_id != 0 {
            return Err(SchemaError::SingleInstance(object_id));
        }

        for def in object.resources.values() {
            let path = ResourcePath::resource(object_id, instance_id, def.id);
            store.insert(path, Resource::new(def.default_value(), def.operations));
        }
        Ok(object.resources.len())
    }
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static regex"))
}

/// Parse a single OMA DDF XML document.
pub fn parse_ddf_xml(xml: &str) -> Result<ObjectDefinition, SchemaError> {
    static OBJECT_ID: OnceLock<Regex> = OnceLock::new();
    static NAME: OnceLock<Regex> = OnceLock::new();
    static DESCRIPTION: OnceLock<Regex> = OnceLock::new();
    static MULTIPLE: OnceLock<Regex> = OnceLock::new();
    static ITEM: OnceLock<Regex> = OnceLock::new();
    static ITEM_ID: OnceLock<Regex> = OnceLock::new();
    static TYPE: OnceLock<Regex> = OnceLock::new();
    static MANDATORY: OnceLock<Regex> = OnceLock::new();
    static OPERATIONS: OnceLock<Regex> = OnceLock::new();
    static UNITS: OnceLock<Regex> = OnceLock::new();
    static RANGE: OnceLock<Regex> = OnceLock::new();
    static ITEM_DESCRIPTION: OnceLock<Regex> = OnceLock::new();

    let capture = |re: &Regex, text: &str| -> Option<String> {
        re.captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
    };

    let object_id_text = capture(regex(&OBJECT_ID, r"<ObjectID>(\d+)</ObjectID>"), xml)
        .ok_or_else(|| SchemaError::MissingObjectId("document".to_string()))?;
    let id = parse_id(&object_id_text)?;

    let name = capture(regex(&NAME, r"<Name>([^<]+)</Name>"), xml)
        .unwrap_or_else(|| format!("Object {}", id));
    let description = capture(
        regex(
            &DESCRIPTION,
            r"(?s)<Description1>(?:<!\[CDATA\[)?(.*?)(?:\]\]>)?</Description1>",
        ),
        xml,
    )
    .unwrap_or_default();
    let multiple_instances = capture(
        regex(
            &MULTIPLE,
            r"<MultipleInstances>(Single|Multiple)</MultipleInstances>",
        ),
        xml,
    )
    .map(|m| m == "Multiple")
    .unwrap_or(true);

    let mut resources = BTreeMap::new();
    let item_re = regex(&ITEM, r#"<Item ID="[^"]+"[\s\S]*?</Item>"#);
    for item in item_re.find_iter(xml).map(|m| m.as_str()) {
        let (Some(item_id), Some(item_name)) = (
            capture(regex(&ITEM_ID, r#"<Item ID="([^"]+)""#), item),
            capture(regex(&NAME, r"<Name>([^<]+)</Name>"), item),
        ) else {
            continue;
        };

        // Untyped items are only kept when they are executable.
        let type_text = capture(regex(&TYPE, r"<Type>([^<]*)</Type>"), item).unwrap_or_default();
        let operations = capture(regex(&OPERATIONS, r"<Operations>([^<]+)</Operations>"), item)
            .unwrap_or_default();
        if type_text.is_empty() && !operations.contains('E') {
            continue;
        }

        let resource_id = parse_id(&item_id)?;
        let non_empty = |s: Option<String>| s.filter(|v| !v.is_empty());
        resources.insert(
            resource_id,
            ResourceDefinition {
                id: resource_id,
                name: item_name,
                resource_type: ResourceType::parse(&type_text),
                operations: Operations::parse(&operations),
                mandatory: capture(regex(&MANDATORY, r"<Mandatory>([^<]+)</Mandatory>"), item)
                    .map(|m| m.eq_ignore_ascii_case("mandatory"))
                    .unwrap_or(false),
                units: non_empty(capture(regex(&UNITS, r"<Units>([^<]*)</Units>"), item)),
                range_enumeration: non_empty(capture(
                    regex(&RANGE, r"<RangeEnumeration>([^<]*)</RangeEnumeration>"),
                    item,
                )),
                description: non_empty(capture(
                    regex(
                        &ITEM_DESCRIPTION,
                        r"(?s)<Description>(?:<!\[CDATA\[)?(.*?)(?:\]\]>)?</Description>",
                    ),
                    item,
                )),
            },
        );
    }

    Ok(ObjectDefinition {
        id,
        name,
        description,
        multiple_instances,
        resources,
    })
}

fn parse_id(text: &str) -> Result<u16, SchemaError> {
    text.trim()
        .parse()
        .map_err(|_| SchemaError::InvalidId(text.to_string()))
}

fn server_object() -> ObjectDefinition {
    let resources = [
        ResourceDefinition::new(0, "Short Server ID", ResourceType::Integer, "R", true),
        ResourceDefinition::new(1, "Lifetime", ResourceType::Integer, "RW", true),
        ResourceDefinition::new(2, "Default Minimum Period", ResourceType::Integer, "RW", false),
        ResourceDefinition::new(3, "Default Maximum Period", ResourceType::Integer, "RW", false),
        ResourceDefinition::new(6, "Notification Storing", ResourceType::Boolean, "RW", true),
        ResourceDefinition::new(7, "Binding", ResourceType::String, "RW", true),
        ResourceDefinition::new(8, "Registration Update Trigger", ResourceType::None, "E", true),
    ];
    ObjectDefinition {
        id: 1,
        name: "LwM2M Server".to_string(),
        description: "Data related to a LwM2M Server".to_string(),
        multiple_instances: true,
        resources: resources.into_iter().map(|r| (r.id, r)).collect(),
    }
}

fn device_object() -> ObjectDefinition {
    let resources = [
        ResourceDefinition::new(0, "Manufacturer", ResourceType::String, "R", false),
        ResourceDefinition::new(1, "Model Number", ResourceType::String, "R", false),
        ResourceDefinition::new(2, "Serial Number", ResourceType::String, "R", false),
        ResourceDefinition::new(3, "Firmware Version", ResourceType::String, "R", false),
        ResourceDefinition::new(4, "Reboot", ResourceType::None, "E", true),
        ResourceDefinition::new(5, "Factory Reset", ResourceType::None, "E", false),
        ResourceDefinition::new(11, "Error Code", ResourceType::Integer, "R", true),
        ResourceDefinition::new(13, "Current Time", ResourceType::Time, "RW", false),
        ResourceDefinition::new(14, "UTC Offset", ResourceType::String, "RW", false),
        ResourceDefinition::new(15, "Timezone", ResourceType::String, "RW", false),
        ResourceDefinition::new(16, "Supported Binding and Modes", ResourceType::String, "R", true),
    ];
    ObjectDefinition {
        id: 3,
        name: "Device".to_string(),
        description: "Device information and management".to_string(),
        multiple_instances: false,
        resources: resources.into_iter().map(|r| (r.id, r)).collect(),
    }
}

/// Serialized inventory format, keyed and typed as strings.
mod wire {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct InventoryObject {
        pub object_id: String,
        pub name: String,
        #[serde(default)]
        pub description: String,
        #[serde(default)]
        pub is_singleton: bool,
        #[serde(default)]
        pub resources: BTreeMap<String, InventoryResource>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct InventoryResource {
        pub id: String,
        pub name: String,
        #[serde(rename = "type", default)]
        pub resource_type: String,
        #[serde(default)]
        pub mandatory: bool,
        #[serde(default)]
        pub operations: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub units: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub range_enumeration: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub description: Option<String>,
    }

    impl TryFrom<InventoryObject> for ObjectDefinition {
        type Error = SchemaError;

        fn try_from(o: InventoryObject) -> Result<Self, Self::Error> {
            let resources = o
                .resources
                .into_values()
                .map(|r| {
                    let id = parse_id(&r.id)?;
                    Ok((
                        id,
                        ResourceDefinition {
                            id,
                            name: r.name,
                            resource_type: ResourceType::parse(&r.resource_type),
                            operations: Operations::parse(&r.operations),
                            mandatory: r.mandatory,
                            units: r.units,
                            range_enumeration: r.range_enumeration,
                            description: r.description,
                        },
                    ))
                })
                .collect::<Result<_, SchemaError>>()?;

            Ok(ObjectDefinition {
                id: parse_id(&o.object_id)?,
                name: o.name,
                description: o.description,
                multiple_instances: !o.is_singleton,
                resources,
            })
        }
    }

    impl From<&ObjectDefinition> for InventoryObject {
        fn from(o: &ObjectDefinition) -> Self {
            Self {
                object_id: o.id.to_string(),
                name: o.name.clone(),
                description: o.description.clone(),
                is_singleton: !o.multiple_instances,
                resources: o
                    .resources
                    .values()
                    .map(|r| {
                        (
                            r.id.to_string(),
                            InventoryResource {
                                id: r.id.to_string(),
                                name: r.name.clone(),
                                resource_type: type_name(r.resource_type).to_string(),
                                mandatory: r.mandatory,
                                operations: r.operations.to_string(),
                                units: r.units.clone(),
                                range_enumeration: r.range_enumeration.clone(),
                                description: r.description.clone(),
                            },
                        )
                    })
                    .collect(),
            }
        }
    }

    fn type_name(t: ResourceType) -> &'static str {
        match t {
            ResourceType::String => "String",
            ResourceType::Integer => "Integer",
            ResourceType::UnsignedInteger => "Unsigned Integer",
            ResourceType::Float => "Float",
            ResourceType::Boolean => "Boolean",
            ResourceType::Opaque => "Opaque",
            ResourceType::Time => "Time",
            ResourceType::Objlnk => "Objlnk",
            ResourceType::None => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ResourceStore;
    use pretty_assertions::assert_eq;

    const TEMPERATURE_DDF: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<LWM2M>
  <Object ObjectType="MODefinition">
    <Name>Temperature</Name>
    <Description1><![CDATA[Temperature sensor.]]></Description1>
    <ObjectID>3303</ObjectID>
    <MultipleInstances>Multiple</MultipleInstances>
    <Resources>
      <Item ID="5700">
        <Name>Sensor Value</Name>
        <Operations>R</Operations>
        <MultipleInstances>Single</MultipleInstances>
        <Mandatory>Mandatory</Mandatory>
        <Type>Float</Type>
        <RangeEnumeration>-40..85</RangeEnumeration>
        <Units>Cel</Units>
        <Description><![CDATA[Last measured value.]]></Description>
      </Item>
      <Item ID="5701">
        <Name>Sensor Units</Name>
        <Operations>R</Operations>
        <Mandatory>Optional</Mandatory>
        <Type>String</Type>
        <RangeEnumeration></RangeEnumeration>
        <Units>Cel</Units>
      </Item>
      <Item ID="5605">
        <Name>Reset Min and Max Measured Values</Name>
        <Operations>E</Operations>
        <Mandatory>Optional</Mandatory>
        <Type></Type>
      </Item>
    </Resources>
  </Object>
</LWM2M>"#;

    #[test]
    fn test_parse_ddf() {
        let object = parse_ddf_xml(TEMPERATURE_DDF).unwrap();
        assert_eq!(object.id, 3303);
        assert_eq!(object.name, "Temperature");
        assert_eq!(object.description, "Temperature sensor.");
        assert!(object.multiple_instances);
        assert_eq!(object.resources.len(), 3);

        let value = &object.resources[&5700];
        assert_eq!(value.name, "Sensor Value");
        assert_eq!(value.resource_type, ResourceType::Float);
        assert_eq!(value.operations, Operations::READ);
        assert!(value.mandatory);
        assert_eq!(value.units.as_deref(), Some("Cel"));
        assert_eq!(value.description.as_deref(), Some("Last measured value."));

        let reset = &object.resources[&5605];
        assert_eq!(reset.resource_type, ResourceType::None);
        assert_eq!(reset.operations, Operations::EXECUTE);
    }

    #[test]
    fn test_missing_object_id() {
        let err = parse_ddf_xml("<LWM2M><Object></Object></LWM2M>").unwrap_err();
        assert!(matches!(err, SchemaError::MissingObjectId(_)));
    }

    #[test]
    fn test_default_values() {
        let object = parse_ddf_xml(TEMPERATURE_DDF).unwrap();
        assert_eq!(object.resources[&5700].default_value(), Some(Value::Float(-40.0)));
        assert_eq!(
            object.resources[&5701].default_value(),
            Some(Value::String("Cel".to_string()))
        );
        assert_eq!(object.resources[&5605].default_value(), None);

        let link = ResourceDefinition::new(9, "Link", ResourceType::Objlnk, "R", false);
        assert_eq!(link.default_value(), Some(Value::String("0:0".to_string())));
    }

    #[test]
    fn test_inventory_round_trip() {
        let mut registry = ObjectRegistry::new();
        registry.insert(parse_ddf_xml(TEMPERATURE_DDF).unwrap());
        let json = registry.to_inventory_json().unwrap();

        let mut loaded = ObjectRegistry::new();
        assert_eq!(loaded.load_inventory_json(&json).unwrap(), 1);
        assert_eq!(loaded.get(3303), registry.get(3303));
    }

    #[test]
    fn test_instantiate_builtin_device() {
        let registry = ObjectRegistry::with_builtin();
        let mut store = MemoryStore::new();

        let created = registry.instantiate(&mut store, 3, 0).unwrap();
        assert_eq!(created, 11);
        assert_eq!(
            store.get(&ResourcePath::resource(3, 0, 0)),
            Ok(Value::String(String::new()))
        );
        assert!(store.execute(&ResourcePath::resource(3, 0, 4), "").is_ok());

        assert!(matches!(
            registry.instantiate(&mut store, 3, 1),
            Err(SchemaError::SingleInstance(3))
        ));
        assert!(matches!(
            registry.instantiate(&mut store, 9999, 0),
            Err(SchemaError::UnknownObject(9999))
        ));
    }

    #[test]
    fn test_resource_lookup() {
        let registry = ObjectRegistry::with_builtin();
        let lifetime = registry.resource(&ResourcePath::resource(1, 0, 1)).unwrap();
        assert_eq!(lifetime.name, "Lifetime");
        assert!(registry.resource(&ResourcePath::instance(1, 0)).is_none());
    }
}
