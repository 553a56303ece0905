//! # lwm2m-core
//!
//! Core LwM2M data model and store implementation.
//!
//! This crate provides:
//! - Resource value types (`Value`, `ValueKind`, `Operations`)
//! - LwM2M path parsing (`/object/instance/resource`)
//! - Object definitions loaded from JSON inventories or OMA DDF XML
//! - In-memory resource store
//! - Client configuration and validation
//!
//! This crate is intentionally runtime-agnostic and contains no async code,
//! so the store can be driven by whichever event loop owns it.

pub mod config;
pub mod model;
pub mod path;
pub mod schema;
pub mod store;

pub use config::{ClientConfig, ConfigError};
pub use model::*;
pub use path::{PathError, ResourcePath};
pub use schema::{ObjectDefinition, ObjectRegistry, ResourceDefinition, ResourceType};
pub use store::{MemoryStore, ObjectsFileError, Resource, ResourceError, ResourceStore};
