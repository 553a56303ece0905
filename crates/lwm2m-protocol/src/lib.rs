//! # lwm2m-protocol
//!
//! CoAP message types, the RFC 7252 binary codec and the LwM2M content
//! formats (plain text, CoRE link format, SenML JSON).
//!
//! This crate also maps inbound CoAP requests onto LwM2M device management
//! operations and builds the registration interface requests.

pub mod codec;
pub mod content;
pub mod message;
pub mod operation;

pub use codec::{decode, encode, CodecError};
pub use message::*;
pub use operation::{
    deregister_request, register_request, update_request, NotificationAttributes, Operation,
    OperationError,
};
