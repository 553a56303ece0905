//! # lwm2m-client
//!
//! LwM2M client engine running on tokio.
//!
//! - `transport` - CoAP over UDP with retransmission and deduplication
//! - `session` - registration state machine
//! - `dispatcher` - server operations against the resource store
//! - `observe` - observe relations, notification attributes and host subscriptions
//! - `client` - the public [`Client`] handle and its event loop
//!
//! ```no_run
//! # async fn run() -> Result<(), lwm2m_client::ClientError> {
//! use lwm2m_client::Client;
//! use lwm2m_core::ClientConfig;
//!
//! let client = Client::start(ClientConfig::new("dev1", "127.0.0.1", 5683)).await?;
//! client.write("/3/0/1", "newName").await?;
//! client.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod dispatcher;
pub mod dtls;
pub mod observe;
pub mod session;
pub mod transport;

pub use client::{default_store, seed_lifetime, Client, ClientBuilder, ClientError, ClientEvent, ExecuteHandler};
pub use dtls::{DtlsConnector, PskCredentials};
pub use session::{SessionError, SessionState};
pub use transport::{DatagramChannel, MemoryChannel, Transport, TransportConfig, TransportError, UdpChannel};

pub use lwm2m_core::{ClientConfig, Resource, ResourceError, ResourcePath, Value};
