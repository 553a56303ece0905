//! DTLS security for the transport.
//!
//! The record layer is supplied by the embedding application through
//! [`DtlsConnector`]. The connector performs the PSK handshake over the raw
//! datagram channel and returns a channel that encrypts and decrypts
//! application datagrams. The handshake completes before the transport
//! starts, so no application message is ever sent in the clear.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::transport::{DatagramChannel, TransportError};

/// Pre-shared key credentials.
#[derive(Clone)]
pub struct PskCredentials {
    pub identity: String,
    pub key: Vec<u8>,
}

impl fmt::Debug for PskCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PskCredentials")
            .field("identity", &self.identity)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Establishes a DTLS session over a datagram channel.
#[async_trait]
pub trait DtlsConnector: Send + Sync {
    /// Run the handshake and return the secured channel.
    ///
    /// A failure here is fatal to `start`.
    async fn handshake(
        &self,
        channel: Arc<dyn DatagramChannel>,
        credentials: &PskCredentials,
    ) -> Result<Arc<dyn DatagramChannel>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_key() {
        let credentials = PskCredentials {
            identity: "dev1".to_string(),
            key: vec![0xde, 0xad],
        };
        let shown = format!("{:?}", credentials);
        assert!(shown.contains("dev1"));
        assert!(!shown.contains("222"));
        assert!(shown.contains("<redacted>"));
    }
}
