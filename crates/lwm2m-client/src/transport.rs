//! CoAP transport over an unreliable datagram channel.
//!
//! This module provides:
//! - The `DatagramChannel` abstraction with UDP and in-memory implementations
//! - Confirmable exchanges with exponential-backoff retransmission
//! - Piggybacked and separate response correlation
//! - Inbound deduplication by message ID with cached response replay
//! - An outbound queue drained by a writer task
//!
//! The channel is connected to a single peer (the LwM2M server), so message
//! IDs alone identify an exchange.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use lwm2m_core::ClientConfig;
use lwm2m_protocol::codec::{self, encode_limited, CodecError};
use lwm2m_protocol::{Message, MessageType};

/// How long a received message ID is remembered for deduplication.
const EXCHANGE_LIFETIME: Duration = Duration::from_secs(247);

/// Errors that can occur in the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No response after {attempts} transmissions")]
    Timeout { attempts: u32 },

    #[error("Peer reset the exchange")]
    Reset,

    #[error("Transport is closed")]
    Closed,

    #[error("Transport is already being listened to")]
    AlreadyListening,

    #[error("Cannot resolve {host}: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("DTLS handshake failed: {0}")]
    Handshake(String),

    #[error("Socket error: {0}")]
    Io(#[from] io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

// ============================================================================
// Datagram channels
// ============================================================================

/// A connected, unreliable datagram channel to the server.
#[async_trait]
pub trait DatagramChannel: Send + Sync + 'static {
    /// Send one datagram.
    async fn send(&self, datagram: &[u8]) -> io::Result<()>;

    /// Receive one datagram into `buf`, returning its length.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Human readable peer description for logs.
    fn peer(&self) -> String;
}

/// UDP socket connected to the LwM2M server.
pub struct UdpChannel {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpChannel {
    /// Resolve the server address from `config`, bind the listen port and
    /// connect the socket.
    pub async fn connect(config: &ClientConfig) -> Result<Self, TransportError> {
        let host = config.server_host.trim();
        let unreachable = |reason: String| TransportError::Unreachable {
            host: host.to_string(),
            reason,
        };

        let candidates: Vec<SocketAddr> = tokio::net::lookup_host((host, config.server_port))
            .await
            .map_err(|e| unreachable(e.to_string()))?
            .collect();

        // IPv4 only when requested, otherwise IPv6 first with IPv4 fallback.
        let peer = if config.use_ipv4 {
            candidates.iter().find(|a| a.is_ipv4())
        } else {
            candidates
                .iter()
                .find(|a| a.is_ipv6())
                .or_else(|| candidates.first())
        }
        .copied()
        .ok_or_else(|| unreachable("no address of the requested family".to_string()))?;

        let bind: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, config.listen_port).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, config.listen_port).into()
        };

        let socket = UdpSocket::bind(bind).await?;
        socket.connect(peer).await?;
        info!("UDP transport bound to {} for server {}", socket.local_addr()?, peer);

        Ok(Self { socket, peer })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl DatagramChannel for UdpChannel {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send(datagram).await.map(|_| ())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf).await
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}

/// In-memory datagram channel, used to run the client against a mock
/// server without sockets.
pub struct MemoryChannel {
    name: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryChannel {
    /// Create two connected ends: `(client, server)`.
    pub fn pair() -> (Self, Self) {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        (
            Self {
                name: "memory:server".to_string(),
                tx: client_tx,
                rx: tokio::sync::Mutex::new(client_rx),
            },
            Self {
                name: "memory:client".to_string(),
                tx: server_tx,
                rx: tokio::sync::Mutex::new(server_rx),
            },
        )
    }
}

#[async_trait]
impl DatagramChannel for MemoryChannel {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.tx
            .send(datagram.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let datagram = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"))?;
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok(len)
    }

    fn peer(&self) -> String {
        self.name.clone()
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Retransmission and framing parameters.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub ack_timeout: Duration,
    pub max_retransmit: u32,
    pub max_packet_size: usize,
    pub dump_messages: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for TransportConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            ack_timeout: Duration::from_millis(config.transmission.ack_timeout_ms),
            max_retransmit: config.transmission.max_retransmit,
            max_packet_size: config.max_packet_size,
            dump_messages: config.logging.dump_messages,
        }
    }
}

impl TransportConfig {
    /// Time to wait for a separate response once the request was acknowledged:
    /// the full retransmission window.
    fn separate_response_timeout(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.max_retransmit + 1).saturating_sub(1);
        self.ack_timeout.saturating_mul(factor)
    }
}

/// Something received from the server that the transport does not consume
/// itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A new (non-duplicate) request.
    Request(Message),
    /// A reset answering one of our unacknowledged messages, e.g. a
    /// notification the server no longer wants.
    Reset(u16),
}

enum ExchangeEvent {
    Ack,
    Response(Message),
    Reset,
}

struct Exchange {
    token: Vec<u8>,
    expects_separate: bool,
    events: mpsc::UnboundedSender<ExchangeEvent>,
}

enum Seen {
    New,
    InProgress,
    Answered(Vec<u8>),
}

#[derive(Default)]
struct DedupCache {
    entries: HashMap<u16, (Instant, Option<Vec<u8>>)>,
}

impl DedupCache {
    fn check(&mut self, message_id: u16, now: Instant) -> Seen {
        self.entries
            .retain(|_, (seen, _)| now.duration_since(*seen) < EXCHANGE_LIFETIME);

        match self.entries.get(&message_id) {
            Some((_, Some(response))) => Seen::Answered(response.clone()),
            Some((_, None)) => Seen::InProgress,
            None => {
                self.entries.insert(message_id, (now, None));
                Seen::New
            }
        }
    }

    fn answer(&mut self, message_id: u16, response: Vec<u8>) {
        let now = Instant::now();
        self.entries
            .entry(message_id)
            .and_modify(|(_, cached)| *cached = Some(response.clone()))
            .or_insert((now, Some(response)));
    }
}

struct Shared {
    config: TransportConfig,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pending: Mutex<HashMap<u16, Exchange>>,
    dedup: Mutex<DedupCache>,
    next_message_id: AtomicU16,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn next_message_id(&self) -> u16 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    fn write(&self, message: &Message) -> Result<(), TransportError> {
        let bytes = encode_limited(message, self.config.max_packet_size)?;
        self.write_bytes(message, bytes)
    }

    fn write_bytes(&self, message: &Message, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.config.dump_messages {
            debug!("-> {}", message);
        }
        self.outbound.send(bytes).map_err(|_| TransportError::Closed)
    }

    fn handle_datagram(&self, message: Message, inbound: &mpsc::UnboundedSender<Inbound>) {
        if self.config.dump_messages {
            debug!("<- {}", message);
        }

        match message.message_type {
            MessageType::Acknowledgement | MessageType::Reset => {
                let is_reset = message.message_type == MessageType::Reset;
                let message_id = message.message_id;
                {
                    let pending = lock(&self.pending);
                    if let Some(exchange) = pending.get(&message_id) {
                        let event = if is_reset {
                            ExchangeEvent::Reset
                        } else if message.is_empty() {
                            ExchangeEvent::Ack
                        } else {
                            ExchangeEvent::Response(message)
                        };
                        let _ = exchange.events.send(event);
                        return;
                    }
                }
                if is_reset {
                    let _ = inbound.send(Inbound::Reset(message_id));
                } else {
                    debug!("Ignoring unmatched ACK mid={}", message_id);
                }
            }
            _ if message.code.is_response() => self.handle_separate_response(message),
            _ if message.code.is_request() => self.handle_request(message, inbound),
            _ => {
                // CON with an empty code is a CoAP ping.
                if message.is_confirmable() {
                    let _ = self.write(&Message::reset(message.message_id));
                }
            }
        }
    }

    fn handle_separate_response(&self, message: Message) {
        let confirmable = message.is_confirmable();
        let message_id = message.message_id;

        let delivered = {
            let pending = lock(&self.pending);
            match pending
                .values()
                .find(|e| e.expects_separate && e.token == message.token)
            {
                Some(exchange) => exchange.events.send(ExchangeEvent::Response(message)).is_ok(),
                None => false,
            }
        };

        let reply = match (confirmable, delivered) {
            (true, true) => Some(Message::empty_ack(message_id)),
            (true, false) => {
                debug!("Rejecting response with unknown token mid={}", message_id);
                Some(Message::reset(message_id))
            }
            (false, _) => None,
        };
        if let Some(reply) = reply {
            let _ = self.write(&reply);
        }
    }

    fn handle_request(&self, message: Message, inbound: &mpsc::UnboundedSender<Inbound>) {
        let seen = lock(&self.dedup).check(message.message_id, Instant::now());
        match seen {
            Seen::New => {
                let _ = inbound.send(Inbound::Request(message));
            }
            Seen::InProgress => {
                debug!("Duplicate request mid={} still in progress", message.message_id);
            }
            Seen::Answered(response) => {
                debug!("Replaying response to duplicate mid={}", message.message_id);
                let _ = self.outbound.send(response);
            }
        }
    }
}

/// CoAP transport bound to one datagram channel.
pub struct Transport {
    shared: Arc<Shared>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Transport {
    /// Start the reader and writer tasks for `channel`.
    pub fn open(channel: Arc<dyn DatagramChannel>, config: TransportConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            config,
            outbound: outbound_tx,
            pending: Mutex::new(HashMap::new()),
            dedup: Mutex::new(DedupCache::default()),
            next_message_id: AtomicU16::new(rand::random()),
        });

        let writer = tokio::spawn(write_loop(channel.clone(), outbound_rx));
        let reader = tokio::spawn(read_loop(channel, shared.clone(), inbound_tx));

        Self {
            shared,
            inbound: Mutex::new(Some(inbound_rx)),
            tasks: Mutex::new(vec![reader, writer]),
        }
    }

    /// Send a confirmable message and wait for its response.
    ///
    /// Requests get a fresh token and may be answered piggybacked or, after
    /// an empty ACK, by a separate response. Other messages (separate
    /// responses of our own) complete on their ACK.
    pub async fn send(&self, mut message: Message) -> Result<Message, TransportError> {
        message.message_type = MessageType::Confirmable;
        message.message_id = self.shared.next_message_id();
        if message.token.is_empty() && message.code.is_request() {
            message.token = new_token();
        }
        let bytes = encode_limited(&message, self.shared.config.max_packet_size)?;

        let (events_tx, mut events) = mpsc::unbounded_channel();
        lock(&self.shared.pending).insert(
            message.message_id,
            Exchange {
                token: message.token.clone(),
                expects_separate: message.code.is_request(),
                events: events_tx,
            },
        );

        let result = self.run_exchange(&message, bytes, &mut events).await;
        lock(&self.shared.pending).remove(&message.message_id);
        result
    }

    async fn run_exchange(
        &self,
        message: &Message,
        bytes: Vec<u8>,
        events: &mut mpsc::UnboundedReceiver<ExchangeEvent>,
    ) -> Result<Message, TransportError> {
        let config = &self.shared.config;
        let mut wait = config.ack_timeout;

        for attempt in 0..=config.max_retransmit {
            if attempt > 0 {
                debug!("Retransmission {} of {}", attempt, message);
            }
            self.shared.write_bytes(message, bytes.clone())?;

            match time::timeout(wait, events.recv()).await {
                Ok(Some(ExchangeEvent::Response(response))) => return Ok(response),
                Ok(Some(ExchangeEvent::Ack)) if message.code.is_request() => {
                    return self.await_separate(events).await;
                }
                Ok(Some(ExchangeEvent::Ack)) => return Ok(Message::empty_ack(message.message_id)),
                Ok(Some(ExchangeEvent::Reset)) => return Err(TransportError::Reset),
                Ok(None) => return Err(TransportError::Closed),
                Err(_) => wait = wait.saturating_mul(2),
            }
        }

        warn!("Giving up on {}", message);
        Err(TransportError::Timeout {
            attempts: config.max_retransmit + 1,
        })
    }

    async fn await_separate(
        &self,
        events: &mut mpsc::UnboundedReceiver<ExchangeEvent>,
    ) -> Result<Message, TransportError> {
        let deadline = Instant::now() + self.shared.config.separate_response_timeout();
        loop {
            match time::timeout_at(deadline, events.recv()).await {
                Ok(Some(ExchangeEvent::Response(response))) => return Ok(response),
                Ok(Some(ExchangeEvent::Ack)) => continue,
                Ok(Some(ExchangeEvent::Reset)) => return Err(TransportError::Reset),
                Ok(None) => return Err(TransportError::Closed),
                Err(_) => {
                    return Err(TransportError::Timeout {
                        attempts: self.shared.config.max_retransmit + 1,
                    })
                }
            }
        }
    }

    /// Send a non-confirmable message, returning its message ID.
    pub fn send_non_confirmable(&self, mut message: Message) -> Result<u16, TransportError> {
        message.message_type = MessageType::NonConfirmable;
        message.message_id = self.shared.next_message_id();
        self.shared.write(&message)?;
        Ok(message.message_id)
    }

    /// Answer `request`. The encoded response is cached so a retransmitted
    /// request gets the same answer without being re-delivered.
    pub fn respond(&self, request: &Message, mut response: Message) -> Result<(), TransportError> {
        if response.message_type == MessageType::NonConfirmable {
            response.message_id = self.shared.next_message_id();
        }
        let bytes = encode_limited(&response, self.shared.config.max_packet_size)?;
        lock(&self.shared.dedup).answer(request.message_id, bytes.clone());
        self.shared.write_bytes(&response, bytes)
    }

    /// The stream of inbound requests and resets. It can be taken once;
    /// reopen the transport to listen again.
    pub fn listen(&self) -> Result<impl Stream<Item = Inbound> + Send + Unpin, TransportError> {
        let rx = lock(&self.inbound)
            .take()
            .ok_or(TransportError::AlreadyListening)?;
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|inbound| (inbound, rx))
        })))
    }

    /// Number of exchanges waiting for a response.
    pub fn pending_exchanges(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Stop the reader and writer and fail all in-flight exchanges.
    pub fn close(&self) {
        lock(&self.shared.pending).clear();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

fn new_token() -> Vec<u8> {
    rand::random::<[u8; 8]>().to_vec()
}

async fn write_loop(channel: Arc<dyn DatagramChannel>, mut outbound: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(datagram) = outbound.recv().await {
        if let Err(e) = channel.send(&datagram).await {
            warn!("Failed to send datagram to {}: {}", channel.peer(), e);
        }
    }
}

async fn read_loop(
    channel: Arc<dyn DatagramChannel>,
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    let mut buf = vec![0u8; shared.config.max_packet_size.max(64)];
    loop {
        let len = match channel.recv(&mut buf).await {
            Ok(len) => len,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                ) =>
            {
                debug!("Transient receive error from {}: {}", channel.peer(), e);
                continue;
            }
            Err(e) => {
                error!("Receive from {} failed: {}", channel.peer(), e);
                break;
            }
        };

        match codec::decode(&buf[..len]) {
            Ok(message) => shared.handle_datagram(message, &inbound),
            Err(e) => {
                warn!("Dropping malformed datagram from {}: {}", channel.peer(), e);
                if let Some(message_id) = confirmable_id(&buf[..len]) {
                    if let Err(e) = shared.write(&Message::reset(message_id)) {
                        debug!("Cannot reset malformed message {}: {}", message_id, e);
                    }
                }
            }
        }
    }
}

/// Message ID of a datagram whose fixed header reads as a CoAP version 1 Confirmable.
fn confirmable_id(bytes: &[u8]) -> Option<u16> {
    match bytes {
        [first, _, high, low, ..] if first >> 6 == 1 && (first >> 4) & 0x03 == 0 => {
            Some(u16::from_be_bytes([*high, *low]))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use lwm2m_protocol::Code;

    fn test_config() -> TransportConfig {
        TransportConfig {
            ack_timeout: Duration::from_secs(2),
            max_retransmit: 4,
            max_packet_size: 1152,
            dump_messages: true,
        }
    }

    async fn recv_message(channel: &MemoryChannel) -> Message {
        let mut buf = vec![0u8; 2048];
        let len = channel.recv(&mut buf).await.unwrap();
        codec::decode(&buf[..len]).unwrap()
    }

    async fn send_message(channel: &MemoryChannel, message: &Message) {
        channel.send(&codec::encode(message).unwrap()).await.unwrap();
    }

    fn open() -> (Arc<Transport>, MemoryChannel) {
        let (client, server) = MemoryChannel::pair();
        (Arc::new(Transport::open(Arc::new(client), test_config())), server)
    }

    #[tokio::test(start_paused = true)]
    async fn test_piggybacked_response() {
        let (transport, server) = open();

        let t = transport.clone();
        let exchange = tokio::spawn(async move {
            let request = Message::request(Code::GET, 0, Vec::new());
            t.send(request).await
        });

        let request = recv_message(&server).await;
        assert_eq!(request.message_type, MessageType::Confirmable);
        assert_eq!(request.token.len(), 8);

        let mut response = Message::piggybacked_response(&request, Code::CONTENT);
        response.set_payload(b"ok".to_vec());
        send_message(&server, &response).await;

        let response = exchange.await.unwrap().unwrap();
        assert_eq!(response.code, Code::CONTENT);
        assert_eq!(response.payload, b"ok");
        assert_eq!(transport.pending_exchanges(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmission_then_timeout() {
        let (transport, server) = open();

        let started = Instant::now();
        let t = transport.clone();
        let exchange = tokio::spawn(async move {
            t.send(Message::request(Code::POST, 0, Vec::new())).await
        });

        let first = recv_message(&server).await;
        for _ in 0..4 {
            let retry = recv_message(&server).await;
            assert_eq!(retry.message_id, first.message_id);
            assert_eq!(retry.token, first.token);
        }

        let result = exchange.await.unwrap();
        assert!(matches!(result, Err(TransportError::Timeout { attempts: 5 })));
        // 2 + 4 + 8 + 16 + 32 seconds
        assert!(started.elapsed() >= Duration::from_secs(62));
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_response() {
        let (transport, server) = open();

        let t = transport.clone();
        let exchange = tokio::spawn(async move {
            t.send(Message::request(Code::GET, 0, Vec::new())).await
        });

        let request = recv_message(&server).await;
        send_message(&server, &Message::empty_ack(request.message_id)).await;

        let mut separate = Message::request(Code::CONTENT, 0x4242, request.token.clone());
        separate.set_payload(b"late".to_vec());
        send_message(&server, &separate).await;

        let response = exchange.await.unwrap().unwrap();
        assert_eq!(response.payload, b"late");

        // The separate CON response is acknowledged
        let ack = recv_message(&server).await;
        assert_eq!(ack.message_type, MessageType::Acknowledgement);
        assert_eq!(ack.message_id, 0x4242);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_fails_exchange() {
        let (transport, server) = open();

        let t = transport.clone();
        let exchange = tokio::spawn(async move {
            t.send(Message::request(Code::GET, 0, Vec::new())).await
        });

        let request = recv_message(&server).await;
        send_message(&server, &Message::reset(request.message_id)).await;

        assert!(matches!(exchange.await.unwrap(), Err(TransportError::Reset)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_request_replays_response() {
        let (transport, server) = open();
        let mut inbound = transport.listen().unwrap();

        let mut request = Message::request(Code::GET, 77, vec![9]);
        request.set_uri_path(&["3", "0", "0"]);
        send_message(&server, &request).await;

        let Some(Inbound::Request(received)) = inbound.next().await else {
            panic!("Expected request");
        };
        let mut response = Message::piggybacked_response(&received, Code::CONTENT);
        response.set_payload(b"Acme".to_vec());
        transport.respond(&received, response).unwrap();
        assert_eq!(recv_message(&server).await.payload, b"Acme");

        // Retransmitted request: replayed, not re-delivered
        send_message(&server, &request).await;
        let replay = recv_message(&server).await;
        assert_eq!(replay.message_id, 77);
        assert_eq!(replay.payload, b"Acme");

        let next = time::timeout(Duration::from_millis(10), inbound.next()).await;
        assert!(next.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_twice_fails() {
        let (transport, _server) = open();
        assert!(transport.listen().is_ok());
        assert!(matches!(
            transport.listen(),
            Err(TransportError::AlreadyListening)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_reset_is_delivered() {
        let (transport, server) = open();
        let mut inbound = transport.listen().unwrap();

        let mid = transport
            .send_non_confirmable(Message::request(Code::CONTENT, 0, vec![1]))
            .unwrap();
        let _ = recv_message(&server).await;
        send_message(&server, &Message::reset(mid)).await;

        assert_eq!(inbound.next().await, Some(Inbound::Reset(mid)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_fails_pending_exchange() {
        let (transport, server) = open();

        let t = transport.clone();
        let exchange = tokio::spawn(async move {
            t.send(Message::request(Code::GET, 0, Vec::new())).await
        });
        let _ = recv_message(&server).await;

        transport.close();
        assert!(matches!(exchange.await.unwrap(), Err(TransportError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_datagram_is_ignored() {
        let (transport, server) = open();
        let mut inbound = transport.listen().unwrap();

        server.send(&[0xFF, 0x00]).await.unwrap();
        let mut request = Message::request(Code::GET, 5, vec![]);
        request.set_uri_path(&["3"]);
        send_message(&server, &request).await;

        assert!(matches!(inbound.next().await, Some(Inbound::Request(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_confirmable_is_reset() {
        let (transport, server) = open();
        let _inbound = transport.listen().unwrap();

        // CON GET, message ID 0x1234, with an invalid token length of 9.
        server.send(&[0x49, 0x01, 0x12, 0x34]).await.unwrap();

        let reset = recv_message(&server).await;
        assert_eq!(reset.message_type, MessageType::Reset);
        assert_eq!(reset.code, Code::EMPTY);
        assert_eq!(reset.message_id, 0x1234);
    }

    #[test]
    fn test_confirmable_id_needs_con_header() {
        assert_eq!(confirmable_id(&[0x49, 0x01, 0x12, 0x34]), Some(0x1234));
        // Non-confirmable
        assert_eq!(confirmable_id(&[0x59, 0x01, 0x12, 0x34]), None);
        // Version 0
        assert_eq!(confirmable_id(&[0x09, 0x01, 0x12, 0x34]), None);
        assert_eq!(confirmable_id(&[0x40, 0x01]), None);
    }
}
