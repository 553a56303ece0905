//! LwM2M client: the public handle and the event loop behind it.
//!
//! One task owns the session, the resource store, the observation manager
//! and the dispatcher. It multiplexes host commands, inbound server
//! requests, worker completions and timers with `tokio::select!`. Network
//! exchanges (registration, updates, Execute responses) run on worker tasks
//! that report back through a completion queue, so the loop never blocks on
//! the server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use lwm2m_core::{
    ClientConfig, ConfigError, MemoryStore, ObjectRegistry, PathError, Resource, ResourceError,
    ResourcePath, ResourceStore, Value,
};
use lwm2m_protocol::{Code, Message, MessageType};

use crate::dispatcher::{
    error_code, read_values, Dispatcher, Effects, ExecuteJob, REGISTRATION_UPDATE_TRIGGER,
    SERVER_LIFETIME,
};
use crate::dtls::{DtlsConnector, PskCredentials};
use crate::observe::{LocalSubscriptions, Notification, ObservationManager, Snapshot, SubscriptionCallback};
use crate::session::{Recovery, RegistrationError, Session, SessionError, SessionState};
use crate::transport::{DatagramChannel, Inbound, Transport, TransportConfig, TransportError, UdpChannel};

/// Execute handlers that take longer than this get an empty ACK first and
/// answer with a separate response.
pub const EXECUTE_ACK_DELAY: Duration = Duration::from_millis(500);

const EVENT_CAPACITY: usize = 64;
const COMMAND_CAPACITY: usize = 64;

/// Errors returned by the client API.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Client is stopped")]
    Stopped,
}

/// Notifications about the client, broadcast to every `events()` receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    Registered {
        location: String,
    },
    Deregistered,
    /// Fatal: registration attempts are exhausted. Sent once per session.
    Error(String),
    /// An operation on the object tree, by the server or the host.
    ObjectEvent {
        operation: String,
        path: ResourcePath,
        timestamp: DateTime<Utc>,
    },
}

/// Side effects of executing a resource.
#[async_trait]
pub trait ExecuteHandler: Send + Sync {
    async fn execute(&self, path: ResourcePath, args: String) -> Result<(), ResourceError>;
}

#[async_trait]
impl<F> ExecuteHandler for F
where
    F: Fn(ResourcePath, String) -> Result<(), ResourceError> + Send + Sync,
{
    async fn execute(&self, path: ResourcePath, args: String) -> Result<(), ResourceError> {
        self(path, args)
    }
}

type Handlers = HashMap<ResourcePath, Arc<dyn ExecuteHandler>>;

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    store: Option<Box<dyn ResourceStore>>,
    channel: Option<Arc<dyn DatagramChannel>>,
    dtls: Option<Arc<dyn DtlsConnector>>,
    handlers: Handlers,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            store: None,
            channel: None,
            dtls: None,
            handlers: HashMap::new(),
        }
    }

    /// Serve this store instead of the built-in Server and Device objects.
    pub fn store(mut self, store: impl ResourceStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    /// Use an already connected channel instead of opening a UDP socket.
    pub fn channel(mut self, channel: Arc<dyn DatagramChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// DTLS implementation, required when `enableDTLS` is set.
    pub fn dtls(mut self, connector: Arc<dyn DtlsConnector>) -> Self {
        self.dtls = Some(connector);
        self
    }

    /// Register the side effect of executing `path`.
    pub fn on_execute(mut self, path: ResourcePath, handler: impl ExecuteHandler + 'static) -> Self {
        self.handlers.insert(path, Arc::new(handler));
        self
    }

    /// Validate the configuration, connect and start the session.
    ///
    /// Registration proceeds in the background unless `lazyStart` is set,
    /// in which case it waits for [`Client::trigger_update`].
    pub async fn start(self) -> Result<Client, ClientError> {
        let config = self.config;
        config.validate()?;

        let credentials = if config.enable_dtls {
            if self.dtls.is_none() {
                return Err(ConfigError::DtlsUnavailable.into());
            }
            Some(PskCredentials {
                identity: config.psk_identity.clone().unwrap_or_default(),
                key: config.psk_key()?.unwrap_or_default(),
            })
        } else {
            None
        };

        let mut channel: Arc<dyn DatagramChannel> = match self.channel {
            Some(channel) => channel,
            None => Arc::new(UdpChannel::connect(&config).await?),
        };
        if let (Some(connector), Some(credentials)) = (&self.dtls, &credentials) {
            channel = connector.handshake(channel, credentials).await?;
            info!("DTLS session established with {}", channel.peer());
        }

        let transport = Arc::new(Transport::open(channel, TransportConfig::from(&config)));
        let inbound = transport.listen()?;

        let store: Box<dyn ResourceStore> = match self.store {
            Some(store) => store,
            None => Box::new(default_store(&config)),
        };

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        info!(
            "Starting LwM2M client {} for {}:{}",
            config.client_name, config.server_host, config.server_port
        );

        let event_loop = EventLoop {
            session: Session::new(&config.client_name, config.lifetime),
            config,
            store,
            observations: ObservationManager::new(),
            subscriptions: LocalSubscriptions::new(),
            dispatcher: Dispatcher::new(),
            handlers: Arc::new(self.handlers),
            transport,
            events: events.clone(),
            state: state_tx,
            completions: completion_tx,
            timer: None,
            exchange_in_flight: false,
            update_pending: None,
        };
        let task = tokio::spawn(event_loop.run(command_rx, completion_rx, inbound));

        Ok(Client {
            commands: command_tx,
            state: state_rx,
            events,
            task: Mutex::new(Some(task)),
        })
    }
}

/// The built-in Server (1) and Device (3) objects with default values.
pub fn default_store(config: &ClientConfig) -> MemoryStore {
    let registry = ObjectRegistry::with_builtin();
    let mut store = MemoryStore::new();
    for object_id in [1, 3] {
        if let Err(e) = registry.instantiate(&mut store, object_id, 0) {
            warn!("Cannot create object {}: {}", object_id, e);
        }
    }
    seed_lifetime(&mut store, config);
    store
}

/// Copy the configured lifetime into the Server Object, when the store has one.
pub fn seed_lifetime(store: &mut dyn ResourceStore, config: &ClientConfig) {
    if store.describe(&SERVER_LIFETIME).is_ok() {
        let _ = store.update(&SERVER_LIFETIME, Value::Integer(i64::from(config.lifetime)));
    }
}

/// Handle to a running client.
pub struct Client {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    events: broadcast::Sender<ClientEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Start a client with the built-in objects.
    pub async fn start(config: ClientConfig) -> Result<Client, ClientError> {
        ClientBuilder::new(config).start().await
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait until the session reaches `target`, or a terminal state.
    pub async fn wait_for(&self, target: SessionState) -> SessionState {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            if current == target || current.is_terminal() {
                return current;
            }
            if state.changed().await.is_err() {
                return *state.borrow();
            }
        }
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Read a readable resource.
    pub async fn read(&self, path: &str) -> Result<Value, ClientError> {
        let path: ResourcePath = path.parse()?;
        self.request(|reply| Command::Read { path, reply }).await?.map_err(Into::into)
    }

    /// Read every readable value under an object or instance.
    pub async fn read_tree(&self, path: &str) -> Result<Snapshot, ClientError> {
        let path: ResourcePath = path.parse()?;
        self.request(|reply| Command::ReadTree { path, reply })
            .await?
            .map_err(Into::into)
    }

    /// Write a writable resource as the server would.
    pub async fn write(&self, path: &str, value: impl Into<Value>) -> Result<(), ClientError> {
        let path: ResourcePath = path.parse()?;
        let value = value.into();
        self.request(|reply| Command::Write {
            path,
            value,
            check_acl: true,
            reply,
        })
        .await?
        .map_err(Into::into)
    }

    /// Set a resource value from the device side (sensor readings), even
    /// if the server may not write it.
    pub async fn update(&self, path: &str, value: impl Into<Value>) -> Result<(), ClientError> {
        let path: ResourcePath = path.parse()?;
        let value = value.into();
        self.request(|reply| Command::Write {
            path,
            value,
            check_acl: false,
            reply,
        })
        .await?
        .map_err(Into::into)
    }

    /// Execute a resource, running its handler if one is registered.
    pub async fn execute(&self, path: &str, args: &str) -> Result<(), ClientError> {
        let path: ResourcePath = path.parse()?;
        let args = args.to_string();
        self.request(|reply| Command::Execute { path, args, reply })
            .await?
            .map_err(Into::into)
    }

    /// Call `callback` on every value change at or below `path`.
    pub async fn observe<F>(&self, path: &str, callback: F) -> Result<Uuid, ClientError>
    where
        F: Fn(&ResourcePath, &Value) + Send + Sync + 'static,
    {
        let path: ResourcePath = path.parse()?;
        let callback: SubscriptionCallback = Arc::new(callback);
        self.request(|reply| Command::Observe {
            path,
            callback,
            reply,
        })
        .await?
        .map_err(Into::into)
    }

    /// Remove a subscription. Returns `false` for an unknown handle.
    pub async fn unobserve(&self, handle: Uuid) -> Result<bool, ClientError> {
        self.request(|reply| Command::Unobserve { handle, reply }).await
    }

    /// Add or replace a resource. New object instances are announced to
    /// the server with a registration update.
    pub async fn insert(&self, path: &str, resource: Resource) -> Result<(), ClientError> {
        let path: ResourcePath = path.parse()?;
        self.request(|reply| Command::Insert {
            path,
            resource,
            reply,
        })
        .await
    }

    /// Remove everything at or below `path`, returning the removed paths.
    pub async fn remove(&self, path: &str) -> Result<Vec<ResourcePath>, ClientError> {
        let path: ResourcePath = path.parse()?;
        self.request(|reply| Command::Remove { path, reply }).await
    }

    /// Send a registration update now, or register if the client was
    /// started lazily.
    pub async fn trigger_update(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::TriggerUpdate { reply }).await
    }

    /// Deregister and stop. Completes even if the server never answers.
    pub async fn stop(&self) -> Result<(), ClientError> {
        self.shutdown(true).await
    }

    /// Stop the client, optionally without deregistering.
    pub async fn shutdown(&self, deregister: bool) -> Result<(), ClientError> {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Stop { deregister, reply }).await.is_ok() {
            let _ = done.await;
        }

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("Client event loop panicked");
                }
            }
        }
        Ok(())
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ClientError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| ClientError::Stopped)?;
        response.await.map_err(|_| ClientError::Stopped)
    }
}

// ============================================================================
// Event loop
// ============================================================================

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Read {
        path: ResourcePath,
        reply: Reply<Result<Value, ResourceError>>,
    },
    ReadTree {
        path: ResourcePath,
        reply: Reply<Result<Snapshot, ResourceError>>,
    },
    Write {
        path: ResourcePath,
        value: Value,
        check_acl: bool,
        reply: Reply<Result<(), ResourceError>>,
    },
    Execute {
        path: ResourcePath,
        args: String,
        reply: Reply<Result<(), ResourceError>>,
    },
    Observe {
        path: ResourcePath,
        callback: SubscriptionCallback,
        reply: Reply<Result<Uuid, ResourceError>>,
    },
    Unobserve {
        handle: Uuid,
        reply: Reply<bool>,
    },
    Insert {
        path: ResourcePath,
        resource: Resource,
        reply: Reply<()>,
    },
    Remove {
        path: ResourcePath,
        reply: Reply<Vec<ResourcePath>>,
    },
    TriggerUpdate {
        reply: Reply<()>,
    },
    Stop {
        deregister: bool,
        reply: Reply<()>,
    },
}

/// Results reported by worker tasks.
enum Completion {
    Registered(Result<Message, TransportError>),
    Updated(Result<Message, TransportError>),
    Executed { path: ResourcePath, code: Code },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerAction {
    Register,
    Update,
}

struct EventLoop {
    config: ClientConfig,
    session: Session,
    store: Box<dyn ResourceStore>,
    observations: ObservationManager,
    subscriptions: LocalSubscriptions,
    dispatcher: Dispatcher,
    handlers: Arc<Handlers>,
    transport: Arc<Transport>,
    events: broadcast::Sender<ClientEvent>,
    state: watch::Sender<SessionState>,
    completions: mpsc::UnboundedSender<Completion>,
    /// Next registration or update attempt.
    timer: Option<(Instant, TimerAction)>,
    exchange_in_flight: bool,
    /// An update was asked for while another exchange was running;
    /// `true` if it must carry the object list.
    update_pending: Option<bool>,
}

impl EventLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut inbound: impl Stream<Item = Inbound> + Send + Unpin,
    ) {
        if self.config.lazy_start {
            info!("Lazy start: waiting for a registration trigger");
        } else {
            self.begin_registration();
        }

        let mut inbound_open = true;
        loop {
            let deadline = self.next_deadline();
            let sleep = time::sleep_until(deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)));

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Stop { deregister, reply }) => {
                        self.stop(deregister).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("Client handle dropped, stopping");
                        self.stop(false).await;
                        break;
                    }
                },
                Some(completion) = completions.recv() => self.handle_completion(completion),
                item = inbound.next(), if inbound_open => match item {
                    Some(Inbound::Request(request)) => self.handle_request(request),
                    Some(Inbound::Reset(message_id)) => {
                        self.observations.cancel_by_message_id(message_id);
                    }
                    None => {
                        error!("Transport receive loop ended");
                        inbound_open = false;
                    }
                },
                _ = sleep, if deadline.is_some() => self.on_timer(),
            }
        }

        info!("LwM2M client {} stopped", self.config.client_name);
    }

    fn next_deadline(&self) -> Option<Instant> {
        let timer = self.timer.map(|(at, _)| at);
        let observe = if self.session.state().is_registered() {
            self.observations.next_deadline()
        } else {
            None
        };
        match (timer, observe) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ========================================================================
    // Session
    // ========================================================================

    fn transition(&mut self, to: SessionState) -> bool {
        match self.session.transition(to) {
            Ok(from) => {
                let _ = self.state.send(to);
                let _ = self.events.send(ClientEvent::StateChanged { from, to });
                true
            }
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    fn begin_registration(&mut self) {
        if !self.transition(SessionState::Registering) {
            return;
        }
        // A new registration starts without server observations.
        self.observations.clear();
        self.session.clear_location();
        self.timer = None;

        let request = self.session.registration_request(&self.store.object_links());
        self.spawn_exchange(request, Completion::Registered);
    }

    fn begin_update(&mut self, with_objects: bool) {
        if self.exchange_in_flight || self.session.state() != SessionState::Registered {
            self.update_pending = Some(self.update_pending.unwrap_or(false) || with_objects);
            return;
        }

        let objects = with_objects.then(|| self.store.object_links());
        let Some(request) = self.session.update_request(objects.as_deref()) else {
            self.begin_registration();
            return;
        };
        if self.transition(SessionState::Updating) {
            self.timer = None;
            self.spawn_exchange(request, Completion::Updated);
        }
    }

    fn spawn_exchange(&mut self, request: Message, complete: fn(Result<Message, TransportError>) -> Completion) {
        self.exchange_in_flight = true;
        let transport = self.transport.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = transport.send(request).await;
            let _ = completions.send(complete(result));
        });
    }

    fn schedule_update(&mut self) {
        self.timer = Some((Instant::now() + self.session.update_interval(), TimerAction::Update));
    }

    fn on_registration_result(&mut self, result: Result<Message, TransportError>) {
        if self.session.state() != SessionState::Registering {
            return;
        }
        let outcome = result
            .map_err(RegistrationError::from)
            .and_then(|response| self.session.on_registered(&response));

        match outcome {
            Ok(location) => {
                if !self.transition(SessionState::Registered) {
                    return;
                }
                let _ = self.events.send(ClientEvent::Registered { location });
                self.schedule_update();
                self.update_pending = None;

                for request in self.dispatcher.drain_queue() {
                    self.handle_request(request);
                }
            }
            Err(e) => self.on_failure(e),
        }
    }

    fn on_update_result(&mut self, result: Result<Message, TransportError>) {
        if self.session.state() != SessionState::Updating {
            return;
        }
        let outcome = result
            .map_err(RegistrationError::from)
            .and_then(|response| self.session.on_updated(&response));

        match outcome {
            Ok(()) => {
                debug!("Registration updated");
                if self.transition(SessionState::Registered) {
                    self.schedule_update();
                    if let Some(with_objects) = self.update_pending.take() {
                        self.begin_update(with_objects);
                    }
                }
            }
            Err(e) if e.is_unknown_registration() => {
                info!("Server lost our registration, registering again");
                self.begin_registration();
            }
            Err(e) => self.on_failure(e),
        }
    }

    fn on_failure(&mut self, error: RegistrationError) {
        warn!("Registration exchange failed: {}", error);
        if !self.transition(SessionState::Error) {
            return;
        }
        self.update_pending = None;

        match self.session.record_failure(&self.config.reconnect) {
            Recovery::RetryAfter(delay) => {
                self.timer = Some((Instant::now() + delay, TimerAction::Register));
            }
            Recovery::Fatal => {
                error!("Giving up on registration: {}", error);
                self.timer = None;
                let _ = self.events.send(ClientEvent::Error(error.to_string()));
            }
            Recovery::Exhausted => self.timer = None,
        }
    }

    fn on_timer(&mut self) {
        let now = Instant::now();
        if let Some((at, action)) = self.timer {
            if at <= now {
                self.timer = None;
                match action {
                    TimerAction::Register => self.begin_registration(),
                    TimerAction::Update => self.begin_update(false),
                }
            }
        }

        if self.session.state().is_registered() {
            let store = &*self.store;
            let notifications = self.observations.on_tick(now, |p| read_values(store, p).ok());
            self.send_notifications(notifications);
        }
    }

    async fn stop(&mut self, deregister: bool) {
        self.timer = None;
        let state = self.session.state();

        if matches!(
            state,
            SessionState::Registered | SessionState::Updating | SessionState::Error
        ) {
            self.transition(SessionState::Deregistering);
            if let Some(request) = self.session.deregister_request().filter(|_| deregister) {
                let timeout = Duration::from_millis(self.config.deregister_timeout_ms);
                match time::timeout(timeout, self.transport.send(request)).await {
                    Ok(Ok(response)) if response.code == Code::DELETED => {
                        info!("Deregistered {}", self.config.client_name);
                    }
                    Ok(Ok(response)) => warn!("Deregistration answered with {}", response.code),
                    Ok(Err(e)) => warn!("Deregistration failed: {}", e),
                    Err(_) => warn!("Deregistration timed out after {:?}", timeout),
                }
            }
            self.session.clear_location();
            let _ = self.events.send(ClientEvent::Deregistered);
        }

        if !self.session.state().is_terminal() {
            self.transition(SessionState::Stopped);
        }
        self.observations.clear();
        self.transport.close();
    }

    // ========================================================================
    // Server requests
    // ========================================================================

    fn handle_request(&mut self, request: Message) {
        if !self.session.state().is_registered() {
            self.dispatcher.enqueue(request);
            return;
        }

        let dispatched = self.dispatcher.handle(
            self.store.as_mut(),
            &mut self.observations,
            &request,
            Instant::now(),
        );

        if let Some(response) = dispatched.response {
            if let Err(e) = self.transport.respond(&request, response) {
                warn!("Cannot answer {}: {}", request, e);
            }
        }
        if let Some(job) = dispatched.execute {
            self.spawn_execute(job);
        }
        if let Some((operation, path)) = dispatched.handled {
            self.object_event(operation, path);
        }
        self.apply_effects(dispatched.effects);
    }

    fn apply_effects(&mut self, effects: Effects) {
        if !effects.removed.is_empty() {
            let store = &*self.store;
            self.subscriptions.prune(|p| store.discover(p).is_ok());
        }
        if let Some(lifetime) = effects.lifetime {
            info!("Registration lifetime changed to {} s", lifetime);
            self.session.set_lifetime(lifetime);
        }
        self.notify_changes(effects.changed);
        if effects.update_registration || effects.lifetime.is_some() {
            self.begin_update(!effects.removed.is_empty());
        }
    }

    fn spawn_execute(&self, job: ExecuteJob) {
        let handler = self.handlers.get(&job.path).cloned();
        let transport = self.transport.clone();
        let completions = self.completions.clone();

        tokio::spawn(async move {
            let ExecuteJob { request, path, args } = job;
            let mut work = tokio::spawn(async move {
                match handler {
                    Some(handler) => handler.execute(path, args).await,
                    None => Ok(()),
                }
            });

            let code = if request.is_confirmable() {
                match time::timeout(EXECUTE_ACK_DELAY, &mut work).await {
                    Ok(joined) => {
                        let code = execute_code(joined);
                        let _ = transport.respond(&request, Message::piggybacked_response(&request, code));
                        code
                    }
                    Err(_) => {
                        debug!("Execute {} is slow, answering separately", path);
                        let _ = transport.respond(&request, Message::empty_ack(request.message_id));
                        let code = execute_code(work.await);
                        let mut response = Message::new(MessageType::Confirmable, code, 0);
                        response.token = request.token.clone();
                        if let Err(e) = transport.send(response).await {
                            warn!("Separate Execute response for {} failed: {}", path, e);
                        }
                        code
                    }
                }
            } else {
                let code = execute_code(work.await);
                let _ = transport.respond(&request, Message::piggybacked_response(&request, code));
                code
            };

            let _ = completions.send(Completion::Executed { path, code });
        });
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Registered(result) => {
                self.exchange_in_flight = false;
                self.on_registration_result(result);
            }
            Completion::Updated(result) => {
                self.exchange_in_flight = false;
                self.on_update_result(result);
            }
            Completion::Executed { path, code } => {
                debug!("Execute {} finished with {}", path, code);
            }
        }
    }

    // ========================================================================
    // Host commands
    // ========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Read { path, reply } => {
                self.dispatcher.clock().refresh(self.store.as_mut(), &path);
                let _ = reply.send(self.store.get(&path));
            }
            Command::ReadTree { path, reply } => {
                self.dispatcher.clock().refresh(self.store.as_mut(), &path);
                let _ = reply.send(read_values(&*self.store, &path));
            }
            Command::Write {
                path,
                value,
                check_acl,
                reply,
            } => {
                let result = if check_acl {
                    self.store.set(&path, value)
                } else {
                    self.store.update(&path, value)
                };
                match result {
                    Ok(changed) => {
                        let _ = reply.send(Ok(()));
                        self.object_event("write", path);
                        let mut effects = Effects::default();
                        let stored = self.store.get(&path).ok();
                        self.dispatcher
                            .apply_side_effects(&path, stored.as_ref(), &mut effects);
                        if let (true, Some(value)) = (changed, stored) {
                            effects.changed.push((path, value));
                        }
                        self.apply_effects(effects);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Execute { path, args, reply } => self.execute(path, args, reply),
            Command::Observe {
                path,
                callback,
                reply,
            } => {
                let result = self
                    .store
                    .discover(&path)
                    .map(|_| self.subscriptions.subscribe(path, callback));
                let _ = reply.send(result);
            }
            Command::Unobserve { handle, reply } => {
                let _ = reply.send(self.subscriptions.unsubscribe(&handle));
            }
            Command::Insert {
                path,
                resource,
                reply,
            } => {
                let new_instance = path
                    .instance_path()
                    .map_or(false, |instance| !self.store.object_links().contains(&instance));
                let value = resource.value().cloned();
                self.store.insert(path, resource);
                let _ = reply.send(());

                self.object_event("insert", path);
                if let Some(value) = value {
                    self.notify_changes(vec![(path, value)]);
                }
                if new_instance && self.session.state().is_registered() {
                    self.begin_update(true);
                }
            }
            Command::Remove { path, reply } => {
                let removed = self.store.remove(&path);
                if !removed.is_empty() {
                    let store = &*self.store;
                    self.observations.prune(|p| store.discover(p).is_ok());
                    self.subscriptions.prune(|p| store.discover(p).is_ok());
                    self.object_event("remove", path);
                    if self.session.state().is_registered() {
                        self.begin_update(true);
                    }
                }
                let _ = reply.send(removed);
            }
            Command::TriggerUpdate { reply } => {
                match self.session.state() {
                    SessionState::Idle | SessionState::Error => self.begin_registration(),
                    _ => self.begin_update(false),
                }
                let _ = reply.send(());
            }
            Command::Stop { .. } => {}
        }
    }

    fn execute(&mut self, path: ResourcePath, args: String, reply: Reply<Result<(), ResourceError>>) {
        if let Err(e) = self.store.execute(&path, &args) {
            let _ = reply.send(Err(e));
            return;
        }
        self.object_event("execute", path);

        if path == REGISTRATION_UPDATE_TRIGGER {
            self.begin_update(false);
            let _ = reply.send(Ok(()));
            return;
        }

        match self.handlers.get(&path).cloned() {
            Some(handler) => {
                tokio::spawn(async move {
                    let _ = reply.send(handler.execute(path, args).await);
                });
            }
            None => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    fn notify_changes(&mut self, changes: Vec<(ResourcePath, Value)>) {
        if changes.is_empty() {
            return;
        }
        self.subscriptions.dispatch(&changes);

        if self.session.state().is_registered() {
            let paths: Vec<ResourcePath> = changes.iter().map(|(p, _)| *p).collect();
            let store = &*self.store;
            let notifications = self
                .observations
                .on_change(&paths, Instant::now(), |p| read_values(store, p).ok());
            self.send_notifications(notifications);
        }
    }

    fn send_notifications(&mut self, notifications: Vec<Notification>) {
        for notification in notifications {
            match self.transport.send_non_confirmable(notification.to_message()) {
                Ok(message_id) => {
                    debug!(
                        "Notified {} (sequence {})",
                        notification.path, notification.sequence
                    );
                    self.observations.record_sent(&notification.token, message_id);
                }
                Err(e) => warn!("Notification for {} failed: {}", notification.path, e),
            }
        }
    }

    fn object_event(&self, operation: &str, path: ResourcePath) {
        let _ = self.events.send(ClientEvent::ObjectEvent {
            operation: operation.to_string(),
            path,
            timestamp: Utc::now(),
        });
    }
}

fn execute_code(joined: Result<Result<(), ResourceError>, JoinError>) -> Code {
    match joined {
        Ok(Ok(())) => Code::CHANGED,
        Ok(Err(e)) => error_code(&e),
        Err(e) => {
            error!("Execute handler failed: {}", e);
            Code::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_store_has_builtin_objects() {
        let config = ClientConfig::new("dev1", "127.0.0.1", 5683);
        let store = default_store(&config);
        let links = store.object_links();
        assert!(links.contains(&ResourcePath::instance(1, 0)));
        assert!(links.contains(&ResourcePath::instance(3, 0)));
        assert_eq!(store.get(&SERVER_LIFETIME), Ok(Value::Integer(i64::from(config.lifetime))));
    }

    #[test]
    fn test_seed_lifetime_skips_store_without_server_object() {
        let mut config = ClientConfig::new("dev1", "127.0.0.1", 5683);
        config.lifetime = 120;

        let mut store = MemoryStore::new();
        store.insert(ResourcePath::resource(3, 0, 0), Resource::readable("Acme"));
        seed_lifetime(&mut store, &config);
        assert!(store.get(&SERVER_LIFETIME).is_err());

        store.insert(SERVER_LIFETIME, Resource::writable(300i64));
        seed_lifetime(&mut store, &config);
        assert_eq!(store.get(&SERVER_LIFETIME), Ok(Value::Integer(120)));
    }

    #[tokio::test]
    async fn test_closure_execute_handler() {
        let handler = |path: ResourcePath, args: String| {
            if args.is_empty() {
                Ok(())
            } else {
                Err(ResourceError::BadRequest {
                    path,
                    reason: "no arguments expected".to_string(),
                })
            }
        };
        let path = ResourcePath::resource(3, 0, 4);
        assert_eq!(handler.execute(path, String::new()).await, Ok(()));
        assert!(handler.execute(path, "1".to_string()).await.is_err());
    }

    #[test]
    fn test_execute_code_mapping() {
        assert_eq!(execute_code(Ok(Ok(()))), Code::CHANGED);
        assert_eq!(
            execute_code(Ok(Err(ResourceError::NotFound(ResourcePath::object(9))))),
            Code::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_dtls_without_connector_is_config_error() {
        let mut config = ClientConfig::new("dev1", "127.0.0.1", 5683);
        config.enable_dtls = true;
        config.psk_identity = Some("dev1".to_string());
        config.psk_key = Some("00112233".to_string());

        let result = Client::start(config).await;
        assert!(matches!(
            result,
            Err(ClientError::Config(ConfigError::DtlsUnavailable))
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_network() {
        let config = ClientConfig::new("", "127.0.0.1", 5683);
        assert!(matches!(
            Client::start(config).await,
            Err(ClientError::Config(_))
        ));
    }
}
