//! Server operation dispatch.
//!
//! The dispatcher turns inbound requests into store and observation
//! changes and builds the piggybacked response. Execute requests are handed
//! back to the caller as an [`ExecuteJob`], because handlers run on worker
//! tasks outside the event loop.

use std::collections::VecDeque;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use lwm2m_core::{Operations, ResourceError, ResourcePath, ResourceStore, Value, ValueKind};
use lwm2m_protocol::content::{decode_senml, format_links, Link};
use lwm2m_protocol::{Code, ContentFormat, Message, Operation, OperationError};

use crate::observe::{encode_snapshot, ObservationManager, Snapshot};

/// Requests kept while the client is not registered.
const MAX_QUEUED_REQUESTS: usize = 32;

/// Server Object lifetime resource.
pub const SERVER_LIFETIME: ResourcePath = ResourcePath::resource(1, 0, 1);
/// Server Object "Registration Update Trigger".
pub const REGISTRATION_UPDATE_TRIGGER: ResourcePath = ResourcePath::resource(1, 0, 8);
/// Device Object "Current Time".
pub const CURRENT_TIME: ResourcePath = ResourcePath::resource(3, 0, 13);

/// HTTP-like status for a store error.
pub fn error_code(error: &ResourceError) -> Code {
    match error {
        ResourceError::NotFound(_) => Code::NOT_FOUND,
        ResourceError::Unauthorized(_) => Code::UNAUTHORIZED,
        ResourceError::BadRequest { .. } => Code::BAD_REQUEST,
        ResourceError::NotExecutable(_) => Code::METHOD_NOT_ALLOWED,
    }
}

/// An Execute request waiting for its handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteJob {
    pub request: Message,
    pub path: ResourcePath,
    pub args: String,
}

/// Side effects of a handled request that the event loop acts on.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Effects {
    /// Values that changed; feeds notifications and host subscriptions.
    pub changed: Vec<(ResourcePath, Value)>,
    /// Object instances that were deleted.
    pub removed: Vec<ResourcePath>,
    /// New registration lifetime written by the server.
    pub lifetime: Option<u32>,
    /// The server asked for a registration update.
    pub update_registration: bool,
}

/// Result of dispatching one request.
#[derive(Debug, Default)]
pub struct Dispatched {
    /// Piggybacked response, unless an Execute handler will answer.
    pub response: Option<Message>,
    pub execute: Option<ExecuteJob>,
    pub effects: Effects,
    /// Operation name and path for the object event, on success.
    pub handled: Option<(&'static str, ResourcePath)>,
}

impl Dispatched {
    fn respond(response: Message) -> Self {
        Self {
            response: Some(response),
            ..Default::default()
        }
    }
}

/// Device clock backing the Current Time resource.
///
/// A server write sets an offset against the system clock; reads return
/// system time plus that offset.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceClock {
    offset_ms: i64,
}

impl DeviceClock {
    /// Seconds since the epoch on the device clock.
    pub fn now(&self) -> i64 {
        (Utc::now().timestamp_millis() + self.offset_ms).div_euclid(1000)
    }

    pub fn set(&mut self, timestamp: i64) {
        self.offset_ms = timestamp.saturating_mul(1000) - Utc::now().timestamp_millis();
    }

    /// Store the current time if `path` covers the Current Time resource.
    pub fn refresh(&self, store: &mut dyn ResourceStore, path: &ResourcePath) {
        if CURRENT_TIME.starts_with(path) {
            let _ = store.update(&CURRENT_TIME, Value::Integer(self.now()));
        }
    }
}

/// Routes server requests to the store and the observation manager.
#[derive(Debug, Default)]
pub struct Dispatcher {
    queue: VecDeque<Message>,
    clock: DeviceClock,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clock(&self) -> &DeviceClock {
        &self.clock
    }

    /// Hold a request until the session is registered.
    pub fn enqueue(&mut self, request: Message) {
        if self.queue.len() >= MAX_QUEUED_REQUESTS {
            if let Some(dropped) = self.queue.pop_front() {
                warn!("Request queue full, dropping {}", dropped);
            }
        }
        debug!("Queued {} until registered", request);
        self.queue.push_back(request);
    }

    /// Take queued requests in arrival order.
    pub fn drain_queue(&mut self) -> Vec<Message> {
        self.queue.drain(..).collect()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Handle one server request.
    pub fn handle(
        &mut self,
        store: &mut dyn ResourceStore,
        observations: &mut ObservationManager,
        request: &Message,
        now: Instant,
    ) -> Dispatched {
        let operation = match Operation::from_request(request) {
            Ok(operation) => operation,
            Err(e) => {
                debug!("Rejecting {}: {}", request, e);
                return Dispatched::respond(Message::piggybacked_response(request, e.code()));
            }
        };

        debug!("Server {} {}", operation.name(), operation.path());
        let name = operation.name();
        let path = *operation.path();

        let mut dispatched = match operation {
            Operation::Read { path, accept } => self.read(store, request, &path, accept),
            Operation::Discover { path } => discover(store, observations, request, &path),
            Operation::Write {
                path,
                format,
                payload,
                ..
            } => self.write(store, request, &path, format, &payload),
            Operation::WriteAttributes { path, changes } => {
                let result = store
                    .discover(&path)
                    .map_err(|e| error_code(&e))
                    .and_then(|_| {
                        observations
                            .write_attributes(path, &changes)
                            .map_err(|e| e.code())
                    });
                let code = result.map(|_| Code::CHANGED).unwrap_or_else(|code| code);
                Dispatched::respond(Message::piggybacked_response(request, code))
            }
            Operation::Execute { path, args } => execute(store, request, path, args),
            Operation::Observe { path, accept } => {
                self.observe(store, observations, request, path, accept, now)
            }
            Operation::CancelObserve { path } => {
                if observations.cancel(&path, &request.token) {
                    info!("Server cancelled observation of {}", path);
                }
                self.read(store, request, &path, None)
            }
            Operation::Delete { path } => delete(store, observations, request, &path),
        };

        if dispatched
            .response
            .as_ref()
            .map_or(true, |response| response.code.is_success())
        {
            dispatched.handled = Some((name, path));
        }
        dispatched
    }

    fn read(
        &self,
        store: &mut dyn ResourceStore,
        request: &Message,
        path: &ResourcePath,
        accept: Option<ContentFormat>,
    ) -> Dispatched {
        if let Some(ContentFormat::Other(format)) = accept {
            debug!("Cannot produce content format {}", format);
            return Dispatched::respond(Message::piggybacked_response(request, Code::NOT_ACCEPTABLE));
        }

        self.clock.refresh(store, path);
        let response = match read_values(store, path) {
            Ok(values) => content_response(request, path, accept, &values),
            Err(e) => Message::piggybacked_response(request, error_code(&e)),
        };
        Dispatched::respond(response)
    }

    fn write(
        &mut self,
        store: &mut dyn ResourceStore,
        request: &Message,
        path: &ResourcePath,
        format: ContentFormat,
        payload: &[u8],
    ) -> Dispatched {
        let values = match decode_write(store, path, format, payload) {
            Ok(values) => values,
            Err(code) => return Dispatched::respond(Message::piggybacked_response(request, code)),
        };

        // Validate everything before touching the store.
        if let Err(e) = values.iter().try_for_each(|(p, v)| check_write(store, p, v)) {
            debug!("Write to {} rejected: {}", path, e);
            return Dispatched::respond(Message::piggybacked_response(request, error_code(&e)));
        }

        let mut dispatched = Dispatched::respond(Message::piggybacked_response(request, Code::CHANGED));
        for (target, value) in values {
            match store.set(&target, value) {
                Ok(changed) => {
                    let stored = store.get(&target).ok();
                    self.apply_side_effects(&target, stored.as_ref(), &mut dispatched.effects);
                    if let (true, Some(stored)) = (changed, stored) {
                        dispatched.effects.changed.push((target, stored));
                    }
                }
                Err(e) => {
                    warn!("Write to {} failed after validation: {}", target, e);
                    dispatched.response = Some(Message::piggybacked_response(request, error_code(&e)));
                    break;
                }
            }
        }
        dispatched
    }

    /// Record what a stored write to `path` implies beyond the store: a new
    /// registration lifetime or a Current Time offset. Host writes go
    /// through here as well as server writes.
    pub fn apply_side_effects(&mut self, path: &ResourcePath, value: Option<&Value>, effects: &mut Effects) {
        match (*path, value) {
            (SERVER_LIFETIME, Some(Value::Integer(lifetime))) => {
                if let Ok(lifetime) = u32::try_from(*lifetime) {
                    if lifetime > 0 {
                        effects.lifetime = Some(lifetime);
                    }
                }
            }
            (CURRENT_TIME, Some(Value::Integer(timestamp))) => self.clock.set(*timestamp),
            _ => {}
        }
    }

    fn observe(
        &self,
        store: &mut dyn ResourceStore,
        observations: &mut ObservationManager,
        request: &Message,
        path: ResourcePath,
        accept: Option<ContentFormat>,
        now: Instant,
    ) -> Dispatched {
        if let Some(ContentFormat::Other(_)) = accept {
            return Dispatched::respond(Message::piggybacked_response(request, Code::NOT_ACCEPTABLE));
        }

        self.clock.refresh(store, &path);
        let values = match read_values(store, &path) {
            Ok(values) => values,
            Err(e) => {
                return Dispatched::respond(Message::piggybacked_response(request, error_code(&e)))
            }
        };

        let sequence = observations.observe(path, request.token.clone(), accept, values.clone(), now);
        info!("Server observes {}", path);
        let mut response = content_response(request, &path, accept, &values);
        response.set_observe(sequence);
        Dispatched::respond(response)
    }
}

/// Values at `path`: the single value of a resource, or every readable
/// value below an object or instance.
pub fn read_values(store: &dyn ResourceStore, path: &ResourcePath) -> Result<Snapshot, ResourceError> {
    if path.is_resource() {
        match store.get(path) {
            Ok(value) => Ok(vec![(*path, value)]),
            // Multi-instance resources are stored per resource instance.
            Err(ResourceError::NotFound(_)) if path.resource_instance_id().is_none() => {
                let values = store.read_tree(path)?;
                if values.is_empty() {
                    Err(ResourceError::Unauthorized(*path))
                } else {
                    Ok(values)
                }
            }
            Err(e) => Err(e),
        }
    } else {
        store.read_tree(path)
    }
}

fn content_response(
    request: &Message,
    path: &ResourcePath,
    accept: Option<ContentFormat>,
    values: &[(ResourcePath, Value)],
) -> Message {
    let mut response = Message::piggybacked_response(request, Code::CONTENT);
    let (format, payload) = encode_snapshot(path, accept, values);
    response.set_content_format(format).set_payload(payload);
    response
}

fn discover(
    store: &dyn ResourceStore,
    observations: &ObservationManager,
    request: &Message,
    path: &ResourcePath,
) -> Dispatched {
    let entries = match store.discover(path) {
        Ok(entries) => entries,
        Err(e) => return Dispatched::respond(Message::piggybacked_response(request, error_code(&e))),
    };

    let mut links = Vec::with_capacity(entries.len() + 1);
    if !entries.iter().any(|(p, _)| p == path) {
        links.push(annotated_link(observations, *path));
    }
    links.extend(entries.into_iter().map(|(p, _)| annotated_link(observations, p)));

    let mut response = Message::piggybacked_response(request, Code::CONTENT);
    response
        .set_content_format(ContentFormat::LinkFormat)
        .set_payload(format_links(&links).into_bytes());
    Dispatched::respond(response)
}

fn annotated_link(observations: &ObservationManager, path: ResourcePath) -> Link {
    match observations.attributes(&path) {
        Some(attributes) => attributes.annotate(Link::from(path)),
        None => Link::from(path),
    }
}

fn execute(store: &dyn ResourceStore, request: &Message, path: ResourcePath, args: String) -> Dispatched {
    if let Err(e) = store.execute(&path, &args) {
        debug!("Execute {} rejected: {}", path, e);
        return Dispatched::respond(Message::piggybacked_response(request, error_code(&e)));
    }

    if path == REGISTRATION_UPDATE_TRIGGER {
        let mut dispatched = Dispatched::respond(Message::piggybacked_response(request, Code::CHANGED));
        dispatched.effects.update_registration = true;
        return dispatched;
    }

    Dispatched {
        execute: Some(ExecuteJob {
            request: request.clone(),
            path,
            args,
        }),
        ..Default::default()
    }
}

fn delete(
    store: &mut dyn ResourceStore,
    observations: &mut ObservationManager,
    request: &Message,
    path: &ResourcePath,
) -> Dispatched {
    let removed = store.remove(path);
    if removed.is_empty() {
        return Dispatched::respond(Message::piggybacked_response(request, Code::NOT_FOUND));
    }

    info!("Server deleted {}", path);
    let remaining = &*store;
    observations.prune(|p| remaining.discover(p).is_ok());
    let mut dispatched = Dispatched::respond(Message::piggybacked_response(request, Code::DELETED));
    dispatched.effects.removed.push(*path);
    dispatched.effects.update_registration = true;
    dispatched
}

/// Decode a write payload into target paths and values.
fn decode_write(
    store: &dyn ResourceStore,
    path: &ResourcePath,
    format: ContentFormat,
    payload: &[u8],
) -> Result<Vec<(ResourcePath, Value)>, Code> {
    match format {
        ContentFormat::TextPlain | ContentFormat::Opaque => {
            if !path.is_resource() {
                return Err(Code::BAD_REQUEST);
            }
            let (operations, kind) = store.describe(path).map_err(|e| error_code(&e))?;
            if !operations.write {
                return Err(Code::UNAUTHORIZED);
            }
            let kind = kind.ok_or(Code::METHOD_NOT_ALLOWED)?;
            let kind = match format {
                ContentFormat::Opaque if kind != ValueKind::Opaque => {
                    return Err(Code::UNSUPPORTED_CONTENT_FORMAT)
                }
                _ => kind,
            };
            let value = Value::parse_text(kind, payload).map_err(|_| Code::BAD_REQUEST)?;
            Ok(vec![(*path, value)])
        }
        ContentFormat::SenmlJson => {
            let values = decode_senml(payload).map_err(|e| {
                debug!("Bad SenML payload: {}", e);
                Code::BAD_REQUEST
            })?;
            if values.is_empty() || values.iter().any(|(p, _)| !p.starts_with(path)) {
                return Err(Code::BAD_REQUEST);
            }
            Ok(values)
        }
        ContentFormat::LinkFormat => Err(Code::UNSUPPORTED_CONTENT_FORMAT),
        ContentFormat::Other(n) => Err(OperationError::UnsupportedContentFormat(n).code()),
    }
}

fn check_write(store: &dyn ResourceStore, path: &ResourcePath, value: &Value) -> Result<(), ResourceError> {
    let (operations, kind): (Operations, Option<ValueKind>) = store.describe(path)?;
    if !operations.write {
        return Err(ResourceError::Unauthorized(*path));
    }
    let kind = kind.ok_or_else(|| ResourceError::BadRequest {
        path: *path,
        reason: "resource holds no value".to_string(),
    })?;
    value
        .clone()
        .coerce(kind)
        .map(|_| ())
        .map_err(|e| ResourceError::BadRequest {
            path: *path,
            reason: e.to_string(),
        })
}
