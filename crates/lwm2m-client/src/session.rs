//! Registration session state machine.
//!
//! ```text
//! Idle ─► Registering ─► Registered ◄─► Updating
//!              │              │             │
//!              ▼              ▼             ▼
//!            Error ──────► Deregistering ─► Stopped
//! ```
//!
//! `Error` retries registration with exponential backoff until the
//! configured attempts are used up, then reports a fatal error once.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use lwm2m_core::config::ReconnectConfig;
use lwm2m_core::ResourcePath;
use lwm2m_protocol::{deregister_request, register_request, update_request, Code, Message};

use crate::transport::TransportError;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Registering,
    Registered,
    Updating,
    Deregistering,
    Stopped,
    Error,
}

impl SessionState {
    /// Whether server operations are served in this state.
    pub fn is_registered(self) -> bool {
        matches!(self, SessionState::Registered | SessionState::Updating)
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Stopped
    }

    fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Idle, Registering)
                | (Idle, Stopped)
                | (Registering, Registered)
                | (Registering, Error)
                | (Registering, Stopped)
                | (Registered, Updating)
                | (Registered, Registering)
                | (Registered, Deregistering)
                | (Updating, Registered)
                | (Updating, Registering)
                | (Updating, Error)
                | (Updating, Deregistering)
                | (Error, Registering)
                | (Error, Deregistering)
                | (Error, Stopped)
                | (Deregistering, Stopped)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Registering => "registering",
            SessionState::Registered => "registered",
            SessionState::Updating => "updating",
            SessionState::Deregistering => "deregistering",
            SessionState::Stopped => "stopped",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Errors raised by the session state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Illegal session transition from {from} to {to}")]
    IllegalTransition { from: SessionState, to: SessionState },
}

/// Why a registration or update exchange failed.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Server rejected the request with {0}")]
    Rejected(Code),

    #[error("Registration response carries no Location-Path")]
    MissingLocation,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RegistrationError {
    /// The server no longer knows our registration and expects a fresh one.
    pub fn is_unknown_registration(&self) -> bool {
        matches!(self, RegistrationError::Rejected(Code::NOT_FOUND))
    }
}

/// What to do after a failed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Try registering again after the delay.
    RetryAfter(Duration),
    /// Attempts are used up; report the fatal error.
    Fatal,
    /// Attempts are used up and the fatal error was already reported.
    Exhausted,
}

/// One LwM2M registration session.
#[derive(Debug)]
pub struct Session {
    endpoint: String,
    state: SessionState,
    lifetime: u32,
    lifetime_changed: bool,
    location: Option<Vec<String>>,
    failures: u32,
    fatal_reported: bool,
}

impl Session {
    pub fn new(endpoint: impl Into<String>, lifetime: u32) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: SessionState::Idle,
            lifetime,
            lifetime_changed: false,
            location: None,
            failures: 0,
            fatal_reported: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn lifetime(&self) -> u32 {
        self.lifetime
    }

    /// Registration identifier path assigned by the server, e.g. `rd/5a3f`.
    pub fn location(&self) -> Option<String> {
        self.location.as_ref().map(|l| l.join("/"))
    }

    /// Move to `to`, returning the previous state.
    pub fn transition(&mut self, to: SessionState) -> Result<SessionState, SessionError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(SessionError::IllegalTransition { from, to });
        }
        debug!("Session {}: {} -> {}", self.endpoint, from, to);
        self.state = to;
        Ok(from)
    }

    /// Interval between registration updates: half the lifetime.
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.lifetime / 2).max(1))
    }

    /// Change the lifetime; the next update carries it.
    pub fn set_lifetime(&mut self, lifetime: u32) {
        if lifetime != self.lifetime && lifetime > 0 {
            self.lifetime = lifetime;
            self.lifetime_changed = true;
        }
    }

    pub fn registration_request(&self, objects: &[ResourcePath]) -> Message {
        register_request(&self.endpoint, self.lifetime, objects)
    }

    /// Update request for the current registration, if there is one.
    pub fn update_request(&self, objects: Option<&[ResourcePath]>) -> Option<Message> {
        let lifetime = self.lifetime_changed.then_some(self.lifetime);
        self.location
            .as_deref()
            .map(|location| update_request(location, lifetime, objects))
    }

    pub fn deregister_request(&self) -> Option<Message> {
        self.location.as_deref().map(deregister_request)
    }

    /// Check a registration response and record the assigned location.
    pub fn on_registered(&mut self, response: &Message) -> Result<String, RegistrationError> {
        if response.code != Code::CREATED {
            return Err(RegistrationError::Rejected(response.code));
        }
        let location = response.location_path();
        if location.is_empty() {
            return Err(RegistrationError::MissingLocation);
        }

        self.location = Some(location);
        self.lifetime_changed = false;
        self.failures = 0;
        let location = self.location().unwrap_or_default();
        info!("Registered {} at {}", self.endpoint, location);
        Ok(location)
    }

    /// Check an update response.
    pub fn on_updated(&mut self, response: &Message) -> Result<(), RegistrationError> {
        if response.code != Code::CHANGED {
            return Err(RegistrationError::Rejected(response.code));
        }
        self.lifetime_changed = false;
        self.failures = 0;
        Ok(())
    }

    /// Forget the registration (deregistered or no longer known by the server).
    pub fn clear_location(&mut self) {
        self.location = None;
    }

    /// Count a failed exchange and decide how to recover.
    pub fn record_failure(&mut self, policy: &ReconnectConfig) -> Recovery {
        if self.failures < policy.attempts {
            let delay = Duration::from_millis(policy.backoff_ms)
                .saturating_mul(2u32.saturating_pow(self.failures));
            self.failures += 1;
            warn!(
                "Registration attempt failed, retry {}/{} in {:?}",
                self.failures, policy.attempts, delay
            );
            Recovery::RetryAfter(delay)
        } else if !self.fatal_reported {
            self.fatal_reported = true;
            Recovery::Fatal
        } else {
            Recovery::Exhausted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lwm2m_protocol::option;

    fn created(location: &[&str]) -> Message {
        let mut response = Message::new(lwm2m_protocol::MessageType::Acknowledgement, Code::CREATED, 1);
        for segment in location {
            response.add_string_option(option::LOCATION_PATH, segment);
        }
        response
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut session = Session::new("dev1", 300);
        assert_eq!(session.state(), SessionState::Idle);

        session.transition(SessionState::Registering).unwrap();
        session.on_registered(&created(&["rd", "5a3f"])).unwrap();
        session.transition(SessionState::Registered).unwrap();
        assert_eq!(session.location(), Some("rd/5a3f".to_string()));

        session.transition(SessionState::Updating).unwrap();
        session.transition(SessionState::Registered).unwrap();
        session.transition(SessionState::Deregistering).unwrap();
        assert_eq!(
            session.transition(SessionState::Stopped),
            Ok(SessionState::Deregistering)
        );
    }

    #[test]
    fn test_illegal_transition() {
        let mut session = Session::new("dev1", 300);
        assert_eq!(
            session.transition(SessionState::Registered),
            Err(SessionError::IllegalTransition {
                from: SessionState::Idle,
                to: SessionState::Registered
            })
        );
        assert_eq!(session.state(), SessionState::Idle);

        session.transition(SessionState::Stopped).unwrap();
        assert!(session.transition(SessionState::Registering).is_err());
    }

    #[test]
    fn test_registration_response_checks() {
        let mut session = Session::new("dev1", 300);
        assert!(matches!(
            session.on_registered(&created(&[])),
            Err(RegistrationError::MissingLocation)
        ));

        let rejected = Message::new(lwm2m_protocol::MessageType::Acknowledgement, Code::FORBIDDEN, 1);
        assert!(matches!(
            session.on_registered(&rejected),
            Err(RegistrationError::Rejected(Code::FORBIDDEN))
        ));
        assert!(session.update_request(None).is_none());
    }

    #[test]
    fn test_update_carries_changed_lifetime() {
        let mut session = Session::new("dev1", 300);
        session.on_registered(&created(&["rd", "1"])).unwrap();
        assert_eq!(session.update_interval(), Duration::from_secs(150));

        let update = session.update_request(None).unwrap();
        assert!(update.uri_query().is_empty());

        session.set_lifetime(600);
        let update = session.update_request(None).unwrap();
        assert_eq!(update.uri_query(), vec!["lt=600"]);
        assert_eq!(session.update_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_then_single_fatal() {
        let policy = ReconnectConfig {
            attempts: 3,
            backoff_ms: 10_000,
        };
        let mut session = Session::new("dev1", 300);

        assert_eq!(
            session.record_failure(&policy),
            Recovery::RetryAfter(Duration::from_secs(10))
        );
        assert_eq!(
            session.record_failure(&policy),
            Recovery::RetryAfter(Duration::from_secs(20))
        );
        assert_eq!(
            session.record_failure(&policy),
            Recovery::RetryAfter(Duration::from_secs(40))
        );
        assert_eq!(session.record_failure(&policy), Recovery::Fatal);
        assert_eq!(session.record_failure(&policy), Recovery::Exhausted);
    }

    #[test]
    fn test_success_resets_failures() {
        let policy = ReconnectConfig {
            attempts: 1,
            backoff_ms: 1000,
        };
        let mut session = Session::new("dev1", 300);
        assert!(matches!(session.record_failure(&policy), Recovery::RetryAfter(_)));

        session.on_registered(&created(&["rd", "1"])).unwrap();
        assert!(matches!(session.record_failure(&policy), Recovery::RetryAfter(_)));
    }
}
