//! Observation management.
//!
//! This module handles server observe relations (RFC 7641) and host-side
//! subscriptions:
//! - `ObservationManager` tracks relations, notification attributes and
//!   per-relation sequence numbers, and decides when a notification is due
//! - `LocalSubscriptions` fans value changes out to host callbacks

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use lwm2m_core::{ResourcePath, Value};
use lwm2m_protocol::content::{encode_senml, encode_single};
use lwm2m_protocol::operation::AttributeChange;
use lwm2m_protocol::{Code, ContentFormat, Message, MessageType, NotificationAttributes, OperationError};

/// Current values under an observed path.
pub type Snapshot = Vec<(ResourcePath, Value)>;

/// A server observation of one path.
#[derive(Debug, Clone)]
pub struct ObserveRelation {
    pub path: ResourcePath,
    pub token: Vec<u8>,
    pub accept: Option<ContentFormat>,
    pub last_notified: Snapshot,
    pub sequence: u32,
    last_sent: Instant,
    last_message_id: Option<u16>,
    /// A change was held back by `pmin`.
    pending: bool,
}

/// A notification ready to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub path: ResourcePath,
    pub token: Vec<u8>,
    pub sequence: u32,
    pub accept: Option<ContentFormat>,
    pub values: Snapshot,
}

impl Notification {
    /// Build the non-confirmable 2.05 Content message.
    pub fn to_message(&self) -> Message {
        let mut message = Message::new(MessageType::NonConfirmable, Code::CONTENT, 0);
        message.token = self.token.clone();
        message.set_observe(self.sequence);
        let (format, payload) = encode_snapshot(&self.path, self.accept, &self.values);
        message.set_content_format(format).set_payload(payload);
        message
    }
}

/// Encode values for a Read, Observe response or notification.
///
/// A single resource is sent as text/plain (or opaque) unless SenML was
/// asked for; anything larger is SenML JSON.
pub fn encode_snapshot(
    path: &ResourcePath,
    accept: Option<ContentFormat>,
    values: &[(ResourcePath, Value)],
) -> (ContentFormat, Vec<u8>) {
    match (path.is_resource(), values, accept) {
        (true, [(_, value)], None | Some(ContentFormat::TextPlain) | Some(ContentFormat::Opaque)) => {
            encode_single(value)
        }
        _ => {
            let base = if path.is_resource() {
                path.instance_path().unwrap_or(*path)
            } else {
                *path
            };
            (ContentFormat::SenmlJson, encode_senml(&base, values))
        }
    }
}

/// Tracks active observe relations and their notification attributes.
#[derive(Debug, Default)]
pub struct ObservationManager {
    relations: Vec<ObserveRelation>,
    attributes: HashMap<ResourcePath, NotificationAttributes>,
}

impl ObservationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn relations(&self) -> &[ObserveRelation] {
        &self.relations
    }

    /// Register (or re-register) an observation and return the sequence
    /// number for the initial response.
    pub fn observe(
        &mut self,
        path: ResourcePath,
        token: Vec<u8>,
        accept: Option<ContentFormat>,
        current: Snapshot,
        now: Instant,
    ) -> u32 {
        // Same token re-registers: keep counting from the old sequence.
        let sequence = match self.relations.iter().position(|r| r.token == token) {
            Some(index) => self.relations.remove(index).sequence.wrapping_add(1),
            None => 0,
        };

        debug!("Observe {} (sequence {})", path, sequence);
        self.relations.push(ObserveRelation {
            path,
            token,
            accept,
            last_notified: current,
            sequence,
            last_sent: now,
            last_message_id: None,
            pending: false,
        });
        sequence
    }

    /// Cancel by token, or by path when the token is unknown.
    pub fn cancel(&mut self, path: &ResourcePath, token: &[u8]) -> bool {
        let before = self.relations.len();
        if self.relations.iter().any(|r| r.token == token) {
            self.relations.retain(|r| r.token != token);
        } else {
            self.relations.retain(|r| r.path != *path);
        }
        before != self.relations.len()
    }

    /// Cancel the relation whose last notification was reset by the server.
    pub fn cancel_by_message_id(&mut self, message_id: u16) -> Option<ResourcePath> {
        let index = self
            .relations
            .iter()
            .position(|r| r.last_message_id == Some(message_id))?;
        let relation = self.relations.remove(index);
        debug!("Observation of {} cancelled by reset", relation.path);
        Some(relation.path)
    }

    /// Remember which message carried the last notification of `token`.
    pub fn record_sent(&mut self, token: &[u8], message_id: u16) {
        if let Some(relation) = self.relations.iter_mut().find(|r| r.token == token) {
            relation.last_message_id = Some(message_id);
        }
    }

    /// Drop relations whose path no longer exists.
    pub fn prune(&mut self, exists: impl Fn(&ResourcePath) -> bool) -> Vec<ResourcePath> {
        let mut pruned = Vec::new();
        self.relations.retain(|r| {
            let keep = exists(&r.path);
            if !keep {
                pruned.push(r.path);
            }
            keep
        });
        self.attributes.retain(|path, _| exists(path));
        pruned
    }

    /// Remove every relation (session teardown).
    pub fn clear(&mut self) {
        self.relations.clear();
    }

    /// Apply Write-Attributes changes to `path`.
    pub fn write_attributes(
        &mut self,
        path: ResourcePath,
        changes: &[AttributeChange],
    ) -> Result<(), OperationError> {
        let attributes = self.attributes.entry(path).or_default();
        attributes.apply(changes)?;
        if attributes.is_empty() {
            self.attributes.remove(&path);
        }
        Ok(())
    }

    /// Attributes set directly on `path`.
    pub fn attributes(&self, path: &ResourcePath) -> Option<&NotificationAttributes> {
        self.attributes.get(path)
    }

    /// Attributes in effect for `path`: each one is taken from the most
    /// specific level (resource, instance, object) that sets it.
    pub fn effective_attributes(&self, path: &ResourcePath) -> NotificationAttributes {
        let levels = [
            Some(*path),
            path.is_resource().then(|| path.instance_path()).flatten(),
            (path.depth() > 1).then(|| ResourcePath::object(path.object_id())),
        ];

        let mut effective = NotificationAttributes::default();
        for level in levels.iter().flatten() {
            if let Some(attrs) = self.attributes.get(level) {
                effective.pmin = effective.pmin.or(attrs.pmin);
                effective.pmax = effective.pmax.or(attrs.pmax);
                effective.gt = effective.gt.or(attrs.gt);
                effective.lt = effective.lt.or(attrs.lt);
                effective.st = effective.st.or(attrs.st);
            }
        }
        effective
    }

    /// React to changed resources. `read` returns the current values under
    /// a path, or `None` if it is gone.
    pub fn on_change(
        &mut self,
        changed: &[ResourcePath],
        now: Instant,
        read: impl Fn(&ResourcePath) -> Option<Snapshot>,
    ) -> Vec<Notification> {
        let mut notifications = Vec::new();

        for index in 0..self.relations.len() {
            let path = self.relations[index].path;
            if !changed.iter().any(|c| c.starts_with(&path)) {
                continue;
            }
            let Some(current) = read(&path) else {
                continue;
            };
            let attributes = self.effective_attributes(&path);
            let relation = &mut self.relations[index];

            if current == relation.last_notified
                || !crosses_thresholds(&attributes, &relation.last_notified, &current)
            {
                continue;
            }

            let pmin = Duration::from_secs(u64::from(attributes.pmin.unwrap_or(0)));
            if now.duration_since(relation.last_sent) < pmin {
                relation.pending = true;
                continue;
            }

            notifications.push(relation.notify(current, now));
        }

        notifications
    }

    /// Emit notifications that became due: held-back changes once `pmin`
    /// elapsed, and periodic ones once `pmax` elapsed.
    ///
    /// A due relation whose path can no longer be read is dropped.
    pub fn on_tick(
        &mut self,
        now: Instant,
        read: impl Fn(&ResourcePath) -> Option<Snapshot>,
    ) -> Vec<Notification> {
        let mut notifications = Vec::new();
        let mut unreadable = Vec::new();

        for index in 0..self.relations.len() {
            let path = self.relations[index].path;
            let attributes = self.effective_attributes(&path);
            let relation = &mut self.relations[index];
            let elapsed = now.duration_since(relation.last_sent);

            let pmin = Duration::from_secs(u64::from(attributes.pmin.unwrap_or(0)));
            let pmax_due = attributes
                .pmax
                .map(|pmax| elapsed >= Duration::from_secs(u64::from(pmax)))
                .unwrap_or(false);
            let pending_due = relation.pending && elapsed >= pmin;

            if !(pmax_due || pending_due) {
                continue;
            }
            let Some(current) = read(&path) else {
                unreadable.push(index);
                continue;
            };
            notifications.push(relation.notify(current, now));
        }

        for index in unreadable.into_iter().rev() {
            let relation = self.relations.remove(index);
            debug!("Dropping observation of unreadable {}", relation.path);
        }
        notifications
    }

    /// The earliest instant at which `on_tick` may produce a notification.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.relations
            .iter()
            .filter_map(|relation| {
                let attributes = self.effective_attributes(&relation.path);
                let pending = relation.pending.then(|| {
                    relation.last_sent
                        + Duration::from_secs(u64::from(attributes.pmin.unwrap_or(0)))
                });
                let periodic = attributes
                    .pmax
                    .map(|pmax| relation.last_sent + Duration::from_secs(u64::from(pmax)));
                match (pending, periodic) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            })
            .min()
    }
}

impl ObserveRelation {
    fn notify(&mut self, current: Snapshot, now: Instant) -> Notification {
        self.sequence = self.sequence.wrapping_add(1) & 0x00FF_FFFF;
        self.last_notified = current.clone();
        self.last_sent = now;
        self.pending = false;
        Notification {
            path: self.path,
            token: self.token.clone(),
            sequence: self.sequence,
            accept: self.accept,
            values: current,
        }
    }
}

/// Apply `gt`/`lt`/`st` to a single numeric value. Relations without
/// numeric attributes, or over non-numeric values, notify on any change.
fn crosses_thresholds(attributes: &NotificationAttributes, previous: &Snapshot, current: &Snapshot) -> bool {
    if attributes.gt.is_none() && attributes.lt.is_none() && attributes.st.is_none() {
        return true;
    }
    let (Some(old), Some(new)) = (single_number(previous), single_number(current)) else {
        return true;
    };

    let crossed = |threshold: Option<f64>| {
        threshold.map_or(false, |t| (old > t) != (new > t) || (old < t) != (new < t))
    };
    let stepped = attributes.st.map_or(false, |st| (new - old).abs() >= st);

    crossed(attributes.gt) || crossed(attributes.lt) || stepped
}

fn single_number(values: &Snapshot) -> Option<f64> {
    match values.as_slice() {
        [(_, value)] => value.as_f64(),
        _ => None,
    }
}

// ============================================================================
// Host subscriptions
// ============================================================================

/// Callback invoked with each changed path and its new value.
pub type SubscriptionCallback = Arc<dyn Fn(&ResourcePath, &Value) + Send + Sync>;

/// A host-side subscription to a path and everything below it.
#[derive(Clone)]
pub struct LocalSubscription {
    pub handle: Uuid,
    pub path: ResourcePath,
    callback: SubscriptionCallback,
}

impl LocalSubscription {
    pub fn matches(&self, path: &ResourcePath) -> bool {
        path.starts_with(&self.path)
    }
}

/// Host subscriptions keyed by handle.
#[derive(Default)]
pub struct LocalSubscriptions {
    subscriptions: Vec<LocalSubscription>,
}

impl LocalSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, path: ResourcePath, callback: SubscriptionCallback) -> Uuid {
        let handle = Uuid::new_v4();
        self.subscriptions.push(LocalSubscription {
            handle,
            path,
            callback,
        });
        handle
    }

    pub fn unsubscribe(&mut self, handle: &Uuid) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.handle != *handle);
        before != self.subscriptions.len()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Invoke every matching callback for each changed value.
    pub fn dispatch(&self, changes: &[(ResourcePath, Value)]) {
        for (path, value) in changes {
            for subscription in self.subscriptions.iter().filter(|s| s.matches(path)) {
                (subscription.callback)(path, value);
            }
        }
    }

    /// Drop subscriptions whose path no longer exists.
    pub fn prune(&mut self, exists: impl Fn(&ResourcePath) -> bool) {
        self.subscriptions.retain(|s| exists(&s.path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const TEMP: ResourcePath = ResourcePath::resource(3303, 0, 5700);

    fn snapshot(value: f64) -> Snapshot {
        vec![(TEMP, Value::Float(value))]
    }

    fn read_value(value: f64) -> impl Fn(&ResourcePath) -> Option<Snapshot> {
        move |_| Some(snapshot(value))
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_produces_one_notification() {
        let mut manager = ObservationManager::new();
        let now = Instant::now();
        let seq = manager.observe(TEMP, vec![1], None, snapshot(20.0), now);
        assert_eq!(seq, 0);

        let notifications = manager.on_change(&[TEMP], now, read_value(21.0));
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].sequence, 1);
        assert_eq!(notifications[0].values, snapshot(21.0));

        // Unchanged value: nothing
        assert!(manager.on_change(&[TEMP], now, read_value(21.0)).is_empty());

        let notifications = manager.on_change(&[TEMP], now, read_value(22.0));
        assert_eq!(notifications[0].sequence, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_observation_sees_resource_change() {
        let mut manager = ObservationManager::new();
        let now = Instant::now();
        let instance = ResourcePath::instance(3303, 0);
        manager.observe(instance, vec![1], None, snapshot(20.0), now);

        let notifications = manager.on_change(&[TEMP], now, read_value(25.0));
        assert_eq!(notifications.len(), 1);

        let message = notifications[0].to_message();
        assert_eq!(message.content_format(), Some(ContentFormat::SenmlJson));
        assert_eq!(message.observe(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pmin_holds_back_changes() {
        let mut manager = ObservationManager::new();
        let start = Instant::now();
        manager
            .write_attributes(TEMP, &[(lwm2m_protocol::operation::Attribute::MinPeriod, Some(10.0))])
            .unwrap();
        manager.observe(TEMP, vec![1], None, snapshot(20.0), start);

        let now = start + Duration::from_secs(2);
        assert!(manager.on_change(&[TEMP], now, read_value(21.0)).is_empty());
        assert_eq!(manager.next_deadline(), Some(start + Duration::from_secs(10)));

        assert!(manager.on_tick(start + Duration::from_secs(5), read_value(21.0)).is_empty());
        let notifications = manager.on_tick(start + Duration::from_secs(10), read_value(21.0));
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].sequence, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pmax_forces_notification() {
        use lwm2m_protocol::operation::Attribute;

        let mut manager = ObservationManager::new();
        let start = Instant::now();
        manager
            .write_attributes(ResourcePath::instance(3303, 0), &[(Attribute::MaxPeriod, Some(60.0))])
            .unwrap();
        manager.observe(TEMP, vec![1], None, snapshot(20.0), start);

        assert_eq!(manager.next_deadline(), Some(start + Duration::from_secs(60)));
        let notifications = manager.on_tick(start + Duration::from_secs(60), read_value(20.0));
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].values, snapshot(20.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_drops_unreadable_relation() {
        use lwm2m_protocol::operation::Attribute;

        let object = ResourcePath::object(3303);
        let mut manager = ObservationManager::new();
        let start = Instant::now();
        manager
            .write_attributes(object, &[(Attribute::MaxPeriod, Some(5.0))])
            .unwrap();
        manager.observe(object, vec![1], None, snapshot(20.0), start);

        let notifications = manager.on_tick(start + Duration::from_secs(5), |_| None);
        assert!(notifications.is_empty());
        assert!(manager.is_empty());
        assert_eq!(manager.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_thresholds_and_step() {
        use lwm2m_protocol::operation::Attribute;

        let mut manager = ObservationManager::new();
        let now = Instant::now();
        manager
            .write_attributes(TEMP, &[(Attribute::GreaterThan, Some(30.0)), (Attribute::Step, Some(5.0))])
            .unwrap();
        manager.observe(TEMP, vec![1], None, snapshot(20.0), now);

        // Below threshold and below step
        assert!(manager.on_change(&[TEMP], now, read_value(22.0)).is_empty());
        // Step reached
        assert_eq!(manager.on_change(&[TEMP], now, read_value(26.0)).len(), 1);
        // Crossing gt=30 with a small step
        assert_eq!(manager.on_change(&[TEMP], now, read_value(30.5)).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_reset() {
        let mut manager = ObservationManager::new();
        let now = Instant::now();
        manager.observe(TEMP, vec![1], None, snapshot(20.0), now);
        manager.observe(ResourcePath::resource(3, 0, 9), vec![2], None, vec![], now);

        assert!(manager.cancel(&TEMP, &[9, 9]));
        assert_eq!(manager.len(), 1);

        manager.record_sent(&[2], 0x55);
        assert_eq!(
            manager.cancel_by_message_id(0x55),
            Some(ResourcePath::resource(3, 0, 9))
        );
        assert!(manager.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_removed_paths() {
        let mut manager = ObservationManager::new();
        let now = Instant::now();
        manager.observe(TEMP, vec![1], None, snapshot(20.0), now);
        manager.observe(ResourcePath::resource(3, 0, 9), vec![2], None, vec![], now);

        let pruned = manager.prune(|p| p.object_id() != 3303);
        assert_eq!(pruned, vec![TEMP]);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reobserve_same_token_continues_sequence() {
        let mut manager = ObservationManager::new();
        let now = Instant::now();
        manager.observe(TEMP, vec![1], None, snapshot(20.0), now);
        manager.on_change(&[TEMP], now, read_value(21.0));

        let seq = manager.observe(TEMP, vec![1], None, snapshot(21.0), now);
        assert_eq!(seq, 2);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_effective_attributes_inherit() {
        use lwm2m_protocol::operation::Attribute;

        let mut manager = ObservationManager::new();
        manager
            .write_attributes(ResourcePath::object(3303), &[(Attribute::MinPeriod, Some(1.0)), (Attribute::MaxPeriod, Some(100.0))])
            .unwrap();
        manager
            .write_attributes(TEMP, &[(Attribute::MinPeriod, Some(5.0))])
            .unwrap();

        let effective = manager.effective_attributes(&TEMP);
        assert_eq!(effective.pmin, Some(5));
        assert_eq!(effective.pmax, Some(100));
    }

    #[test]
    fn test_local_subscriptions() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut subscriptions = LocalSubscriptions::new();

        let sink = seen.clone();
        let handle = subscriptions.subscribe(
            ResourcePath::instance(3303, 0),
            Arc::new(move |path, value| sink.lock().unwrap().push((*path, value.clone()))),
        );

        subscriptions.dispatch(&[
            (TEMP, Value::Float(21.0)),
            (ResourcePath::resource(3, 0, 1), Value::from("x")),
        ]);
        assert_eq!(*seen.lock().unwrap(), vec![(TEMP, Value::Float(21.0))]);

        assert!(subscriptions.unsubscribe(&handle));
        assert!(!subscriptions.unsubscribe(&handle));
        assert!(subscriptions.is_empty());
    }
}
