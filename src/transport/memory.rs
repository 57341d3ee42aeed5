//! In-process broker.
//!
//! `MemoryBroker` keeps every session, topic subscription and queue in one
//! shared state behind a mutex. Each [`MemoryTransport`] created from it is
//! one client session. Routing uses the strict filter grammar, delivers a
//! message once per session however many of its filters match, and copies it
//! into every queue whose subscriptions match.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::{Transport, TransportError};
use crate::session::{
    CorrelationKey, DeliveryMode, EventSender, Message, SessionEvent, SessionProperties,
};
use crate::topic::TopicMatcher;

/// Access rules applied by a [`MemoryBroker`].
#[derive(Clone, Debug, Default)]
pub struct BrokerPolicy {
    /// Required message VPN; any VPN is accepted when unset
    pub vpn_name: Option<String>,
    /// username → password; anonymous access when empty
    pub users: HashMap<String, String>,
    /// Subscription filters that are refused verbatim
    pub denied_filters: Vec<String>,
    /// Filters of topics on which guaranteed publishes are rejected
    pub denied_topics: Vec<String>,
}

struct SessionEntry {
    client_name: String,
    events: EventSender,
    filters: Vec<(String, TopicMatcher)>,
}

#[derive(Default)]
struct QueueEntry {
    subscriptions: Vec<(String, TopicMatcher)>,
    pending: VecDeque<(u64, Message)>,
    inflight: BTreeMap<u64, Message>,
    consumer: Option<u64>,
}

#[derive(Default)]
struct BrokerState {
    policy: BrokerPolicy,
    sessions: HashMap<u64, SessionEntry>,
    queues: HashMap<String, QueueEntry>,
    next_session: u64,
    next_delivery: u64,
    published: u64,
}

impl BrokerState {
    fn route(&mut self, message: &Message) {
        let topic = message.destination();
        self.published += 1;

        let mut receivers = 0;
        for session in self.sessions.values() {
            if session.filters.iter().any(|(_, m)| m.matches(topic)) {
                let _ = session.events.send(SessionEvent::Message(message.clone()));
                receivers += 1;
            }
        }

        let mut queued = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            if queue.subscriptions.iter().any(|(_, m)| m.matches(topic)) {
                self.next_delivery += 1;
                queue.pending.push_back((
                    self.next_delivery,
                    message.clone().with_delivery_mode(DeliveryMode::Persistent),
                ));
                queued.push(name.clone());
            }
        }
        for name in &queued {
            self.pump(name);
        }

        debug!(
            topic = topic,
            receivers = receivers,
            queues = queued.len(),
            "Message routed"
        );
    }

    fn pump(&mut self, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        let Some(consumer) = queue.consumer else {
            return;
        };
        let Some(session) = self.sessions.get(&consumer) else {
            return;
        };

        while let Some((delivery_id, message)) = queue.pending.pop_front() {
            queue.inflight.insert(delivery_id, message.clone());
            let _ = session.events.send(SessionEvent::QueueMessage {
                queue: queue_name.to_string(),
                delivery_id,
                message,
            });
        }
    }

    fn release_consumer(&mut self, session_id: u64) -> Vec<String> {
        let mut released = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            if queue.consumer == Some(session_id) {
                queue.consumer = None;
                // unacknowledged deliveries go back to the head of the queue
                let inflight = std::mem::take(&mut queue.inflight);
                for (delivery_id, message) in inflight.into_iter().rev() {
                    queue.pending.push_front((delivery_id, message));
                }
                released.push(name.clone());
            }
        }
        released
    }

    fn topic_denied(&self, topic: &str) -> bool {
        self.policy
            .denied_topics
            .iter()
            .any(|filter| TopicMatcher::strict(filter).matches(topic))
    }
}

/// Shared handle to an in-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: BrokerPolicy) -> Self {
        let broker = Self::default();
        broker.lock().policy = policy;
        broker
    }

    /// Creates a new client session on this broker.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            session: Mutex::new(None),
        }
    }

    /// Routes a message as if it had been published by an external producer.
    pub fn inject(&self, message: Message) {
        self.lock().route(&message);
    }

    /// Messages waiting in or delivered-but-unacknowledged from `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.pending.len() + q.inflight.len())
            .unwrap_or(0)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn client_names(&self) -> Vec<String> {
        self.lock()
            .sessions
            .values()
            .map(|s| s.client_name.clone())
            .collect()
    }

    pub fn published_count(&self) -> u64 {
        self.lock().published
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One client session on a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: MemoryBroker,
    session: Mutex<Option<u64>>,
}

impl MemoryTransport {
    fn session_id(&self) -> Result<u64, TransportError> {
        let session = *self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        session.ok_or(TransportError::NotConnected)
    }

    fn notify(&self, state: &BrokerState, session_id: u64, event: SessionEvent) {
        if let Some(session) = state.sessions.get(&session_id) {
            let _ = session.events.send(event);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        properties: SessionProperties,
        events: EventSender,
    ) -> Result<(), TransportError> {
        let mut session = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if session.is_some() {
            return Err(TransportError::AlreadyConnected);
        }

        let mut state = self.broker.lock();

        if let Some(vpn) = &state.policy.vpn_name {
            if vpn != &properties.vpn_name {
                warn!("Rejecting {}: unknown VPN {}", properties.client_name, properties.vpn_name);
                let _ = events.send(SessionEvent::ConnectFailed(format!(
                    "Message VPN Not Allowed: {}",
                    properties.vpn_name
                )));
                return Ok(());
            }
        }

        if !state.policy.users.is_empty()
            && state.policy.users.get(&properties.username) != Some(&properties.password)
        {
            warn!("Rejecting {}: bad credentials", properties.client_name);
            let _ = events.send(SessionEvent::ConnectFailed(
                "Client Username Is Shutdown or Unauthorized".to_string(),
            ));
            return Ok(());
        }

        state.next_session += 1;
        let id = state.next_session;
        state.sessions.insert(
            id,
            SessionEntry {
                client_name: properties.client_name.clone(),
                events: events.clone(),
                filters: Vec::new(),
            },
        );
        *session = Some(id);

        info!("Session {} opened for {}", id, properties.client_name);
        let _ = events.send(SessionEvent::UpNotice);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let id = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(TransportError::NotConnected)?;

        let mut state = self.broker.lock();
        let released = state.release_consumer(id);
        if let Some(entry) = state.sessions.remove(&id) {
            for queue in released {
                let _ = entry.events.send(SessionEvent::ConsumerDown { queue });
            }
            let _ = entry.events.send(SessionEvent::Disconnected);
            info!("Session {} closed for {}", id, entry.client_name);
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str, key: CorrelationKey) -> Result<(), TransportError> {
        let id = self.session_id()?;
        let mut state = self.broker.lock();

        if state.policy.denied_filters.iter().any(|f| f == filter) {
            self.notify(
                &state,
                id,
                SessionEvent::SubscriptionError {
                    key,
                    reason: "Subscription ACL Denied".to_string(),
                },
            );
            return Ok(());
        }

        if let Some(session) = state.sessions.get_mut(&id) {
            if !session.filters.iter().any(|(f, _)| f == filter) {
                session
                    .filters
                    .push((filter.to_string(), TopicMatcher::strict(filter)));
            }
        }
        self.notify(&state, id, SessionEvent::SubscriptionOk(key));
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str, key: CorrelationKey) -> Result<(), TransportError> {
        let id = self.session_id()?;
        let mut state = self.broker.lock();

        let removed = match state.sessions.get_mut(&id) {
            Some(session) => {
                let before = session.filters.len();
                session.filters.retain(|(f, _)| f != filter);
                session.filters.len() != before
            }
            None => false,
        };

        let event = if removed {
            SessionEvent::SubscriptionOk(key)
        } else {
            SessionEvent::SubscriptionError {
                key,
                reason: "Subscription Not Found".to_string(),
            }
        };
        self.notify(&state, id, event);
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let id = self.session_id()?;
        let mut state = self.broker.lock();

        let guaranteed = message.delivery_mode() == DeliveryMode::Persistent;
        if guaranteed && state.topic_denied(message.destination()) {
            if let Some(key) = message.correlation_key() {
                self.notify(
                    &state,
                    id,
                    SessionEvent::Rejected {
                        key,
                        reason: "Publish ACL Denied".to_string(),
                    },
                );
            }
            return Ok(());
        }

        state.route(&message);

        if guaranteed {
            if let Some(key) = message.correlation_key() {
                self.notify(&state, id, SessionEvent::Acknowledged(key));
            }
        }
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, key: CorrelationKey) -> Result<(), TransportError> {
        let id = self.session_id()?;
        let mut state = self.broker.lock();

        let entry = state.queues.entry(queue.to_string()).or_default();
        if entry.consumer.is_some_and(|owner| owner != id) {
            self.notify(
                &state,
                id,
                SessionEvent::ConsumerBindFailed {
                    key,
                    queue: queue.to_string(),
                    reason: "Queue already has an exclusive consumer".to_string(),
                },
            );
            return Ok(());
        }
        entry.consumer = Some(id);

        self.notify(
            &state,
            id,
            SessionEvent::ConsumerUp {
                key,
                queue: queue.to_string(),
            },
        );
        state.pump(queue);
        Ok(())
    }

    async fn unbind_queue(&self, queue: &str) -> Result<(), TransportError> {
        let id = self.session_id()?;
        let mut state = self.broker.lock();

        let owned = state
            .queues
            .get(queue)
            .is_some_and(|q| q.consumer == Some(id));
        if !owned {
            return Err(TransportError::UnknownQueue(queue.to_string()));
        }

        let released = state.release_consumer(id);
        for queue in released {
            self.notify(&state, id, SessionEvent::ConsumerDown { queue });
        }
        Ok(())
    }

    async fn add_queue_subscription(
        &self,
        queue: &str,
        filter: &str,
        key: CorrelationKey,
    ) -> Result<(), TransportError> {
        let id = self.session_id()?;
        let mut state = self.broker.lock();

        if state.policy.denied_filters.iter().any(|f| f == filter) {
            self.notify(
                &state,
                id,
                SessionEvent::SubscriptionError {
                    key,
                    reason: "Subscription ACL Denied".to_string(),
                },
            );
            return Ok(());
        }

        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
        if !entry.subscriptions.iter().any(|(f, _)| f == filter) {
            entry
                .subscriptions
                .push((filter.to_string(), TopicMatcher::strict(filter)));
        }
        self.notify(&state, id, SessionEvent::SubscriptionOk(key));
        Ok(())
    }

    async fn remove_queue_subscription(
        &self,
        queue: &str,
        filter: &str,
        key: CorrelationKey,
    ) -> Result<(), TransportError> {
        let id = self.session_id()?;
        let mut state = self.broker.lock();

        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
        let before = entry.subscriptions.len();
        entry.subscriptions.retain(|(f, _)| f != filter);
        let removed = entry.subscriptions.len() != before;

        let event = if removed {
            SessionEvent::SubscriptionOk(key)
        } else {
            SessionEvent::SubscriptionError {
                key,
                reason: "Subscription Not Found".to_string(),
            }
        };
        self.notify(&state, id, event);
        Ok(())
    }

    async fn ack(&self, queue: &str, delivery_id: u64) -> Result<(), TransportError> {
        self.session_id()?;
        let mut state = self.broker.lock();

        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
        if entry.inflight.remove(&delivery_id).is_none() {
            debug!("Delivery {} on {} already acknowledged", delivery_id, queue);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{BrokerUrl, EventReceiver};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn properties(name: &str) -> SessionProperties {
        SessionProperties {
            url: BrokerUrl::parse("ws://localhost:8008").unwrap(),
            vpn_name: "default".to_string(),
            username: "trader".to_string(),
            password: "secret".to_string(),
            client_name: name.to_string(),
            connect_retries: 3,
            keep_alive: Duration::from_secs(5),
        }
    }

    async fn open(broker: &MemoryBroker, name: &str) -> (MemoryTransport, EventReceiver) {
        let transport = broker.transport();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.connect(properties(name), tx).await.unwrap();
        assert!(matches!(rx.recv().await, Some(SessionEvent::UpNotice)));
        (transport, rx)
    }

    #[tokio::test]
    async fn rejects_bad_credentials() {
        let mut policy = BrokerPolicy::default();
        policy
            .users
            .insert("trader".to_string(), "other".to_string());
        let broker = MemoryBroker::with_policy(policy);

        let transport = broker.transport();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.connect(properties("c1"), tx).await.unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::ConnectFailed(_))
        ));
        assert_eq!(broker.session_count(), 0);
    }

    #[tokio::test]
    async fn delivers_once_per_session() {
        let broker = MemoryBroker::new();
        let (sub, mut rx) = open(&broker, "sub").await;
        let (publisher, _pub_rx) = open(&broker, "pub").await;

        let k1 = CorrelationKey::new();
        let k2 = CorrelationKey::new();
        sub.subscribe("rates/v1/>", k1).await.unwrap();
        sub.subscribe("rates/*/bond", k2).await.unwrap();
        assert!(matches!(rx.recv().await, Some(SessionEvent::SubscriptionOk(k)) if k == k1));
        assert!(matches!(rx.recv().await, Some(SessionEvent::SubscriptionOk(k)) if k == k2));

        publisher
            .send(Message::direct("rates/v1/bond", "4.2"))
            .await
            .unwrap();

        match rx.recv().await {
            Some(SessionEvent::Message(msg)) => assert_eq!(msg.destination(), "rates/v1/bond"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn guaranteed_publish_is_acknowledged_or_rejected() {
        let policy = BrokerPolicy {
            denied_topics: vec!["restricted/>".to_string()],
            ..Default::default()
        };
        let broker = MemoryBroker::with_policy(policy);
        let (transport, mut rx) = open(&broker, "pub").await;

        let ok = CorrelationKey::new();
        transport
            .send(Message::persistent("rates/v1/bond", "1", ok))
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(SessionEvent::Acknowledged(k)) if k == ok));

        let denied = CorrelationKey::new();
        transport
            .send(Message::persistent("restricted/x", "1", denied))
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(SessionEvent::Rejected { key, .. }) if key == denied));
    }

    #[tokio::test]
    async fn queue_requeues_unacknowledged_on_unbind() {
        let broker = MemoryBroker::new();
        let (consumer, mut rx) = open(&broker, "consumer").await;

        let bind = CorrelationKey::new();
        consumer.bind_queue("q1", bind).await.unwrap();
        assert!(matches!(rx.recv().await, Some(SessionEvent::ConsumerUp { .. })));

        let sub = CorrelationKey::new();
        consumer
            .add_queue_subscription("q1", "rates/>", sub)
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(SessionEvent::SubscriptionOk(_))));

        broker.inject(Message::direct("rates/v1/note", "a"));
        broker.inject(Message::direct("rates/v1/bill", "b"));

        let first = match rx.recv().await {
            Some(SessionEvent::QueueMessage { delivery_id, .. }) => delivery_id,
            other => panic!("unexpected event: {:?}", other),
        };
        assert!(matches!(rx.recv().await, Some(SessionEvent::QueueMessage { .. })));

        consumer.ack("q1", first).await.unwrap();
        assert_eq!(broker.queue_depth("q1"), 1);

        consumer.unbind_queue("q1").await.unwrap();
        assert!(matches!(rx.recv().await, Some(SessionEvent::ConsumerDown { .. })));
        assert_eq!(broker.queue_depth("q1"), 1);
    }

    #[tokio::test]
    async fn second_consumer_is_refused() {
        let broker = MemoryBroker::new();
        let (first, mut first_rx) = open(&broker, "first").await;
        let (second, mut second_rx) = open(&broker, "second").await;

        first.bind_queue("q", CorrelationKey::new()).await.unwrap();
        assert!(matches!(first_rx.recv().await, Some(SessionEvent::ConsumerUp { .. })));

        second.bind_queue("q", CorrelationKey::new()).await.unwrap();
        assert!(matches!(
            second_rx.recv().await,
            Some(SessionEvent::ConsumerBindFailed { .. })
        ));
    }

    #[tokio::test]
    async fn disconnect_reports_and_removes_session() {
        let broker = MemoryBroker::new();
        let (transport, mut rx) = open(&broker, "c").await;
        assert_eq!(broker.client_names(), vec!["c".to_string()]);

        transport.disconnect().await.unwrap();
        assert!(matches!(rx.recv().await, Some(SessionEvent::Disconnected)));
        assert_eq!(broker.session_count(), 0);
        assert!(matches!(
            transport.subscribe("a", CorrelationKey::new()).await,
            Err(TransportError::NotConnected)
        ));
    }
}
