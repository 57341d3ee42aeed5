//! # Async Client
//!
//! Promise-style wrapper around a broker [`Transport`]. Every operation
//! hands a request to the transport and waits on a one-shot listener that
//! the session's dispatcher task resolves when the matching acknowledgement
//! event arrives.
//!
//! ```text
//! client/
//! ├── mod.rs            - AsyncClient, dispatcher task, listener registry
//! ├── subscriptions.rs  - topic filter → callback table
//! ├── consumer.rs       - queue consumer typestate
//! └── request.rs        - request/reply envelope and inbox topics
//! ```
//!
//! Callbacks are invoked on the dispatcher task, outside of every lock held
//! by the client. They must not block.

pub mod consumer;
pub mod request;
pub mod subscriptions;

pub use consumer::{ConsumerState, QueueConsumer};
pub use request::RequestEnvelope;
pub use subscriptions::SubscriptionMap;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ClientError, ConnectionError, PublishError, SubscriptionError};
use crate::session::{
    generate_client_name, BrokerUrl, CorrelationKey, EventReceiver, Message, SessionEvent,
    SessionProperties,
};
use crate::store::{ConnectionStatus, StatusStore};
use crate::submanager::SubManResponse;
use crate::topic::MatchMode;
use crate::transport::{Transport, TransportError};

use consumer::{Binding, Consuming, Stopped};

pub type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Timeouts and session defaults applied by an [`AsyncClient`].
#[derive(Clone, Debug)]
pub struct ClientSettings {
    pub match_mode: MatchMode,
    /// Fixed client name; a random one is generated per session when unset
    pub client_name: Option<String>,
    pub connect_retries: u32,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    /// Subscribe, unsubscribe, queue bind and queue subscription
    pub operation_timeout: Duration,
    pub publish_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings {
            match_mode: MatchMode::Compat,
            client_name: None,
            connect_retries: 3,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_millis(1000),
            publish_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_millis(2000),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum ListenerKey {
    Connect,
    Disconnect,
    Op(CorrelationKey),
}

type Listener = oneshot::Sender<Result<(), String>>;

struct Session {
    client_name: String,
    dispatcher: JoinHandle<()>,
}

enum ConsumerPhase {
    Binding(QueueConsumer<Binding>),
    Consuming(QueueConsumer<Consuming>),
}

struct ActiveConsumer {
    phase: ConsumerPhase,
    callback: MessageCallback,
}

impl ActiveConsumer {
    fn queue(&self) -> &str {
        match &self.phase {
            ConsumerPhase::Binding(c) => c.queue(),
            ConsumerPhase::Consuming(c) => c.queue(),
        }
    }

    fn is_binding(&self) -> bool {
        matches!(self.phase, ConsumerPhase::Binding(_))
    }

    fn consuming(&mut self) -> Option<&mut QueueConsumer<Consuming>> {
        match &mut self.phase {
            ConsumerPhase::Consuming(c) => Some(c),
            ConsumerPhase::Binding(_) => None,
        }
    }

    fn bound(self) -> Self {
        let phase = match self.phase {
            ConsumerPhase::Binding(c) => ConsumerPhase::Consuming(c.bound()),
            consuming => consuming,
        };
        ActiveConsumer {
            phase,
            callback: self.callback,
        }
    }

    fn stop(self) -> QueueConsumer<Stopped> {
        match self.phase {
            ConsumerPhase::Binding(c) => c.abandon(),
            ConsumerPhase::Consuming(c) => c.stop(),
        }
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    settings: ClientSettings,
    store: StatusStore,
    session: Mutex<Option<Session>>,
    subscriptions: Mutex<SubscriptionMap>,
    consumer: Mutex<Option<ActiveConsumer>>,
    listeners: StdMutex<HashMap<ListenerKey, Listener>>,
}

impl Shared {
    fn listeners(&self) -> MutexGuard<'_, HashMap<ListenerKey, Listener>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, key: ListenerKey) -> oneshot::Receiver<Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        if self.listeners().insert(key, tx).is_some() {
            debug!("Replaced stale listener {:?}", key);
        }
        rx
    }

    fn deregister(&self, key: ListenerKey) {
        self.listeners().remove(&key);
    }

    fn resolve(&self, key: ListenerKey, outcome: Result<(), String>) -> bool {
        match self.listeners().remove(&key) {
            Some(listener) => {
                let _ = listener.send(outcome);
                true
            }
            None => false,
        }
    }

    fn fail_all(&self, reason: &str) {
        let pending: Vec<Listener> = self.listeners().drain().map(|(_, l)| l).collect();
        for listener in pending {
            let _ = listener.send(Err(reason.to_string()));
        }
    }

    /// Drops every piece of per-session state and hands back the session's
    /// dispatcher.
    async fn tear_down(&self) -> Option<JoinHandle<()>> {
        let session = self.session.lock().await.take();
        self.subscriptions.lock().await.clear();
        if let Some(active) = self.consumer.lock().await.take() {
            debug!("Consumer dropped: {}", active.stop().summary());
        }
        session.map(|s| {
            debug!("Dropped session {}", s.client_name);
            s.dispatcher
        })
    }
}

/// Waits on a listener registered under `key`. The outer result covers
/// timeouts and a closed session, the inner one the broker's verdict.
async fn wait_for(
    shared: &Shared,
    operation: &'static str,
    timeout: Duration,
    key: ListenerKey,
    rx: oneshot::Receiver<Result<(), String>>,
) -> Result<Result<(), String>, ClientError> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(_)) => Err(ConnectionError::Closed.into()),
        Err(_) => {
            shared.deregister(key);
            warn!("{} timed out after {:?}", operation, timeout);
            Err(ClientError::Timeout { operation, timeout })
        }
    }
}

/// Cloneable handle to one broker session.
#[derive(Clone)]
pub struct AsyncClient {
    shared: Arc<Shared>,
}

impl AsyncClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_settings(transport, ClientSettings::default())
    }

    pub fn with_settings(transport: Arc<dyn Transport>, settings: ClientSettings) -> Self {
        Self::with_store(transport, settings, StatusStore::new())
    }

    pub fn with_store(
        transport: Arc<dyn Transport>,
        settings: ClientSettings,
        store: StatusStore,
    ) -> Self {
        let subscriptions = SubscriptionMap::new(settings.match_mode);
        AsyncClient {
            shared: Arc::new(Shared {
                transport,
                settings,
                store,
                session: Mutex::new(None),
                subscriptions: Mutex::new(subscriptions),
                consumer: Mutex::new(None),
                listeners: StdMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &StatusStore {
        &self.shared.store
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.shared.settings
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.session.lock().await.is_some()
    }

    /// Name of the open session's client, if any.
    pub async fn client_name(&self) -> Option<String> {
        self.shared
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.client_name.clone())
    }

    async fn ensure_connected(&self) -> Result<(), ClientError> {
        if self.is_connected().await {
            Ok(())
        } else {
            Err(ClientError::not_connected())
        }
    }

    /// Opens a session. Resolves once the broker reports the session up.
    pub async fn connect(
        &self,
        url: &str,
        vpn_name: &str,
        username: &str,
        password: &str,
    ) -> Result<(), ClientError> {
        let url = BrokerUrl::parse(url)?;
        let shared = &self.shared;

        let mut session = shared.session.lock().await;
        if session.is_some() {
            warn!("Already connected and ready to subscribe.");
            return Ok(());
        }

        let client_name = shared
            .settings
            .client_name
            .clone()
            .unwrap_or_else(generate_client_name);
        let properties = SessionProperties {
            url,
            vpn_name: vpn_name.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            client_name: client_name.clone(),
            connect_retries: shared.settings.connect_retries,
            keep_alive: shared.settings.keep_alive,
        };

        info!(
            "Connecting to message router {} as {}",
            properties.url, client_name
        );
        shared.store.set_status(ConnectionStatus::Connecting);

        let (tx, rx) = mpsc::unbounded_channel();
        let listener = shared.register(ListenerKey::Connect);
        let dispatcher = tokio::spawn(dispatch(Arc::downgrade(shared), rx));

        if let Err(e) = shared.transport.connect(properties, tx).await {
            shared.deregister(ListenerKey::Connect);
            dispatcher.abort();
            shared.store.set_status(ConnectionStatus::Disconnected);
            error!("Connection failed to the message router: {}", e);
            return Err(ConnectionError::Transport(e).into());
        }

        let timeout = shared.settings.connect_timeout;
        match wait_for(shared, "connect", timeout, ListenerKey::Connect, listener).await {
            Ok(Ok(())) => {
                *session = Some(Session {
                    client_name: client_name.clone(),
                    dispatcher,
                });
                info!("Connected to message router as {}", client_name);
                Ok(())
            }
            Ok(Err(reason)) => {
                release_transport(shared).await;
                dispatcher.abort();
                error!(
                    "Connection failed to the message router: {} - check correct parameter values and connectivity!",
                    reason
                );
                Err(ConnectionError::Failed(reason).into())
            }
            Err(e) => {
                release_transport(shared).await;
                dispatcher.abort();
                shared.store.set_status(ConnectionStatus::Disconnected);
                error!(
                    "Connection failed to the message router: {} - check correct parameter values and connectivity!",
                    e
                );
                Err(e)
            }
        }
    }

    /// Closes the session and drops all subscriptions.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let shared = &self.shared;
        if !self.is_connected().await {
            info!("Not connected to message router.");
            return Ok(());
        }

        info!("Disconnecting from message router");
        let listener = shared.register(ListenerKey::Disconnect);
        let outcome = match shared.transport.disconnect().await {
            Ok(()) => {
                let timeout = shared.settings.connect_timeout;
                wait_for(shared, "disconnect", timeout, ListenerKey::Disconnect, listener)
                    .await
                    .map(|_| ())
            }
            Err(TransportError::NotConnected) => {
                shared.deregister(ListenerKey::Disconnect);
                Ok(())
            }
            Err(e) => {
                shared.deregister(ListenerKey::Disconnect);
                Err(ConnectionError::Transport(e).into())
            }
        };

        if let Some(dispatcher) = shared.tear_down().await {
            dispatcher.abort();
        }
        shared.store.set_status(ConnectionStatus::Disconnected);
        outcome
    }

    pub async fn subscribe(
        &self,
        topic: &str,
        callback: MessageCallback,
    ) -> Result<(), ClientError> {
        self.ensure_connected().await?;
        let shared = &self.shared;

        if let Err(e) = shared
            .subscriptions
            .lock()
            .await
            .insert_pending(topic, callback)
        {
            warn!("Already subscribed to {}.", topic);
            return Err(e.into());
        }

        match self.broker_subscribe(topic).await {
            Ok(()) => {
                shared.subscriptions.lock().await.activate(topic);
                info!("Successfully subscribed to topic: {}", topic);
                Ok(())
            }
            Err(e) => {
                shared.subscriptions.lock().await.remove(topic);
                error!("Cannot subscribe to topic {}: {}", topic, e);
                Err(e)
            }
        }
    }

    async fn broker_subscribe(&self, topic: &str) -> Result<(), ClientError> {
        let shared = &self.shared;
        let key = CorrelationKey::new();
        let listener = shared.register(ListenerKey::Op(key));

        if let Err(e) = shared.transport.subscribe(topic, key).await {
            shared.deregister(ListenerKey::Op(key));
            return Err(SubscriptionError::Transport(e).into());
        }

        let timeout = shared.settings.operation_timeout;
        wait_for(shared, "subscribe", timeout, ListenerKey::Op(key), listener)
            .await?
            .map_err(|reason| {
                SubscriptionError::Rejected {
                    topic: topic.to_string(),
                    reason,
                }
                .into()
            })
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), ClientError> {
        self.ensure_connected().await?;
        let shared = &self.shared;

        if let Err(e) = shared.subscriptions.lock().await.deactivate(topic) {
            warn!("Cannot unsubscribe from {}: not subscribed.", topic);
            return Err(e.into());
        }

        let key = CorrelationKey::new();
        let listener = shared.register(ListenerKey::Op(key));
        let outcome = match shared.transport.unsubscribe(topic, key).await {
            Ok(()) => {
                let timeout = shared.settings.operation_timeout;
                wait_for(shared, "unsubscribe", timeout, ListenerKey::Op(key), listener)
                    .await
                    .and_then(|verdict| {
                        verdict.map_err(|reason| {
                            SubscriptionError::Rejected {
                                topic: topic.to_string(),
                                reason,
                            }
                            .into()
                        })
                    })
            }
            Err(e) => {
                shared.deregister(ListenerKey::Op(key));
                Err(SubscriptionError::Transport(e).into())
            }
        };

        let mut subscriptions = shared.subscriptions.lock().await;
        match outcome {
            Ok(()) => {
                subscriptions.remove(topic);
                info!("Successfully unsubscribed from topic: {}", topic);
                Ok(())
            }
            Err(e) => {
                subscriptions.restore(topic);
                error!("Cannot unsubscribe from topic {}: {}", topic, e);
                Err(e)
            }
        }
    }

    /// Fire-and-forget publish. Does nothing when not connected.
    pub async fn publish_direct_message(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        if !self.is_connected().await {
            debug!("Dropping direct message to {}: not connected", topic);
            return;
        }

        let message = Message::direct(topic, payload);
        debug!("Publishing direct message {}", message);
        if let Err(e) = self.shared.transport.send(message).await {
            error!("Direct publish to {} failed: {}", topic, e);
        }
    }

    /// Publishes a persistent message and waits for the broker to accept it.
    pub async fn publish_guaranteed_message(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), ClientError> {
        self.ensure_connected().await?;
        let shared = &self.shared;

        let key = CorrelationKey::new();
        let listener = shared.register(ListenerKey::Op(key));
        if let Err(e) = shared
            .transport
            .send(Message::persistent(topic, payload, key))
            .await
        {
            shared.deregister(ListenerKey::Op(key));
            return Err(PublishError::Transport(e).into());
        }

        let timeout = shared.settings.publish_timeout;
        match wait_for(shared, "guaranteed publish", timeout, ListenerKey::Op(key), listener)
            .await?
        {
            Ok(()) => {
                debug!("Guaranteed message on {} acknowledged", topic);
                Ok(())
            }
            Err(reason) => {
                error!("Guaranteed message on {} rejected: {}", topic, reason);
                Err(PublishError::Rejected {
                    topic: topic.to_string(),
                    reason,
                }
                .into())
            }
        }
    }

    /// Starts consuming `queue`, creating it if missing. Each message is
    /// acknowledged after `callback` returns.
    pub async fn consume_from_queue(
        &self,
        queue: &str,
        callback: MessageCallback,
    ) -> Result<(), ClientError> {
        self.ensure_connected().await?;
        let shared = &self.shared;

        {
            let mut consumer = shared.consumer.lock().await;
            if let Some(active) = consumer.as_ref() {
                warn!("Already consuming from queue {}.", active.queue());
                return Ok(());
            }
            // the dispatcher moves the consumer to Consuming on the bind notice
            *consumer = Some(ActiveConsumer {
                phase: ConsumerPhase::Binding(QueueConsumer::create(queue)),
                callback,
            });
        }

        let key = CorrelationKey::new();
        let listener = shared.register(ListenerKey::Op(key));
        let outcome = match shared.transport.bind_queue(queue, key).await {
            Ok(()) => {
                let timeout = shared.settings.operation_timeout;
                wait_for(shared, "queue bind", timeout, ListenerKey::Op(key), listener)
                    .await
                    .and_then(|verdict| verdict.map_err(ClientError::Consumer))
            }
            Err(e) => {
                shared.deregister(ListenerKey::Op(key));
                Err(ClientError::Consumer(e.to_string()))
            }
        };

        if let Err(e) = &outcome {
            error!("Cannot bind to queue {}: {}", queue, e);
            let mut consumer = shared.consumer.lock().await;
            if consumer.as_ref().is_some_and(|a| a.is_binding()) {
                if let Some(active) = consumer.take() {
                    active.stop();
                }
            }
        }
        outcome
    }

    pub async fn stop_consume_from_queue(&self) -> Result<(), ClientError> {
        let Some(active) = self.shared.consumer.lock().await.take() else {
            info!("Not consuming from any queue.");
            return Ok(());
        };

        let queue = active.queue().to_string();
        let stopped = active.stop();
        match self.shared.transport.unbind_queue(&queue).await {
            Ok(()) => {
                info!("Stopped consuming {}", stopped.summary());
                Ok(())
            }
            Err(TransportError::NotConnected) => Ok(()),
            Err(e) => Err(ClientError::Consumer(e.to_string())),
        }
    }

    pub async fn add_subscription_to_queue(&self, topic: &str) -> Result<(), ClientError> {
        self.queue_subscription(topic, true).await
    }

    pub async fn remove_subscription_from_queue(&self, topic: &str) -> Result<(), ClientError> {
        self.queue_subscription(topic, false).await
    }

    async fn queue_subscription(&self, topic: &str, add: bool) -> Result<(), ClientError> {
        self.ensure_connected().await?;
        let shared = &self.shared;

        let queue = match shared.consumer.lock().await.as_ref() {
            Some(active) if !active.is_binding() => active.queue().to_string(),
            Some(_) => {
                return Err(ClientError::Consumer(
                    "Queue consumer is still binding".to_string(),
                ))
            }
            None => {
                return Err(ClientError::Consumer(
                    "No active queue consumer".to_string(),
                ))
            }
        };

        let key = CorrelationKey::new();
        let listener = shared.register(ListenerKey::Op(key));
        let sent = if add {
            shared.transport.add_queue_subscription(&queue, topic, key).await
        } else {
            shared
                .transport
                .remove_queue_subscription(&queue, topic, key)
                .await
        };
        if let Err(e) = sent {
            shared.deregister(ListenerKey::Op(key));
            return Err(SubscriptionError::Transport(e).into());
        }

        let operation = if add {
            "queue subscribe"
        } else {
            "queue unsubscribe"
        };
        let timeout = shared.settings.operation_timeout;
        if let Err(reason) =
            wait_for(shared, operation, timeout, ListenerKey::Op(key), listener).await?
        {
            error!("{} of {} on {} failed: {}", operation, topic, queue, reason);
            return Err(SubscriptionError::Rejected {
                topic: topic.to_string(),
                reason,
            }
            .into());
        }

        if let Some(consumer) = shared
            .consumer
            .lock()
            .await
            .as_mut()
            .and_then(|active| active.consuming())
        {
            if add {
                consumer.add_subscription(topic);
            } else {
                consumer.remove_subscription(topic);
            }
        }
        info!("{} of {} on queue {} done", operation, topic, queue);
        Ok(())
    }

    /// Sends a subscription request and registers every granted filter with
    /// `callback`. Returns the raw response text.
    pub async fn send_subscription_request(
        &self,
        topic: &str,
        payload: &str,
        callback: MessageCallback,
    ) -> Result<String, ClientError> {
        let Some(client_name) = self.client_name().await else {
            return Err(ClientError::not_connected());
        };
        let shared = &self.shared;

        let inbox = request::inbox_topic(&client_name, &CorrelationKey::new());
        let (reply_tx, reply_rx) = oneshot::channel::<String>();
        let reply_slot = StdMutex::new(Some(reply_tx));
        let on_reply: MessageCallback = Arc::new(move |msg: &Message| {
            let sender = reply_slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(sender) = sender {
                let _ = sender.send(msg.payload_text().into_owned());
            }
        });
        self.subscribe(&inbox, on_reply).await?;

        let envelope = RequestEnvelope::new(inbox.clone(), payload);
        let sent = match envelope.to_bytes() {
            Ok(bytes) => shared
                .transport
                .send(Message::direct(topic, bytes))
                .await
                .map_err(|e| ClientError::Publish(PublishError::Transport(e))),
            Err(e) => Err(ClientError::Request(e.to_string())),
        };

        let reply = match sent {
            Ok(()) => {
                let timeout = shared.settings.request_timeout;
                match tokio::time::timeout(timeout, reply_rx).await {
                    Ok(Ok(text)) => Ok(text),
                    Ok(Err(_)) => Err(ClientError::Request("Reply inbox closed".to_string())),
                    Err(_) => Err(ClientError::Timeout {
                        operation: "subscription request",
                        timeout,
                    }),
                }
            }
            Err(e) => Err(e),
        };

        if let Err(e) = self.unsubscribe(&inbox).await {
            debug!("Inbox {} not released: {}", inbox, e);
        }

        let text = match reply {
            Ok(text) => text,
            Err(e) => {
                error!("Subscription request on {} failed: {}", topic, e);
                return Err(e);
            }
        };
        info!("Subscription response received: {}", text);

        let response: SubManResponse = serde_json::from_str(&text)
            .map_err(|e| ClientError::Request(format!("Malformed subscription response: {}", e)))?;

        for filter in &response.subscriptions {
            {
                let mut subscriptions = shared.subscriptions.lock().await;
                if subscriptions.is_active(filter) {
                    subscriptions.grant(filter, callback.clone());
                    continue;
                }
            }
            match self.broker_subscribe(filter).await {
                Ok(()) => {
                    shared
                        .subscriptions
                        .lock()
                        .await
                        .grant(filter, callback.clone());
                    info!("Granted subscription to {}", filter);
                }
                Err(e) => warn!("Granted filter {} could not be subscribed: {}", filter, e),
            }
        }

        Ok(text)
    }

    /// Answers a request received as `envelope`.
    pub async fn send_reply(
        &self,
        envelope: &RequestEnvelope,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), ClientError> {
        self.ensure_connected().await?;
        self.shared
            .transport
            .send(Message::direct(envelope.reply_to.as_str(), payload))
            .await
            .map_err(|e| PublishError::Transport(e).into())
    }
}

/// Consumes transport events for one session.
async fn dispatch(shared: Weak<Shared>, mut events: EventReceiver) {
    let mut was_up = false;

    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };

        match event {
            SessionEvent::UpNotice => {
                shared.store.set_status(ConnectionStatus::Connected);
                if was_up {
                    info!("Session re-established, restoring subscriptions");
                    restore_session(&shared).await;
                } else {
                    shared.resolve(ListenerKey::Connect, Ok(()));
                }
                was_up = true;
            }
            SessionEvent::ConnectFailed(reason) => {
                shared.store.set_status(ConnectionStatus::Disconnected);
                let connecting =
                    !was_up && shared.resolve(ListenerKey::Connect, Err(reason.clone()));
                if !connecting {
                    error!("Connection to the message router lost: {}", reason);
                    shared.fail_all("Session lost");
                    release_transport(&shared).await;
                    drop(shared.tear_down().await);
                }
                break;
            }
            SessionEvent::Reconnecting(reason) => {
                warn!("Connection lost, reconnecting: {}", reason);
                shared.store.set_status(ConnectionStatus::Connecting);
            }
            SessionEvent::Disconnected => {
                shared.store.set_status(ConnectionStatus::Disconnected);
                let expected = shared.resolve(ListenerKey::Disconnect, Ok(()));
                shared.fail_all("Session disconnected");
                if !expected {
                    error!("Disconnected from message router");
                    // dropping our own handle detaches it
                    drop(shared.tear_down().await);
                }
                break;
            }
            SessionEvent::ConsumerUp { key, queue } => {
                {
                    let mut consumer = shared.consumer.lock().await;
                    if consumer
                        .as_ref()
                        .is_some_and(|a| a.is_binding() && a.queue() == queue)
                    {
                        *consumer = consumer.take().map(ActiveConsumer::bound);
                    }
                }
                if !shared.resolve(ListenerKey::Op(key), Ok(())) {
                    debug!("Consumer on {} up again", queue);
                }
            }
            SessionEvent::SubscriptionOk(key) | SessionEvent::Acknowledged(key) => {
                if !shared.resolve(ListenerKey::Op(key), Ok(())) {
                    debug!("Acknowledgement for unknown key {}", key);
                }
            }
            SessionEvent::SubscriptionError { key, reason }
            | SessionEvent::Rejected { key, reason }
            | SessionEvent::ConsumerBindFailed { key, reason, .. } => {
                if !shared.resolve(ListenerKey::Op(key), Err(reason.clone())) {
                    warn!("Unsolicited rejection {}: {}", key, reason);
                }
            }
            SessionEvent::Message(message) => {
                let callbacks = shared
                    .subscriptions
                    .lock()
                    .await
                    .matching_callbacks(message.destination());
                if callbacks.is_empty() {
                    debug!("No subscription matches {}", message.destination());
                }
                for callback in callbacks {
                    callback(&message);
                }
            }
            SessionEvent::QueueMessage {
                queue,
                delivery_id,
                message,
            } => deliver_queue_message(&shared, &queue, delivery_id, &message).await,
            SessionEvent::ConsumerDown { queue } => {
                let mut consumer = shared.consumer.lock().await;
                if consumer
                    .as_ref()
                    .is_some_and(|active| !active.is_binding() && active.queue() == queue)
                {
                    warn!("Consumer on queue {} went down", queue);
                    if let Some(active) = consumer.take() {
                        debug!("{}", active.stop().summary());
                    }
                } else {
                    debug!("Consumer on queue {} released", queue);
                }
            }
        }
    }

    debug!("Session dispatcher finished");
}

/// Drops whatever the transport still holds of a session that failed.
async fn release_transport(shared: &Shared) {
    match shared.transport.disconnect().await {
        Ok(()) | Err(TransportError::NotConnected) => {}
        Err(e) => debug!("Transport not released: {}", e),
    }
}

async fn deliver_queue_message(shared: &Shared, queue: &str, delivery_id: u64, message: &Message) {
    let callback = match shared.consumer.lock().await.as_ref() {
        Some(active) if active.queue() == queue => active.callback.clone(),
        _ => {
            debug!("Dropping delivery {} from unconsumed queue {}", delivery_id, queue);
            return;
        }
    };

    callback(message);

    if let Err(e) = shared.transport.ack(queue, delivery_id).await {
        error!("Cannot acknowledge delivery {} on {}: {}", delivery_id, queue, e);
        return;
    }
    if let Some(consumer) = shared
        .consumer
        .lock()
        .await
        .as_mut()
        .and_then(|active| active.consuming())
    {
        consumer.record_delivery();
    }
}

/// Re-issues broker state after an automatic reconnect. Acknowledgements
/// for these requests carry fresh keys and are ignored.
async fn restore_session(shared: &Shared) {
    let topics = shared.subscriptions.lock().await.active_topics();
    for topic in topics {
        if let Err(e) = shared.transport.subscribe(&topic, CorrelationKey::new()).await {
            error!("Cannot restore subscription {}: {}", topic, e);
        }
    }

    let consumer = shared
        .consumer
        .lock()
        .await
        .as_mut()
        .and_then(|active| active.consuming())
        .map(|c| (c.queue().to_string(), c.subscriptions().to_vec()));
    if let Some((queue, filters)) = consumer {
        if let Err(e) = shared.transport.bind_queue(&queue, CorrelationKey::new()).await {
            error!("Cannot rebind queue {}: {}", queue, e);
            return;
        }
        for filter in filters {
            if let Err(e) = shared
                .transport
                .add_queue_subscription(&queue, &filter, CorrelationKey::new())
                .await
            {
                error!("Cannot restore queue subscription {}: {}", filter, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::EventSender;
    use crate::transport::{BrokerPolicy, MemoryBroker};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const URL: &str = "ws://localhost:8008";

    async fn connected(broker: &MemoryBroker) -> AsyncClient {
        let client = AsyncClient::new(Arc::new(broker.transport()));
        client.connect(URL, "default", "trader", "").await.unwrap();
        client
    }

    fn noop() -> MessageCallback {
        Arc::new(|_msg: &Message| {})
    }

    /// Acknowledges every request at once and records what it was asked to
    /// do. Tests push session events through `emit`.
    #[derive(Default)]
    struct ScriptedTransport {
        events: StdMutex<Option<EventSender>>,
        connects: AtomicUsize,
        refuse: AtomicBool,
        hold_acks: AtomicBool,
        subscribed: StdMutex<Vec<String>>,
        bound: StdMutex<Vec<String>>,
        queue_filters: StdMutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn emit(&self, event: SessionEvent) {
            if let Some(tx) = self.events.lock().unwrap().as_ref() {
                let _ = tx.send(event);
            }
        }

        fn answer(&self, event: SessionEvent) {
            if !self.hold_acks.load(Ordering::SeqCst) {
                self.emit(event);
            }
        }

        fn subscribed(&self) -> Vec<String> {
            self.subscribed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(
            &self,
            _properties: SessionProperties,
            events: EventSender,
        ) -> Result<(), TransportError> {
            let mut slot = self.events.lock().unwrap();
            if slot.is_some() {
                return Err(TransportError::AlreadyConnected);
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            let verdict = if self.refuse.load(Ordering::SeqCst) {
                SessionEvent::ConnectFailed(
                    "Client Username Is Shutdown or Unauthorized".to_string(),
                )
            } else {
                SessionEvent::UpNotice
            };
            let _ = events.send(verdict);
            *slot = Some(events);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            let events = self
                .events
                .lock()
                .unwrap()
                .take()
                .ok_or(TransportError::NotConnected)?;
            let _ = events.send(SessionEvent::Disconnected);
            Ok(())
        }

        async fn subscribe(&self, filter: &str, key: CorrelationKey) -> Result<(), TransportError> {
            self.subscribed.lock().unwrap().push(filter.to_string());
            self.answer(SessionEvent::SubscriptionOk(key));
            Ok(())
        }

        async fn unsubscribe(&self, _filter: &str, key: CorrelationKey) -> Result<(), TransportError> {
            self.answer(SessionEvent::SubscriptionOk(key));
            Ok(())
        }

        async fn send(&self, message: Message) -> Result<(), TransportError> {
            if let Some(key) = message.correlation_key() {
                self.answer(SessionEvent::Acknowledged(key));
            }
            Ok(())
        }

        async fn bind_queue(&self, queue: &str, key: CorrelationKey) -> Result<(), TransportError> {
            self.bound.lock().unwrap().push(queue.to_string());
            self.answer(SessionEvent::ConsumerUp {
                key,
                queue: queue.to_string(),
            });
            Ok(())
        }

        async fn unbind_queue(&self, queue: &str) -> Result<(), TransportError> {
            self.emit(SessionEvent::ConsumerDown {
                queue: queue.to_string(),
            });
            Ok(())
        }

        async fn add_queue_subscription(
            &self,
            _queue: &str,
            filter: &str,
            key: CorrelationKey,
        ) -> Result<(), TransportError> {
            self.queue_filters.lock().unwrap().push(filter.to_string());
            self.answer(SessionEvent::SubscriptionOk(key));
            Ok(())
        }

        async fn remove_queue_subscription(
            &self,
            _queue: &str,
            _filter: &str,
            key: CorrelationKey,
        ) -> Result<(), TransportError> {
            self.answer(SessionEvent::SubscriptionOk(key));
            Ok(())
        }

        async fn ack(&self, _queue: &str, _delivery_id: u64) -> Result<(), TransportError> {
            Ok(())
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn rejects_unsupported_scheme() {
        let client = AsyncClient::new(Arc::new(MemoryBroker::new().transport()));
        let err = client
            .connect("http://localhost", "default", "u", "p")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Connection(ConnectionError::InvalidUrl(_))
        ));
        assert_eq!(client.store().status(), ConnectionStatus::Connecting);
    }

    #[tokio::test]
    async fn connect_updates_status_and_is_idempotent() {
        let broker = MemoryBroker::new();
        let client = connected(&broker).await;

        assert_eq!(client.store().status(), ConnectionStatus::Connected);
        assert!(client.client_name().await.unwrap().starts_with("rates-"));

        client.connect(URL, "default", "trader", "").await.unwrap();
        assert_eq!(broker.session_count(), 1);
    }

    #[tokio::test]
    async fn failed_connect_reports_disconnected() {
        let policy = BrokerPolicy {
            vpn_name: Some("rates".to_string()),
            ..Default::default()
        };
        let broker = MemoryBroker::with_policy(policy);
        let client = AsyncClient::new(Arc::new(broker.transport()));

        let err = client.connect(URL, "other", "u", "p").await.unwrap_err();
        assert!(matches!(err, ClientError::Connection(ConnectionError::Failed(_))));
        assert_eq!(client.store().status(), ConnectionStatus::Disconnected);
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn operations_require_connection() {
        let client = AsyncClient::new(Arc::new(MemoryBroker::new().transport()));

        assert!(matches!(
            client.subscribe("a/b", noop()).await,
            Err(ClientError::Connection(ConnectionError::NotConnected))
        ));
        assert!(client.unsubscribe("a/b").await.is_err());
        assert!(client.publish_guaranteed_message("a/b", "x").await.is_err());
        client.publish_direct_message("a/b", "x").await;
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_twice_and_unsubscribe_unknown_are_rejected() {
        let broker = MemoryBroker::new();
        let client = connected(&broker).await;

        client.subscribe("rates/v1/>", noop()).await.unwrap();
        assert!(matches!(
            client.subscribe("rates/v1/>", noop()).await,
            Err(ClientError::Subscription(SubscriptionError::AlreadySubscribed(_)))
        ));
        assert!(matches!(
            client.unsubscribe("never/subscribed").await,
            Err(ClientError::Subscription(SubscriptionError::NotSubscribed(_)))
        ));

        client.unsubscribe("rates/v1/>").await.unwrap();
        client.subscribe("rates/v1/>", noop()).await.unwrap();
    }

    #[tokio::test]
    async fn broker_rejection_leaves_no_entry() {
        let policy = BrokerPolicy {
            denied_filters: vec!["secret/>".to_string()],
            ..Default::default()
        };
        let broker = MemoryBroker::with_policy(policy);
        let client = connected(&broker).await;

        assert!(matches!(
            client.subscribe("secret/>", noop()).await,
            Err(ClientError::Subscription(SubscriptionError::Rejected { .. }))
        ));
        assert!(matches!(
            client.unsubscribe("secret/>").await,
            Err(ClientError::Subscription(SubscriptionError::NotSubscribed(_)))
        ));
    }

    #[tokio::test]
    async fn dispatches_to_every_matching_filter() {
        let broker = MemoryBroker::new();
        let client = connected(&broker).await;
        let hits = Arc::new(AtomicUsize::new(0));

        for filter in ["a/*/c", "a/b/>", "x/*"] {
            let hits = hits.clone();
            client
                .subscribe(
                    filter,
                    Arc::new(move |_msg: &Message| {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .await
                .unwrap();
        }

        client.publish_direct_message("a/b/c", "1").await;
        client.publish_guaranteed_message("a/b/c/d", "2").await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while hits.load(Ordering::SeqCst) < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn disconnect_clears_session() {
        let broker = MemoryBroker::new();
        let client = connected(&broker).await;
        client.subscribe("a/>", noop()).await.unwrap();

        client.disconnect().await.unwrap();
        assert_eq!(client.store().status(), ConnectionStatus::Disconnected);
        assert!(client.client_name().await.is_none());
        assert_eq!(broker.session_count(), 0);

        client.connect(URL, "default", "trader", "").await.unwrap();
        client.subscribe("a/>", noop()).await.unwrap();
    }

    #[tokio::test]
    async fn refused_connect_can_be_retried_at_once() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.refuse.store(true, Ordering::SeqCst);
        let client = AsyncClient::new(transport.clone());

        let err = client.connect(URL, "default", "trader", "").await.unwrap_err();
        assert!(matches!(err, ClientError::Connection(ConnectionError::Failed(_))));
        assert!(transport.events.lock().unwrap().is_none());

        transport.refuse.store(false, Ordering::SeqCst);
        client.connect(URL, "default", "trader", "").await.unwrap();
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
        assert_eq!(client.store().status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn reconnect_restores_subscriptions_and_queue() {
        let transport = Arc::new(ScriptedTransport::default());
        let client = AsyncClient::new(transport.clone());
        client.connect(URL, "default", "trader", "").await.unwrap();

        client.subscribe("rates/v1/bond/>", noop()).await.unwrap();
        client.consume_from_queue("q.notes", noop()).await.unwrap();
        client.add_subscription_to_queue("rates/v1/note/>").await.unwrap();

        transport.emit(SessionEvent::Reconnecting("connection reset".to_string()));
        transport.emit(SessionEvent::UpNotice);

        eventually(|| transport.queue_filters.lock().unwrap().len() == 2).await;
        assert_eq!(transport.subscribed(), vec!["rates/v1/bond/>"; 2]);
        assert_eq!(*transport.bound.lock().unwrap(), vec!["q.notes"; 2]);
        assert_eq!(client.store().status(), ConnectionStatus::Connected);
        assert!(client.is_connected().await);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lost_session_fails_pending_and_allows_reconnect() {
        let transport = Arc::new(ScriptedTransport::default());
        let client = AsyncClient::with_settings(
            transport.clone(),
            ClientSettings {
                operation_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        );
        client.connect(URL, "default", "trader", "").await.unwrap();

        transport.hold_acks.store(true, Ordering::SeqCst);
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.subscribe("rates/v1/>", noop()).await }
        });
        eventually(|| transport.subscribed().len() == 1).await;

        transport.emit(SessionEvent::Reconnecting("connection reset".to_string()));
        transport.emit(SessionEvent::ConnectFailed("retries exhausted".to_string()));

        let err = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(!err.is_timeout());

        let mut status = client.store().watch_status();
        tokio::time::timeout(Duration::from_secs(1), async {
            while client.is_connected().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*status.borrow_and_update(), ConnectionStatus::Disconnected);

        transport.hold_acks.store(false, Ordering::SeqCst);
        client.connect(URL, "default", "trader", "").await.unwrap();
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
        assert!(client.is_connected().await);
        client.subscribe("rates/v1/>", noop()).await.unwrap();
    }
}
