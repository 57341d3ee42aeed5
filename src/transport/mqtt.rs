//! rumqttc-backed transport.
//!
//! MQTT acknowledgements carry packet ids, not correlation keys. Requests of
//! one kind are sent and acknowledged in order, so each kind keeps a FIFO of
//! the keys waiting for a SUBACK, UNSUBACK or PUBACK and the event loop pops
//! the front entry when the acknowledgement arrives.
//!
//! Queues map onto shared subscriptions (`$share/<queue>/<filter>`). Deliveries
//! whose topic matches one of a bound queue's filters are reported as queue
//! messages; rumqttc acknowledges them itself.
//!
//! A topic covered by both a plain subscription and a queue filter is
//! delivered twice, once per subscription. Plain subscriptions are QoS 0 and
//! queue subscriptions QoS 1, so a QoS 1 copy of such a topic goes to the
//! queue and a QoS 0 copy to the plain subscribers. A QoS 0 publish arrives
//! as two QoS 0 copies and both are dispatched as direct messages.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish,
    QoS, SubscribeReasonCode, Transport as NetworkTransport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Transport, TransportError};
use crate::session::{
    CorrelationKey, DeliveryMode, EventSender, Message, Scheme, SessionEvent, SessionProperties,
};
use crate::topic::{self, TopicMatcher};

const REQUEST_CAPACITY: usize = 100;
const RETRY_DELAY: Duration = Duration::from_secs(1);
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug)]
enum AckKind {
    Subscribe,
    Unsubscribe,
    Publish,
}

/// Keys waiting for an acknowledgement, per request kind. `None` marks a
/// request nobody waits on but which still occupies its slot in the order.
#[derive(Default)]
struct PendingAcks {
    subscribe: VecDeque<Option<CorrelationKey>>,
    unsubscribe: VecDeque<Option<CorrelationKey>>,
    publish: VecDeque<Option<CorrelationKey>>,
}

impl PendingAcks {
    fn queue(&mut self, kind: AckKind) -> &mut VecDeque<Option<CorrelationKey>> {
        match kind {
            AckKind::Subscribe => &mut self.subscribe,
            AckKind::Unsubscribe => &mut self.unsubscribe,
            AckKind::Publish => &mut self.publish,
        }
    }
}

type SharedAcks = Arc<Mutex<PendingAcks>>;
type Routes = Vec<(String, TopicMatcher)>;
type QueueRoutes = Arc<Mutex<HashMap<String, Routes>>>;
type DirectRoutes = Arc<Mutex<Routes>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct MqttSession {
    client: AsyncClient,
    acks: SharedAcks,
    queues: QueueRoutes,
    direct: DirectRoutes,
    events: EventSender,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MqttSession {
    fn expect_ack(&self, kind: AckKind, key: Option<CorrelationKey>) {
        lock(&self.acks).queue(kind).push_back(key);
    }

    fn forget_ack(&self, kind: AckKind, key: Option<CorrelationKey>) {
        let mut acks = lock(&self.acks);
        let pending = acks.queue(kind);
        if let Some(pos) = pending.iter().rposition(|k| *k == key) {
            pending.remove(pos);
        }
    }

    async fn subscribe(
        &self,
        filter: String,
        qos: QoS,
        key: Option<CorrelationKey>,
    ) -> Result<(), TransportError> {
        self.expect_ack(AckKind::Subscribe, key);
        if let Err(e) = self.client.subscribe(filter, qos).await {
            self.forget_ack(AckKind::Subscribe, key);
            return Err(TransportError::Backend(e.to_string()));
        }
        Ok(())
    }

    async fn unsubscribe(
        &self,
        filter: String,
        key: Option<CorrelationKey>,
    ) -> Result<(), TransportError> {
        self.expect_ack(AckKind::Unsubscribe, key);
        if let Err(e) = self.client.unsubscribe(filter).await {
            self.forget_ack(AckKind::Unsubscribe, key);
            return Err(TransportError::Backend(e.to_string()));
        }
        Ok(())
    }
}

/// Transport for MQTT brokers over TCP, TLS or WebSockets.
#[derive(Default)]
pub struct MqttTransport {
    session: tokio::sync::Mutex<Option<MqttSession>>,
}

impl MqttTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

fn mqtt_options(properties: &SessionProperties) -> MqttOptions {
    let url = &properties.url;
    // websocket transports take the whole URL as host
    let host = if url.scheme().is_websocket() {
        url.as_str().to_string()
    } else {
        url.host().to_string()
    };

    let mut options = MqttOptions::new(properties.client_name.clone(), host, url.port());
    options
        .set_keep_alive(properties.keep_alive.max(MIN_KEEP_ALIVE))
        .set_clean_session(true);
    if !properties.username.is_empty() {
        options.set_credentials(properties.username.clone(), properties.password.clone());
    }

    match url.scheme() {
        Scheme::Tcp => {}
        Scheme::Tls => {
            options.set_transport(NetworkTransport::tls_with_default_config());
        }
        Scheme::Ws => {
            options.set_transport(NetworkTransport::Ws);
        }
        Scheme::Wss => {
            options.set_transport(NetworkTransport::wss_with_default_config());
        }
    }

    options
}

/// Queue a delivery belongs to, if any.
fn queue_for(
    queues: &HashMap<String, Routes>,
    direct: &[(String, TopicMatcher)],
    topic: &str,
    qos: QoS,
) -> Option<String> {
    let queue = queues
        .iter()
        .find(|(_, filters)| filters.iter().any(|(_, m)| m.matches(topic)))
        .map(|(name, _)| name.clone())?;

    let overlaps = direct.iter().any(|(_, m)| m.matches(topic));
    if overlaps && qos == QoS::AtMostOnce {
        None
    } else {
        Some(queue)
    }
}

struct EventLoopContext {
    events: EventSender,
    acks: SharedAcks,
    queues: QueueRoutes,
    direct: DirectRoutes,
    retries: u32,
    cancel: CancellationToken,
}

impl EventLoopContext {
    fn pop_ack(&self, kind: AckKind) -> Option<CorrelationKey> {
        lock(&self.acks).queue(kind).pop_front().flatten()
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Session event dropped, client is gone");
        }
    }

    fn deliver(&self, publish: Publish) {
        let delivery_mode = if publish.qos == QoS::AtMostOnce {
            DeliveryMode::Direct
        } else {
            DeliveryMode::Persistent
        };
        let message =
            Message::direct(publish.topic, publish.payload.to_vec()).with_delivery_mode(delivery_mode);

        let queue = queue_for(
            &lock(&self.queues),
            &lock(&self.direct),
            message.destination(),
            publish.qos,
        );

        match queue {
            Some(queue) => self.emit(SessionEvent::QueueMessage {
                queue,
                delivery_id: u64::from(publish.pkid),
                message,
            }),
            None => self.emit(SessionEvent::Message(message)),
        }
    }

    /// Fails every outstanding acknowledgement after the connection dropped.
    fn fail_pending(&self, reason: &str) {
        let mut guard = lock(&self.acks);
        let acks = &mut *guard;
        for key in acks.subscribe.drain(..).chain(acks.unsubscribe.drain(..)).flatten() {
            self.emit(SessionEvent::SubscriptionError {
                key,
                reason: reason.to_string(),
            });
        }
        for key in acks.publish.drain(..).flatten() {
            self.emit(SessionEvent::Rejected {
                key,
                reason: reason.to_string(),
            });
        }
    }
}

async fn run_event_loop(mut eventloop: EventLoop, ctx: EventLoopContext) {
    let mut up = false;
    let mut failures: u32 = 0;

    loop {
        let polled = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("Connected to broker (session present: {})", ack.session_present);
                    up = true;
                    failures = 0;
                    ctx.emit(SessionEvent::UpNotice);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => ctx.deliver(publish),
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let refused = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                if let Some(key) = ctx.pop_ack(AckKind::Subscribe) {
                    if refused {
                        ctx.emit(SessionEvent::SubscriptionError {
                            key,
                            reason: format!("Broker refused subscription (pkid {})", ack.pkid),
                        });
                    } else {
                        ctx.emit(SessionEvent::SubscriptionOk(key));
                    }
                }
            }
            Ok(Event::Incoming(Packet::UnsubAck(_))) => {
                if let Some(key) = ctx.pop_ack(AckKind::Unsubscribe) {
                    ctx.emit(SessionEvent::SubscriptionOk(key));
                }
            }
            Ok(Event::Incoming(Packet::PubAck(_))) => {
                if let Some(key) = ctx.pop_ack(AckKind::Publish) {
                    ctx.emit(SessionEvent::Acknowledged(key));
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker sent DISCONNECT");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                ctx.emit(SessionEvent::Disconnected);
                break;
            }
            Ok(event) => debug!("MQTT event: {:?}", event),
            Err(e) => {
                let reason = e.to_string();
                if up {
                    up = false;
                    failures = 0;
                    warn!("Connection to broker lost: {}", reason);
                    ctx.fail_pending(&reason);
                    ctx.emit(SessionEvent::Reconnecting(reason.clone()));
                }

                failures += 1;
                if failures > ctx.retries {
                    error!("Giving up after {} connection attempts: {}", failures, reason);
                    ctx.fail_pending(&reason);
                    ctx.emit(SessionEvent::ConnectFailed(reason));
                    break;
                }

                debug!("Connection attempt {} failed: {}", failures, reason);
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
    }

    debug!("MQTT event loop stopped");
}

fn active(session: &Option<MqttSession>) -> Result<&MqttSession, TransportError> {
    session.as_ref().ok_or(TransportError::NotConnected)
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(
        &self,
        properties: SessionProperties,
        events: EventSender,
    ) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;
        if let Some(existing) = session.as_ref() {
            if !existing.task.is_finished() {
                return Err(TransportError::AlreadyConnected);
            }
        }

        if !properties.vpn_name.is_empty() {
            debug!(
                "MQTT has no message VPNs, ignoring vpn {}",
                properties.vpn_name
            );
        }
        info!(
            "Connecting to {} as {}",
            properties.url, properties.client_name
        );

        let (client, eventloop) = AsyncClient::new(mqtt_options(&properties), REQUEST_CAPACITY);
        let acks = SharedAcks::default();
        let queues = QueueRoutes::default();
        let direct = DirectRoutes::default();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_event_loop(
            eventloop,
            EventLoopContext {
                events: events.clone(),
                acks: acks.clone(),
                queues: queues.clone(),
                direct: direct.clone(),
                retries: properties.connect_retries,
                cancel: cancel.clone(),
            },
        ));

        *session = Some(MqttSession {
            client,
            acks,
            queues,
            direct,
            events,
            cancel,
            task,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let session = self
            .session
            .lock()
            .await
            .take()
            .ok_or(TransportError::NotConnected)?;

        if let Err(e) = session.client.disconnect().await {
            // event loop already gone, report the close ourselves
            warn!("Disconnect request failed: {}", e);
            session.cancel.cancel();
            let _ = session.events.send(SessionEvent::Disconnected);
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str, key: CorrelationKey) -> Result<(), TransportError> {
        let guard = self.session.lock().await;
        let session = active(&guard)?;
        {
            let mut direct = lock(&session.direct);
            if !direct.iter().any(|(f, _)| f == filter) {
                direct.push((filter.to_string(), TopicMatcher::strict(filter)));
            }
        }
        session
            .subscribe(topic::to_mqtt_filter(filter), QoS::AtMostOnce, Some(key))
            .await
    }

    async fn unsubscribe(&self, filter: &str, key: CorrelationKey) -> Result<(), TransportError> {
        let guard = self.session.lock().await;
        let session = active(&guard)?;
        lock(&session.direct).retain(|(f, _)| f != filter);
        session
            .unsubscribe(topic::to_mqtt_filter(filter), Some(key))
            .await
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let guard = self.session.lock().await;
        let session = active(&guard)?;

        let qos = match message.delivery_mode() {
            DeliveryMode::Direct => QoS::AtMostOnce,
            DeliveryMode::Persistent => QoS::AtLeastOnce,
        };
        if qos == QoS::AtLeastOnce {
            session.expect_ack(AckKind::Publish, message.correlation_key());
        }

        if let Err(e) = session
            .client
            .publish(message.destination(), qos, false, message.payload().to_vec())
            .await
        {
            if qos == QoS::AtLeastOnce {
                session.forget_ack(AckKind::Publish, message.correlation_key());
            }
            return Err(TransportError::Backend(e.to_string()));
        }
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, key: CorrelationKey) -> Result<(), TransportError> {
        let guard = self.session.lock().await;
        let session = active(&guard)?;

        lock(&session.queues).entry(queue.to_string()).or_default();
        let _ = session.events.send(SessionEvent::ConsumerUp {
            key,
            queue: queue.to_string(),
        });
        Ok(())
    }

    async fn unbind_queue(&self, queue: &str) -> Result<(), TransportError> {
        let guard = self.session.lock().await;
        let session = active(&guard)?;

        let filters = lock(&session.queues)
            .remove(queue)
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
        for (filter, _) in filters {
            session
                .unsubscribe(topic::shared_subscription(queue, &filter), None)
                .await?;
        }

        let _ = session.events.send(SessionEvent::ConsumerDown {
            queue: queue.to_string(),
        });
        Ok(())
    }

    async fn add_queue_subscription(
        &self,
        queue: &str,
        filter: &str,
        key: CorrelationKey,
    ) -> Result<(), TransportError> {
        let guard = self.session.lock().await;
        let session = active(&guard)?;

        {
            let mut queues = lock(&session.queues);
            let routes = queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
            if !routes.iter().any(|(f, _)| f == filter) {
                routes.push((filter.to_string(), TopicMatcher::strict(filter)));
            }
        }

        session
            .subscribe(
                topic::shared_subscription(queue, filter),
                QoS::AtLeastOnce,
                Some(key),
            )
            .await
    }

    async fn remove_queue_subscription(
        &self,
        queue: &str,
        filter: &str,
        key: CorrelationKey,
    ) -> Result<(), TransportError> {
        let guard = self.session.lock().await;
        let session = active(&guard)?;

        {
            let mut queues = lock(&session.queues);
            let routes = queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
            routes.retain(|(f, _)| f != filter);
        }

        session
            .unsubscribe(topic::shared_subscription(queue, filter), Some(key))
            .await
    }

    async fn ack(&self, _queue: &str, _delivery_id: u64) -> Result<(), TransportError> {
        // rumqttc acknowledges QoS 1 deliveries itself
        Ok(())
    }
}
