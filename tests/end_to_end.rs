use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rates_pubsub::config::SubManagerConfig;
use rates_pubsub::transport::BrokerPolicy;
use rates_pubsub::{
    AsyncClient, ClientError, ClientSettings, ConnectionStatus, MemoryBroker, Message,
    MessageCallback, PublishError, SubManResponse, SubscriptionManager,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const URL: &str = "ws://localhost:8008";
const WAIT: Duration = Duration::from_secs(3);

fn settings() -> ClientSettings {
    ClientSettings {
        request_timeout: Duration::from_millis(300),
        ..Default::default()
    }
}

async fn client(broker: &MemoryBroker, name: &str) -> AsyncClient {
    let client = AsyncClient::with_settings(
        Arc::new(broker.transport()),
        ClientSettings {
            client_name: Some(name.to_string()),
            ..settings()
        },
    );
    timeout(WAIT, client.connect(URL, "default", name, ""))
        .await
        .unwrap()
        .unwrap();
    client
}

fn recorder() -> (Arc<Mutex<Vec<String>>>, MessageCallback) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let inner = seen.clone();
    let callback: MessageCallback = Arc::new(move |msg: &Message| {
        inner.lock().unwrap().push(msg.destination().to_string());
    });
    (seen, callback)
}

async fn wait_for_count(seen: &Arc<Mutex<Vec<String>>>, count: usize) {
    timeout(WAIT, async {
        while seen.lock().unwrap().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

async fn start_service(broker: &MemoryBroker) -> (AsyncClient, CancellationToken) {
    let service_client = client(broker, "subman").await;
    let shutdown = CancellationToken::new();
    SubscriptionManager::new(service_client.clone(), SubManagerConfig::default())
        .start(shutdown.clone())
        .await
        .unwrap();
    (service_client, shutdown)
}

#[tokio::test]
async fn subscription_request_grants_rate_topics() {
    let broker = MemoryBroker::new();
    let (_service, shutdown) = start_service(&broker).await;
    let trader = client(&broker, "trader-1").await;

    let (seen, callback) = recorder();
    let text = timeout(
        WAIT,
        trader.send_subscription_request(
            "rates/v1/subman/request/jdoe",
            r#"{"username":"jdoe","clientName":"trader-1"}"#,
            callback,
        ),
    )
    .await
    .unwrap()
    .unwrap();

    let response: SubManResponse = serde_json::from_str(&text).unwrap();
    assert_eq!(response.subscriptions.len(), 3);

    broker.inject(Message::direct("rates/v1/bond/10y", "4.25"));
    broker.inject(Message::direct("rates/v1/fx/eurusd", "1.08"));
    broker.inject(Message::direct("rates/v1/note/2y", "4.61"));

    wait_for_count(&seen, 2).await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["rates/v1/bond/10y".to_string(), "rates/v1/note/2y".to_string()]
    );

    // granted filters are active subscriptions of the trader
    assert!(matches!(
        trader.subscribe("rates/v1/bond/>", Arc::new(|_: &Message| {})).await,
        Err(ClientError::Subscription(_))
    ));
    trader.unsubscribe("rates/v1/bond/>").await.unwrap();

    shutdown.cancel();
}

#[tokio::test]
async fn subscription_request_without_service_times_out() {
    let broker = MemoryBroker::new();
    let trader = client(&broker, "trader-2").await;

    let (_, callback) = recorder();
    let err = trader
        .send_subscription_request("rates/v1/subman/request/jdoe", "{}", callback)
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // the reply inbox is released, so a later request starts clean
    let (_service, shutdown) = start_service(&broker).await;
    let (_, callback) = recorder();
    timeout(
        WAIT,
        trader.send_subscription_request(
            "rates/v1/subman/request/jdoe",
            r#"{"username":"jdoe","clientName":"trader-2"}"#,
            callback,
        ),
    )
    .await
    .unwrap()
    .unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn guaranteed_publish_follows_broker_verdict() {
    let policy = BrokerPolicy {
        denied_topics: vec!["rates/v1/internal/>".to_string()],
        ..Default::default()
    };
    let broker = MemoryBroker::with_policy(policy);
    let publisher = client(&broker, "publisher").await;
    let listener = client(&broker, "listener").await;

    let (seen, callback) = recorder();
    listener.subscribe("rates/*/bill/>", callback).await.unwrap();

    publisher
        .publish_guaranteed_message("rates/v1/bill/3m", "5.12")
        .await
        .unwrap();
    wait_for_count(&seen, 1).await;

    let err = publisher
        .publish_guaranteed_message("rates/v1/internal/audit", "x")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Publish(PublishError::Rejected { .. })
    ));
}

#[tokio::test]
async fn queue_consumer_acknowledges_each_message() {
    let broker = MemoryBroker::new();
    let consumer = client(&broker, "consumer").await;

    assert!(matches!(
        consumer.add_subscription_to_queue("rates/v1/note/>").await,
        Err(ClientError::Consumer(_))
    ));

    let (seen, callback) = recorder();
    consumer
        .consume_from_queue("q.rates.notes", callback.clone())
        .await
        .unwrap();
    // already consuming: warns and keeps the first consumer
    consumer
        .consume_from_queue("q.other", callback)
        .await
        .unwrap();

    consumer
        .add_subscription_to_queue("rates/v1/note/>")
        .await
        .unwrap();

    broker.inject(Message::direct("rates/v1/note/2y", "4.61"));
    broker.inject(Message::direct("rates/v1/bond/10y", "4.25"));
    broker.inject(Message::direct("rates/v1/note/5y", "4.33"));

    wait_for_count(&seen, 2).await;
    timeout(WAIT, async {
        while broker.queue_depth("q.rates.notes") > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(!broker.queue_exists("q.other"));

    consumer
        .remove_subscription_from_queue("rates/v1/note/>")
        .await
        .unwrap();
    consumer.stop_consume_from_queue().await.unwrap();

    broker.inject(Message::direct("rates/v1/note/10y", "4.40"));
    assert_eq!(broker.queue_depth("q.rates.notes"), 0);

    // a new consumer picks up where the last one stopped
    let (_, callback) = recorder();
    consumer
        .consume_from_queue("q.rates.notes", callback)
        .await
        .unwrap();
    consumer.stop_consume_from_queue().await.unwrap();
}

#[tokio::test]
async fn disconnect_resets_status_and_drops_session() {
    let broker = MemoryBroker::new();
    let trader = client(&broker, "trader-3").await;
    let mut status = trader.store().watch_status();
    assert_eq!(*status.borrow_and_update(), ConnectionStatus::Connected);

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    trader
        .subscribe(
            "rates/v1/>",
            Arc::new(move |_: &Message| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

    timeout(WAIT, trader.disconnect()).await.unwrap().unwrap();
    assert_eq!(*status.borrow(), ConnectionStatus::Disconnected);
    assert_eq!(broker.session_count(), 0);

    broker.inject(Message::direct("rates/v1/bond/10y", "4.25"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    trader.publish_direct_message("rates/v1/bond/10y", "4.25").await;
    assert!(trader.unsubscribe("rates/v1/>").await.is_err());
}
