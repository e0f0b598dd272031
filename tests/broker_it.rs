//! Integration scenarios against a live RabbitMQ broker.
//!
//! These tests are ignored by default; run them with a local broker:
//! `cargo test -- --ignored`.

use async_trait::async_trait;
use lapin::types::FieldTable;
use rabbitmq_retry::{
    channel::new_amqp_channel,
    config::AmqpConfig,
    dispatcher::{ConsumeOptions, Dispatcher},
    errors::HandlerError,
    handler::ConsumerHandler,
    publisher::{PublishOptions, Publisher},
    topology::{AmqpTopology, DOMAIN_EVENTS_EXCHANGE},
};
use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::oneshot;

struct NotifyOnce {
    tx: Mutex<Option<oneshot::Sender<Value>>>,
}

#[async_trait]
impl ConsumerHandler<Value> for NotifyOnce {
    async fn handle(&self, payload: Value, _headers: &FieldTable) -> Result<(), HandlerError> {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(payload);
        }
        Ok(())
    }
}

struct FailNTimes {
    failures: u32,
    calls: Arc<AtomicU32>,
    tx: Mutex<Option<oneshot::Sender<()>>>,
}

#[async_trait]
impl ConsumerHandler<Value> for FailNTimes {
    async fn handle(&self, _payload: Value, _headers: &FieldTable) -> Result<(), HandlerError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(HandlerError::new("transient failure"));
        }
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        Ok(())
    }
}

struct AlwaysFail;

#[async_trait]
impl ConsumerHandler<Value> for AlwaysFail {
    async fn handle(&self, _payload: Value, _headers: &FieldTable) -> Result<(), HandlerError> {
        Err(HandlerError::new("permanent failure"))
    }
}

struct CaptureHeaders {
    tx: Mutex<Option<oneshot::Sender<FieldTable>>>,
}

#[async_trait]
impl ConsumerHandler<Value> for CaptureHeaders {
    async fn handle(&self, _payload: Value, headers: &FieldTable) -> Result<(), HandlerError> {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(headers.clone());
        }
        Ok(())
    }
}

#[tokio::test]
#[ignore]
async fn declaring_topology_twice_is_idempotent() {
    let cfg = AmqpConfig::load().unwrap();
    let (_conn, channel) = new_amqp_channel(&cfg).await.unwrap();
    let topology = AmqpTopology::new(channel);

    topology.declare_domain_infra(&["it"]).await.unwrap();
    topology.declare_domain_infra(&["it"]).await.unwrap();

    let first = topology
        .declare_consumer_queues("it-idem", &["it.idem.#"], 1_000)
        .await
        .unwrap();
    let second = topology
        .declare_consumer_queues("it-idem", &["it.idem.#"], 1_000)
        .await
        .unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
#[ignore]
async fn publish_and_receive_round_trip() {
    let cfg = AmqpConfig::load().unwrap();
    let (_conn, channel) = new_amqp_channel(&cfg).await.unwrap();

    let topology = AmqpTopology::new(channel.clone());
    topology.declare_domain_infra(&[]).await.unwrap();
    let triplet = topology
        .declare_consumer_queues("it-roundtrip", &["it.roundtrip.#"], 1_000)
        .await
        .unwrap();

    let (tx, rx) = oneshot::channel();
    let handler = Arc::new(NotifyOnce {
        tx: Mutex::new(Some(tx)),
    });

    let dispatcher = Dispatcher::new(channel.clone()).register(
        &triplet.main,
        handler as Arc<dyn ConsumerHandler<Value>>,
        ConsumeOptions::default(),
    );
    let _subscriptions = dispatcher.spawn_consumers().await.unwrap();

    let publisher = Publisher::new(channel).await.unwrap();
    publisher
        .publish(
            DOMAIN_EVENTS_EXCHANGE,
            "it.roundtrip.created.v1",
            &json!({"eventId": "e1", "ok": true}),
            &PublishOptions::default(),
        )
        .await
        .unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload["eventId"], "e1");
}

#[tokio::test]
#[ignore]
async fn failing_twice_then_succeeding_invokes_handler_three_times() {
    let cfg = AmqpConfig::load().unwrap();
    let (_conn, channel) = new_amqp_channel(&cfg).await.unwrap();

    let topology = AmqpTopology::new(channel.clone());
    topology.declare_domain_infra(&[]).await.unwrap();
    let triplet = topology
        .declare_consumer_queues("it-flaky", &["it.flaky.#"], 500)
        .await
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let (tx, rx) = oneshot::channel();
    let handler = Arc::new(FailNTimes {
        failures: 2,
        calls: calls.clone(),
        tx: Mutex::new(Some(tx)),
    });

    let dispatcher = Dispatcher::new(channel.clone()).register(
        &triplet.main,
        handler as Arc<dyn ConsumerHandler<Value>>,
        ConsumeOptions {
            prefetch: 10,
            max_retries: 5,
        },
    );
    let _subscriptions = dispatcher.spawn_consumers().await.unwrap();

    let publisher = Publisher::new(channel).await.unwrap();
    publisher
        .publish(
            DOMAIN_EVENTS_EXCHANGE,
            "it.flaky.created.v1",
            &json!({"eventId": "e-flaky"}),
            &PublishOptions::default(),
        )
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
#[ignore]
async fn exhausted_retries_land_in_dlq_with_error_header() {
    let cfg = AmqpConfig::load().unwrap();
    let (_conn, channel) = new_amqp_channel(&cfg).await.unwrap();

    let topology = AmqpTopology::new(channel.clone());
    topology.declare_domain_infra(&[]).await.unwrap();
    let triplet = topology
        .declare_consumer_queues("it-dead", &["it.dead.#"], 500)
        .await
        .unwrap();

    let (tx, rx) = oneshot::channel();
    let capture = Arc::new(CaptureHeaders {
        tx: Mutex::new(Some(tx)),
    });

    let dispatcher = Dispatcher::new(channel.clone())
        .register(
            &triplet.main,
            Arc::new(AlwaysFail) as Arc<dyn ConsumerHandler<Value>>,
            ConsumeOptions {
                prefetch: 10,
                max_retries: 2,
            },
        )
        .register(
            &triplet.dlq,
            capture as Arc<dyn ConsumerHandler<Value>>,
            ConsumeOptions::default(),
        );
    let _subscriptions = dispatcher.spawn_consumers().await.unwrap();

    let publisher = Publisher::new(channel).await.unwrap();
    publisher
        .publish(
            DOMAIN_EVENTS_EXCHANGE,
            "it.dead.created.v1",
            &json!({"eventId": "e-dead"}),
            &PublishOptions::default(),
        )
        .await
        .unwrap();

    let headers = tokio::time::timeout(Duration::from_secs(15), rx)
        .await
        .unwrap()
        .unwrap();

    let error = headers.inner().get("error").unwrap();
    assert_eq!(
        error
            .as_long_string()
            .map(|s| String::from_utf8_lossy(s.as_bytes()).into_owned()),
        Some("permanent failure".to_owned())
    );

    // At dead-letter time the message has been through the retry queue once
    // per allowed attempt.
    assert_eq!(x_death_count(&headers, &triplet.retry), Some(2));
}

/// Count field of the x-death record for the given queue, as carried on the
/// dead-lettered copy.
fn x_death_count(headers: &FieldTable, queue: &str) -> Option<i64> {
    headers
        .inner()
        .get("x-death")?
        .as_array()?
        .as_slice()
        .iter()
        .filter_map(|entry| entry.as_field_table())
        .find(|record| {
            record
                .inner()
                .get("queue")
                .and_then(|q| q.as_long_string())
                .map(|q| q.as_bytes() == queue.as_bytes())
                .unwrap_or(false)
        })?
        .inner()
        .get("count")?
        .as_long_long_int()
}
