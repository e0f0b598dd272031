// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Per-Delivery Retry State Machine
//!
//! Every delivery takes exactly one terminal action:
//!
//! - handler success: ack
//! - failure with retries left: nack without requeue, which routes the
//!   message through the main queue's dead-letter exchange into the retry
//!   queue; the retry TTL then redelivers it to the main queue
//! - failure with retries exhausted: publish an annotated copy to the `dlx`
//!   exchange under the `dead` key, then ack the original so it leaves the
//!   main queue without another retry cycle
//!
//! Decode and handler failures are contained here and never escape the
//! consumer loop. Only ack/nack/publish channel failures propagate, and those
//! are fatal to the subscription.

use crate::{
    dispatcher::ConsumeOptions,
    errors::{AmqpError, ConsumeError},
    handler::ConsumerHandler,
    publisher::JSON_CONTENT_TYPE,
    topology::{DEAD_ROUTING_KEY, DLX_EXCHANGE},
};
use async_trait::async_trait;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel,
};
use serde::de::DeserializeOwned;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, warn};

/// Header carrying the broker's dead-letter audit trail
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Count field inside an x-death record
pub const AMQP_HEADERS_COUNT: &str = "count";
/// Queue field inside an x-death record
pub const AMQP_HEADERS_QUEUE: &str = "queue";
/// Header added to a dead-lettered copy with the triggering error text
pub const AMQP_HEADERS_ERROR: &str = "error";

/// Type-erased delivery processing: decode the raw body, then run the
/// application handler.
#[async_trait]
pub(crate) trait DeliveryHandler: Send + Sync {
    async fn run(&self, body: &[u8], headers: &FieldTable) -> Result<(), ConsumeError>;
}

/// Adapts a typed [`ConsumerHandler`] to raw deliveries by decoding the body
/// as JSON. A malformed body is a [`ConsumeError::Decode`], handled exactly
/// like a handler failure.
pub(crate) struct TypedJsonHandler<T> {
    inner: Arc<dyn ConsumerHandler<T>>,
}

impl<T> TypedJsonHandler<T> {
    pub(crate) fn new(inner: Arc<dyn ConsumerHandler<T>>) -> TypedJsonHandler<T> {
        TypedJsonHandler { inner }
    }
}

#[async_trait]
impl<T> DeliveryHandler for TypedJsonHandler<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    async fn run(&self, body: &[u8], headers: &FieldTable) -> Result<(), ConsumeError> {
        let payload =
            serde_json::from_slice::<T>(body).map_err(|e| ConsumeError::Decode(e.to_string()))?;

        self.inner
            .handle(payload, headers)
            .await
            .map_err(ConsumeError::from)
    }
}

/// Processes one delivery through the retry state machine.
///
/// `retry_queue` is the name of the retry queue paired with the consumed
/// queue; it selects the x-death record that carries the redelivery count.
pub(crate) async fn consume(
    delivery: &Delivery,
    handler: &dyn DeliveryHandler,
    channel: &Channel,
    opts: &ConsumeOptions,
    retry_queue: &str,
) -> Result<(), AmqpError> {
    let headers = match delivery.properties.headers() {
        Some(val) => val.to_owned(),
        None => FieldTable::default(),
    };

    debug!(
        "received message - exchange: {} key: {}",
        delivery.exchange, delivery.routing_key
    );

    let result = handler.run(&delivery.data, &headers).await;
    let failure = match result {
        Ok(()) => {
            debug!("message successfully processed");
            return match delivery.ack(BasicAckOptions { multiple: false }).await {
                Err(err) => {
                    error!(error = err.to_string(), "error whiling ack msg");
                    Err(AmqpError::AckMessageError)
                }
                _ => Ok(()),
            };
        }
        Err(err) => err,
    };

    let count = retry_count(&headers, retry_queue);

    if count < opts.max_retries as i64 {
        warn!(
            error = failure.to_string(),
            attempts = count,
            "error whiling handling msg, requeuing for latter"
        );
        return match delivery
            .nack(BasicNackOptions {
                multiple: false,
                requeue: false,
            })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling requeuing");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        };
    }

    // The dead-lettered copy is a distinct, explicitly routed message; acking
    // the original afterwards removes it from the main queue without another
    // retry cycle.
    error!(
        error = failure.to_string(),
        attempts = count,
        "too many attempts, sending to dlx"
    );

    match channel
        .basic_publish(
            DLX_EXCHANGE,
            DEAD_ROUTING_KEY,
            BasicPublishOptions::default(),
            &delivery.data,
            dead_letter_properties(&delivery.properties, &failure.to_string()),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error whiling sending to dlx");
            Err(AmqpError::PublishingToDlxError)
        }
        _ => match delivery.ack(BasicAckOptions { multiple: false }).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    "error whiling ack msg after dead-lettering"
                );
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        },
    }
}

/// Reads the redelivery count from the x-death header: the count field of
/// the record whose queue matches the retry queue, `0` if absent.
fn retry_count(headers: &FieldTable, retry_queue: &str) -> i64 {
    let deaths = match headers.inner().get(AMQP_HEADERS_X_DEATH) {
        Some(AMQPValue::FieldArray(arr)) => arr,
        _ => return 0,
    };

    for entry in deaths.as_slice() {
        let Some(table) = entry.as_field_table() else {
            continue;
        };

        let matches = table
            .inner()
            .get(AMQP_HEADERS_QUEUE)
            .and_then(amqp_string)
            .map(|queue| queue == retry_queue)
            .unwrap_or(false);

        if matches {
            return table
                .inner()
                .get(AMQP_HEADERS_COUNT)
                .and_then(AMQPValue::as_long_long_int)
                .unwrap_or(0);
        }
    }

    0
}

/// Builds the properties for the terminal dead-lettered copy: original
/// headers plus the `error` annotation, original content type, persistent.
fn dead_letter_properties(original: &BasicProperties, error: &str) -> BasicProperties {
    let mut headers = match original.headers() {
        Some(table) => table.inner().clone(),
        None => BTreeMap::new(),
    };

    headers.insert(
        ShortString::from(AMQP_HEADERS_ERROR),
        AMQPValue::LongString(LongString::from(error)),
    );

    let content_type = original
        .content_type()
        .clone()
        .unwrap_or_else(|| ShortString::from(JSON_CONTENT_TYPE));

    BasicProperties::default()
        .with_content_type(content_type)
        .with_delivery_mode(2)
        .with_headers(FieldTable::from(headers))
}

fn amqp_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_owned()),
        _ => None,
    }
}
