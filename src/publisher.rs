// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Backpressure-Aware Publisher
//!
//! Serializes a message to JSON and publishes it to an exchange. The channel
//! is put in publisher-confirm mode, and `publish` waits for the broker's
//! confirmation before returning: a slow broker connection suspends the
//! caller instead of letting outbound messages buffer without bound, so
//! high-volume producers must expect this backpressure to propagate
//! upstream.

use crate::errors::AmqpError;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel,
};
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::error;

/// Default content type for published messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Field-by-field overrides for the publisher's default message properties.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub content_type: Option<String>,
    pub persistent: Option<bool>,
    pub message_id: Option<String>,
    /// Send timestamp in milliseconds since the epoch
    pub timestamp: Option<u64>,
    pub headers: Option<BTreeMap<ShortString, AMQPValue>>,
}

/// Publishes JSON messages on a caller-supplied channel.
///
/// The channel is borrowed, never closed; creating the publisher enables
/// publisher confirms on it.
pub struct Publisher {
    channel: Arc<Channel>,
}

impl Publisher {
    /// Creates a publisher and puts the channel in confirm mode.
    pub async fn new(channel: Arc<Channel>) -> Result<Arc<Publisher>, AmqpError> {
        match channel.confirm_select(ConfirmSelectOptions::default()).await {
            Ok(()) => Ok(Arc::new(Publisher { channel })),
            Err(err) => {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                Err(AmqpError::ChannelError)
            }
        }
    }

    /// Publishes `message` to `exchange` under `routing_key`.
    ///
    /// Defaults: `application/json` content type, persistent delivery, send
    /// timestamp in milliseconds, and a message id taken from the payload's
    /// `eventId` or `commandId` field when one is present. `opts` overrides
    /// any of these.
    ///
    /// The call resolves only once the broker has confirmed the publish; a
    /// negative confirmation is [`AmqpError::PublishNotConfirmedError`] and
    /// the message must be considered not delivered.
    pub async fn publish<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        opts: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let payload = match serde_json::to_value(message) {
            Ok(value) => value,
            Err(err) => {
                error!(error = err.to_string(), "failure to serialize payload");
                return Err(AmqpError::SerializePayloadError);
            }
        };
        let body = serde_json::to_vec(&payload).map_err(|_| AmqpError::SerializePayloadError)?;

        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &body,
                build_properties(&payload, opts),
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                return Err(AmqpError::PublishingError(exchange.to_owned()));
            }
        };

        // Suspends until the broker drains and confirms the publish.
        match confirm.await {
            Ok(confirmation) if confirmation.is_nack() => {
                error!(exchange, routing_key, "publish negatively confirmed");
                Err(AmqpError::PublishNotConfirmedError)
            }
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error awaiting publish confirmation");
                Err(AmqpError::PublishingError(exchange.to_owned()))
            }
        }
    }
}

/// Assembles the message properties from publisher defaults and caller
/// overrides.
fn build_properties(payload: &Value, opts: &PublishOptions) -> BasicProperties {
    let content_type = opts
        .content_type
        .clone()
        .unwrap_or_else(|| JSON_CONTENT_TYPE.to_owned());
    let persistent = opts.persistent.unwrap_or(true);
    let timestamp = opts.timestamp.unwrap_or_else(now_millis);

    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from(content_type))
        .with_delivery_mode(if persistent { 2 } else { 1 })
        .with_timestamp(timestamp);

    if let Some(id) = opts.message_id.clone().or_else(|| message_id_of(payload)) {
        properties = properties.with_message_id(ShortString::from(id));
    }

    if let Some(headers) = &opts.headers {
        properties = properties.with_headers(FieldTable::from(headers.clone()));
    }

    properties
}

/// Message id from the payload's own identity field, when it carries one.
fn message_id_of(payload: &Value) -> Option<String> {
    payload
        .get("eventId")
        .or_else(|| payload.get("commandId"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_persistent_json_with_timestamp() {
        let props = build_properties(&json!({"n": 1}), &PublishOptions::default());

        assert_eq!(
            props.content_type().as_ref().map(|c| c.as_str()),
            Some(JSON_CONTENT_TYPE)
        );
        assert_eq!(props.delivery_mode(), &Some(2));
        assert!(props.timestamp().is_some());
        assert_eq!(props.message_id(), &None);
    }

    #[test]
    fn message_id_comes_from_event_id() {
        let props = build_properties(
            &json!({"eventId": "e1", "name": "subEvent.created"}),
            &PublishOptions::default(),
        );

        assert_eq!(props.message_id().as_ref().map(|m| m.as_str()), Some("e1"));
    }

    #[test]
    fn message_id_falls_back_to_command_id() {
        let props = build_properties(&json!({"commandId": "c9"}), &PublishOptions::default());

        assert_eq!(props.message_id().as_ref().map(|m| m.as_str()), Some("c9"));
    }

    #[test]
    fn options_override_defaults_field_by_field() {
        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from("traceId"),
            AMQPValue::LongString("t-1".into()),
        );

        let opts = PublishOptions {
            content_type: Some("text/plain".to_owned()),
            persistent: Some(false),
            message_id: Some("override".to_owned()),
            timestamp: Some(42),
            headers: Some(headers),
        };

        let props = build_properties(&json!({"eventId": "ignored"}), &opts);

        assert_eq!(
            props.content_type().as_ref().map(|c| c.as_str()),
            Some("text/plain")
        );
        assert_eq!(props.delivery_mode(), &Some(1));
        assert_eq!(props.timestamp(), &Some(42));
        assert_eq!(
            props.message_id().as_ref().map(|m| m.as_str()),
            Some("override")
        );
        assert!(props.headers().is_some());
    }
}
