// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Reliable Delivery Layer
//!
//! This module defines the error taxonomy for the crate. `AmqpError` covers
//! channel-level and topology-level failures, which are fatal to the operation
//! that raised them. Message-level failures (payload decoding, handler logic)
//! are represented by `ConsumeError` and are always recovered locally by the
//! retry state machine: they never escape a consumer loop.

use thiserror::Error;

/// Represents channel- and topology-level errors.
///
/// Every variant here is fatal to the operation that produced it: a topology
/// declaration error must abort startup, and an ack/nack/consume error must
/// tear down the affected subscription so the caller can reconnect and
/// re-subscribe.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Error loading the broker configuration from the environment
    #[error("failure to load configuration")]
    ConfigurationError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The broker rejected an exchange, queue or binding declaration. This
    /// indicates topology drift (e.g. parameter mismatch against an existing
    /// resource) and must not be retried silently.
    #[error("failure to declare infrastructure `{0}`")]
    InfraDeclarationError(String),

    /// Error configuring the consumer prefetch window
    #[error("failure to configure qos on queue `{0}`")]
    QosDeclarationError(String),

    /// Error creating a consumer on the given queue
    #[error("failure to create consumer on queue `{0}`")]
    CreateConsumerError(String),

    /// The consumer delivery stream failed at the channel level
    #[error("subscription on queue `{0}` failed")]
    SubscriptionError(String),

    /// Error acknowledging a delivery
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a delivery
    #[error("failure to nack message")]
    NackMessageError,

    /// Error serializing an outbound payload to JSON
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error publishing a message to the given exchange
    #[error("failure to publish to exchange `{0}`")]
    PublishingError(String),

    /// The broker negatively confirmed a publish
    #[error("publish was not confirmed by the broker")]
    PublishNotConfirmedError,

    /// Error publishing the terminal copy of a message to the dead-letter
    /// exchange
    #[error("failure to publish to dlx")]
    PublishingToDlxError,
}

/// Error returned by an application message handler.
///
/// The message text is what ends up in the `error` header of a dead-lettered
/// message once retries are exhausted, so handlers should make it descriptive.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError(message.into())
    }
}

/// Message-level failure raised while processing a single delivery.
///
/// Both variants take the same path through the retry state machine: a
/// malformed payload is not treated differently from a handler failure.
#[derive(Error, Debug, PartialEq, Eq)]
pub(crate) enum ConsumeError {
    /// The delivery body was not valid JSON for the expected payload type
    #[error("{0}")]
    Decode(String),

    /// The handler reported a failure
    #[error("{0}")]
    Handler(String),
}

impl From<HandlerError> for ConsumeError {
    fn from(err: HandlerError) -> Self {
        ConsumeError::Handler(err.0)
    }
}
