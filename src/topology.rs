// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! Idempotent declaration of the exchanges, queues and bindings that
//! implement reliable delivery with broker-native primitives only. Failed
//! messages are dead-lettered from the main queue to the `retry` exchange,
//! sit in the retry queue until its message TTL expires, and are then
//! dead-lettered back to the domain exchange for redelivery. Messages that
//! exhaust their retries are explicitly re-published to the `dlx` exchange.
//!
//! Declaration errors indicate topology drift (parameter mismatch against a
//! pre-existing resource) and are fatal: they abort startup instead of being
//! retried.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueTriplet},
};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongString, LongUInt, ShortString},
    Channel,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Durable topic exchange carrying business events
pub const DOMAIN_EVENTS_EXCHANGE: &str = "domain.events";
/// Durable topic exchange routing failed messages into retry queues
pub const RETRY_EXCHANGE: &str = "retry";
/// Durable topic exchange acting as the terminal dead-letter sink
pub const DLX_EXCHANGE: &str = "dlx";
/// Fixed routing key under which dead-lettered messages are published
pub const DEAD_ROUTING_KEY: &str = "dead";
/// Default backoff window for the retry queue TTL
pub const DEFAULT_RETRY_WINDOW_MS: u32 = 30_000;

/// Header field selecting a queue's dead-letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Header field setting a queue's per-message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Name of the direct exchange carrying commands for a service.
pub fn commands_exchange(name: &str) -> String {
    format!("{name}.commands")
}

/// Declares the reliable-delivery topology on a caller-supplied channel.
///
/// The channel is borrowed, never closed. All declarations use consistent
/// parameters so repeated calls are no-ops on the broker.
pub struct AmqpTopology {
    channel: Arc<Channel>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<Channel>) -> AmqpTopology {
        AmqpTopology { channel }
    }

    /// Declares the shared domain infrastructure: the `domain.events`,
    /// `retry` and `dlx` topic exchanges plus one direct `<name>.commands`
    /// exchange per entry in `command_exchange_names`.
    ///
    /// Fails with [`AmqpError::InfraDeclarationError`] if the broker rejects
    /// any declaration. This is fatal and must abort startup.
    pub async fn declare_domain_infra(
        &self,
        command_exchange_names: &[&str],
    ) -> Result<(), AmqpError> {
        for def in infra_exchanges(command_exchange_names) {
            self.declare_exchange(&def).await?;
        }

        Ok(())
    }

    /// Declares and binds the queue triplet for an event consumer with the
    /// default 30 second retry window ([`DEFAULT_RETRY_WINDOW_MS`]).
    pub async fn declare_consumer_queues_default(
        &self,
        logical_name: &str,
        routing_keys: &[&str],
    ) -> Result<QueueTriplet, AmqpError> {
        self.declare_consumer_queues(logical_name, routing_keys, DEFAULT_RETRY_WINDOW_MS)
            .await
    }

    /// Declares and binds the queue triplet for an event consumer.
    ///
    /// `retry_window_ms` is the retry queue's message TTL and the sole
    /// backoff control: every retry waits the same fixed window
    /// ([`DEFAULT_RETRY_WINDOW_MS`] unless the caller tunes it). Idempotent
    /// under repeated calls with identical arguments.
    pub async fn declare_consumer_queues(
        &self,
        logical_name: &str,
        routing_keys: &[&str],
        retry_window_ms: u32,
    ) -> Result<QueueTriplet, AmqpError> {
        self.declare_triplet(QueueTriplet::events(logical_name), routing_keys, retry_window_ms)
            .await
    }

    /// Declares and binds the queue triplet for a command consumer.
    ///
    /// Same binding graph as [`declare_consumer_queues`], `.commands.*`
    /// queue names.
    ///
    /// [`declare_consumer_queues`]: AmqpTopology::declare_consumer_queues
    pub async fn declare_command_consumer_queues(
        &self,
        logical_name: &str,
        routing_keys: &[&str],
        retry_window_ms: u32,
    ) -> Result<QueueTriplet, AmqpError> {
        self.declare_triplet(QueueTriplet::commands(logical_name), routing_keys, retry_window_ms)
            .await
    }

    async fn declare_triplet(
        &self,
        triplet: QueueTriplet,
        routing_keys: &[&str],
        retry_window_ms: u32,
    ) -> Result<QueueTriplet, AmqpError> {
        for def in triplet_queues(&triplet, retry_window_ms) {
            self.declare_queue(&def).await?;
        }

        for binding in triplet_bindings(&triplet, routing_keys) {
            self.bind_queue(&binding).await?;
        }

        Ok(triplet)
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::InfraDeclarationError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        let mut queue_args = BTreeMap::new();

        if let Some(dlx) = &def.dead_letter_exchange {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(dlx.clone())),
            );
        }

        if let Some(ttl) = def.message_ttl {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongUInt(LongUInt::from(ttl)),
            );
        }

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::from(queue_args),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the queue"
                );
                Err(AmqpError::InfraDeclarationError(def.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::InfraDeclarationError(binding.queue_name.clone()))
            }
            _ => Ok(()),
        }
    }
}

/// Exchange set for the shared domain infrastructure.
fn infra_exchanges(command_exchange_names: &[&str]) -> Vec<ExchangeDefinition> {
    let mut exchanges = vec![
        ExchangeDefinition::new(DOMAIN_EVENTS_EXCHANGE).topic().durable(),
        ExchangeDefinition::new(RETRY_EXCHANGE).topic().durable(),
        ExchangeDefinition::new(DLX_EXCHANGE).topic().durable(),
    ];

    for name in command_exchange_names {
        exchanges.push(ExchangeDefinition::new(&commands_exchange(name)).direct().durable());
    }

    exchanges
}

/// Queue definitions for one consumer triplet.
///
/// The main queue dead-letters to the retry exchange; the retry queue holds
/// messages for `retry_window_ms` and dead-letters them back to the domain
/// exchange; the dead-letter queue has no arguments and is terminal.
fn triplet_queues(triplet: &QueueTriplet, retry_window_ms: u32) -> [QueueDefinition; 3] {
    [
        QueueDefinition::new(&triplet.main)
            .durable()
            .dead_letter_exchange(RETRY_EXCHANGE),
        QueueDefinition::new(&triplet.retry)
            .durable()
            .dead_letter_exchange(DOMAIN_EVENTS_EXCHANGE)
            .message_ttl(retry_window_ms),
        QueueDefinition::new(&triplet.dlq).durable(),
    ]
}

/// Bindings for one consumer triplet: main and retry under every business
/// routing key, the dead-letter queue under the fixed `dead` key.
fn triplet_bindings(triplet: &QueueTriplet, routing_keys: &[&str]) -> Vec<QueueBinding> {
    let mut bindings = Vec::with_capacity(routing_keys.len() * 2 + 1);

    for key in routing_keys {
        bindings.push(QueueBinding::new(&triplet.main, DOMAIN_EVENTS_EXCHANGE, key));
        bindings.push(QueueBinding::new(&triplet.retry, RETRY_EXCHANGE, key));
    }

    bindings.push(QueueBinding::new(&triplet.dlq, DLX_EXCHANGE, DEAD_ROUTING_KEY));

    bindings
}
