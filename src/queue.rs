// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management
//!
//! Types for defining RabbitMQ queues and the queue triplet naming scheme
//! used by the reliable-delivery topology. For each logical consumer three
//! queues are derived: a main queue, a retry queue holding failed messages
//! for a fixed backoff window, and a terminal dead-letter queue.

/// Definition of a RabbitMQ queue.
///
/// The dead-letter exchange is a weak reference by name; declaring the queue
/// does not declare the exchange it points at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) message_ttl: Option<u32>,
}

impl QueueDefinition {
    /// Creates a new non-durable queue definition with no arguments.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            dead_letter_exchange: None,
            message_ttl: None,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Routes rejected or expired messages to the given exchange.
    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    /// Sets the per-message TTL in milliseconds.
    ///
    /// On the retry queue this TTL is the backoff window: expiry routes the
    /// message through the queue's dead-letter exchange back to the domain
    /// exchange.
    pub fn message_ttl(mut self, ttl_ms: u32) -> Self {
        self.message_ttl = Some(ttl_ms);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A (queue, exchange, routing-key) binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    pub fn new(queue: &str, exchange: &str, routing_key: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }
}

/// The three queues derived for one logical consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTriplet {
    /// Main queue, bound to the domain exchange with business routing keys
    pub main: String,
    /// Retry queue, holds failed messages for the backoff window
    pub retry: String,
    /// Terminal dead-letter queue, never rebound anywhere
    pub dlq: String,
}

impl QueueTriplet {
    /// Queue names for an event consumer: `<name>.events.q`,
    /// `<name>.events.retry.q`, `<name>.events.dlq`.
    pub fn events(logical_name: &str) -> QueueTriplet {
        Self::for_base(&format!("{logical_name}.events"))
    }

    /// Queue names for a command consumer: `<name>.commands.q`,
    /// `<name>.commands.retry.q`, `<name>.commands.dlq`.
    pub fn commands(logical_name: &str) -> QueueTriplet {
        Self::for_base(&format!("{logical_name}.commands"))
    }

    fn for_base(base: &str) -> QueueTriplet {
        QueueTriplet {
            main: format!("{base}.q"),
            retry: format!("{base}.retry.q"),
            dlq: format!("{base}.dlq"),
        }
    }
}

/// Derives the retry queue name for a main queue.
///
/// The consumer needs this to count dead-letter hops through the retry queue
/// when it only knows the queue it is consuming from.
pub(crate) fn retry_queue_name(main_queue: &str) -> String {
    match main_queue.strip_suffix(".q") {
        Some(base) => format!("{base}.retry.q"),
        None => format!("{main_queue}.retry.q"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triplet_names_for_events_consumer() {
        let triplet = QueueTriplet::events("billing");

        assert_eq!(triplet.main, "billing.events.q");
        assert_eq!(triplet.retry, "billing.events.retry.q");
        assert_eq!(triplet.dlq, "billing.events.dlq");
    }

    #[test]
    fn triplet_names_for_commands_consumer() {
        let triplet = QueueTriplet::commands("billing");

        assert_eq!(triplet.main, "billing.commands.q");
        assert_eq!(triplet.retry, "billing.commands.retry.q");
        assert_eq!(triplet.dlq, "billing.commands.dlq");
    }

    #[test]
    fn retry_name_is_derived_from_main_queue() {
        assert_eq!(
            retry_queue_name("billing.events.q"),
            "billing.events.retry.q"
        );
        assert_eq!(retry_queue_name("ad-hoc"), "ad-hoc.retry.q");
    }

    #[test]
    fn queue_definition_builder() {
        let def = QueueDefinition::new("billing.events.retry.q")
            .durable()
            .dead_letter_exchange("domain.events")
            .message_ttl(30_000);

        assert!(def.durable);
        assert_eq!(def.dead_letter_exchange.as_deref(), Some("domain.events"));
        assert_eq!(def.message_ttl, Some(30_000));
    }
}
