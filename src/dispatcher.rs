// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! This module wires registered handlers to queue subscriptions. Each
//! registration gets its own consumer loop: the prefetch window is set once
//! before the first delivery, a consumer is created with a unique tag, and
//! every delivery is driven through the retry state machine in
//! [`crate::consumer`].
//!
//! Message-level failures are contained per delivery. A failed delivery
//! stream or a failed ack/nack tears the subscription down and the error is
//! surfaced so the owner of the channel can reconnect and re-subscribe.

use crate::{
    consumer::{consume, DeliveryHandler, TypedJsonHandler},
    errors::AmqpError,
    handler::ConsumerHandler,
    queue::retry_queue_name,
};
use futures_util::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel,
};
use serde::de::DeserializeOwned;
use std::{collections::HashMap, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Per-subscription consumption parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Maximum unacknowledged deliveries held concurrently
    pub prefetch: u16,
    /// Retry attempts before a message is dead-lettered
    pub max_retries: u32,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        ConsumeOptions {
            prefetch: 10,
            max_retries: 5,
        }
    }
}

struct Registration {
    handler: Arc<dyn DeliveryHandler>,
    opts: ConsumeOptions,
}

/// Active subscription handle for one queue.
///
/// The subscription ends when the channel closes or a channel-level error
/// occurs; in-flight handler invocations are not interrupted.
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    task: JoinHandle<Result<(), AmqpError>>,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Waits for the subscription to end, surfacing channel-level errors.
    pub async fn join(self) -> Result<(), AmqpError> {
        match self.task.await {
            Ok(result) => result,
            Err(_) => Err(AmqpError::SubscriptionError(self.queue)),
        }
    }
}

/// Registers typed handlers on queues and runs their consumer loops on a
/// caller-supplied channel. The channel is borrowed, never closed.
pub struct Dispatcher {
    channel: Arc<Channel>,
    registrations: HashMap<String, Registration>,
}

impl Dispatcher {
    pub fn new(channel: Arc<Channel>) -> Dispatcher {
        Dispatcher {
            channel,
            registrations: HashMap::default(),
        }
    }

    /// Registers a handler for one queue.
    ///
    /// Delivery bodies are decoded as JSON into `T` before the handler runs;
    /// a body that fails to decode follows the same retry path as a handler
    /// failure.
    ///
    /// A queue holds at most one registration: registering the same queue
    /// again replaces the earlier handler (last wins).
    pub fn register<T>(
        mut self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler<T>>,
        opts: ConsumeOptions,
    ) -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        insert_registration(
            &mut self.registrations,
            queue,
            Registration {
                handler: Arc::new(TypedJsonHandler::new(handler)),
                opts,
            },
        );
        self
    }

    /// Starts one consumer task per registered queue.
    ///
    /// The prefetch window is configured before the consumer is created so
    /// it bounds the very first deliveries.
    pub async fn spawn_consumers(&self) -> Result<Vec<Subscription>, AmqpError> {
        let mut subscriptions = Vec::with_capacity(self.registrations.len());

        for (queue, registration) in &self.registrations {
            if let Err(err) = self
                .channel
                .basic_qos(
                    registration.opts.prefetch,
                    BasicQosOptions { global: false },
                )
                .await
            {
                error!(error = err.to_string(), queue = queue.as_str(), "failure to configure qos");
                return Err(AmqpError::QosDeclarationError(queue.clone()));
            }

            let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());

            let consumer = match self
                .channel
                .basic_consume(
                    queue,
                    &consumer_tag,
                    BasicConsumeOptions {
                        no_local: false,
                        no_ack: false,
                        exclusive: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
            {
                Ok(consumer) => consumer,
                Err(err) => {
                    error!(error = err.to_string(), queue = queue.as_str(), "error to create the consumer");
                    return Err(AmqpError::CreateConsumerError(queue.clone()));
                }
            };

            debug!(queue = queue.as_str(), consumer_tag = consumer_tag.as_str(), "consumer created");

            let handler = registration.handler.clone();
            let opts = registration.opts;
            let channel = self.channel.clone();
            let retry_queue = retry_queue_name(queue);
            let task_queue = queue.clone();

            let task = tokio::spawn(async move {
                let mut consumer = consumer;
                while let Some(result) = consumer.next().await {
                    match result {
                        Ok(delivery) => {
                            consume(&delivery, handler.as_ref(), &channel, &opts, &retry_queue)
                                .await?;
                        }
                        Err(err) => {
                            error!(
                                error = err.to_string(),
                                queue = task_queue.as_str(),
                                "consumer stream failed"
                            );
                            return Err(AmqpError::SubscriptionError(task_queue));
                        }
                    }
                }

                debug!(queue = task_queue.as_str(), "consumer stream ended");
                Ok(())
            });

            subscriptions.push(Subscription {
                queue: queue.clone(),
                consumer_tag,
                task,
            });
        }

        Ok(subscriptions)
    }

    /// Consumes from every registered queue until all subscriptions end.
    pub async fn consume_blocking(&self) -> Result<(), AmqpError> {
        let subscriptions = self.spawn_consumers().await?;

        for subscription in subscriptions {
            subscription.join().await?;
        }

        Ok(())
    }
}

fn insert_registration(
    registrations: &mut HashMap<String, Registration>,
    queue: &str,
    registration: Registration,
) {
    if registrations
        .insert(queue.to_owned(), registration)
        .is_some()
    {
        warn!(queue, "replacing existing handler registration");
    }
}
