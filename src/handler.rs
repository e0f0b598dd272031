// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handler Trait
//!
//! Application code implements [`ConsumerHandler`] for a decoded payload
//! type. Handlers must be idempotent: delivery is at-least-once, and a crash
//! between handler completion and acknowledgment causes redelivery.

use crate::errors::HandlerError;
use async_trait::async_trait;
use lapin::types::FieldTable;

/// Processes one decoded message.
///
/// Returning `Err` routes the delivery into the retry cycle; once retries
/// are exhausted the error's message text is recorded on the dead-lettered
/// copy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler<T: Send + Sync + 'static>: Send + Sync {
    async fn handle(&self, payload: T, headers: &FieldTable) -> Result<(), HandlerError>;
}
