// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides types for defining RabbitMQ queues and their bindings.
//! It includes support for Dead Letter Queues (DLQ) and retry queues, which are
//! essential for robust message handling in distributed systems.

use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure queue definitions.
/// It supports standard queue options as well as advanced features like message TTL,
/// max length, Dead Letter Queues (DLQ), and retry queues.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dlq_name: Option<String>,
    pub(crate) retry_name: Option<String>,
    pub(crate) retry_ttl: Option<i32>,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is durable, non-exclusive and never auto-deleted.
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// A new queue definition with default settings
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            ..QueueDefinition::default()
        }
    }

    /// The queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the queue transient, removed on broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes, so they must be
    /// redeclared after every reconnect.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Makes the queue passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets no_wait flag, making the operation non-blocking.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue.
    ///
    /// # Parameters
    /// * `ttl` - TTL in milliseconds
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a free-form queue argument.
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }

    /// Adds a Dead Letter Queue (DLQ) to the queue.
    ///
    /// The DLQ will receive messages that are rejected, expired, or overflow
    /// from the main queue. The DLQ name will be the main queue name with "-dlq" suffix.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Adds a retry queue to the queue.
    ///
    /// Messages rejected without requeue are dead-lettered into the retry queue and
    /// routed back to the main queue once `ttl` milliseconds have elapsed. The retry
    /// queue name will be the main queue name with "-retry" suffix.
    pub fn with_retry(mut self, ttl: i32) -> Self {
        self.retry_name = Some(format!("{}-retry", self.name));
        self.retry_ttl = Some(ttl);
        self
    }

    /// The retry queue implied by `with_retry`, if any.
    pub fn retry_queue(&self) -> Option<QueueDefinition> {
        let name = self.retry_name.as_ref()?;
        let mut def = self.companion(name);
        def.arguments.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from("")),
        );
        def.arguments.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(self.name.clone())),
        );
        if let Some(ttl) = self.retry_ttl {
            def.arguments.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }
        Some(def)
    }

    /// The dead letter queue implied by `with_dlq`, if any.
    pub fn dlq_queue(&self) -> Option<QueueDefinition> {
        self.dlq_name.as_ref().map(|name| self.companion(name))
    }

    /// The argument table sent with the queue declaration.
    ///
    /// Rejected messages are dead-lettered to the retry queue when one is
    /// configured, otherwise to the DLQ.
    pub fn declare_arguments(&self) -> FieldTable {
        let mut args = self.arguments.clone();

        let dead_letter_target = self.retry_name.as_ref().or(self.dlq_name.as_ref());
        if let Some(target) = dead_letter_target {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from("")),
            );
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(target.clone())),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        if let Some(max_bytes) = self.max_length_bytes {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                AMQPValue::LongInt(LongInt::from(max_bytes)),
            );
        }

        FieldTable::from(args)
    }

    /// A server-named queue, private to the connection that declared it.
    ///
    /// The definition returned by the broker declaration carries the
    /// generated name.
    pub fn broker_generated() -> QueueDefinition {
        QueueDefinition {
            durable: false,
            exclusive: true,
            delete: true,
            ..QueueDefinition::default()
        }
    }

    fn companion(&self, name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: self.durable,
            delete: self.delete,
            exclusive: self.exclusive,
            passive: self.passive,
            no_wait: self.no_wait,
            ..QueueDefinition::default()
        }
    }
}

/// Configuration for binding a queue to an exchange.
///
/// Queue bindings define how messages flow from exchanges to queues based on
/// routing keys and exchange types.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    /// These should be set using the `exchange` and `routing_key` methods.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..QueueBinding::default()
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Adds a binding argument, used by headers exchanges.
    ///
    /// Unbinding must repeat the arguments of the original binding.
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }
}

/// Conditions under which a queue deletion is allowed to proceed.
///
/// The broker refuses the deletion, closing the channel, when a condition is
/// not met.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDeletionCriteria {
    pub if_unused: bool,
    pub if_empty: bool,
}

impl QueueDeletionCriteria {
    /// Only delete the queue when it has no consumers.
    pub fn if_unused(mut self) -> Self {
        self.if_unused = true;
        self
    }

    /// Only delete the queue when it holds no messages.
    pub fn if_empty(mut self) -> Self {
        self.if_empty = true;
        self
    }
}

/// Number of messages dropped by a purge or a deletion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueuePurgeResult {
    pub message_count: u32,
}

/// The broker's answer to a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclareResult {
    pub queue_name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg<'a>(table: &'a FieldTable, key: &str) -> Option<&'a AMQPValue> {
        table.inner().get(&ShortString::from(key))
    }

    #[test]
    fn should_dead_letter_into_the_retry_queue_first() {
        let def = QueueDefinition::new("orders").with_dlq().with_retry(3000);
        let args = def.declare_arguments();

        assert_eq!(
            arg(&args, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString(LongString::from("orders-retry")))
        );

        let retry = def.retry_queue().unwrap();
        assert_eq!(retry.name(), "orders-retry");
        let retry_args = retry.declare_arguments();
        assert_eq!(
            arg(&retry_args, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString(LongString::from("orders")))
        );
        assert_eq!(
            arg(&retry_args, AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongInt(3000))
        );
    }

    #[test]
    fn should_describe_broker_generated_queues() {
        let def = QueueDefinition::broker_generated();

        assert!(def.name().is_empty());
        assert!(!def.durable);
        assert!(def.exclusive);
        assert!(def.delete);
    }

    #[test]
    fn should_build_deletion_criteria() {
        let criteria = QueueDeletionCriteria::default().if_unused();

        assert!(criteria.if_unused);
        assert!(!criteria.if_empty);
        assert!(criteria.if_empty().if_empty);
    }

    #[test]
    fn should_dead_letter_into_the_dlq_without_retry() {
        let def = QueueDefinition::new("orders").with_dlq().max_length(10);
        let args = def.declare_arguments();

        assert_eq!(
            arg(&args, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString(LongString::from("orders-dlq")))
        );
        assert_eq!(arg(&args, AMQP_HEADERS_MAX_LENGTH), Some(&AMQPValue::LongInt(10)));
        assert!(def.retry_queue().is_none());
        assert_eq!(def.dlq_queue().unwrap().name(), "orders-dlq");
    }
}
