// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module provides the consumer-side value types: the settings a consumer
//! registers with, the context built for every delivery, the `Consumer` that
//! turns deliveries into queued handling actions, and the handle used to cancel
//! a low-level registration.

use crate::{
    consumer_loop::ConsumerLoop,
    errors::AmqpError,
    execution::ExecutionPolicy,
    message::MessageProperties,
    queue::QueueDefinition,
    transport::ChannelHandle,
};
use futures_util::FutureExt;
use lapin::types::{AMQPValue, ShortString};
use std::{collections::BTreeMap, fmt, sync::Arc};
use tracing::{debug, error};

/// Registration details for a consumer.
///
/// Re-submitted unchanged every time the underlying channel is rebuilt.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSettings {
    pub(crate) queue: QueueDefinition,
    pub(crate) consumer_tag: String,
    pub(crate) no_ack: bool,
    pub(crate) exclusive: bool,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
}

impl ConsumerSettings {
    /// Consumes `queue` with manual acknowledgements and a broker-generated tag.
    pub fn new(queue: QueueDefinition) -> Self {
        ConsumerSettings {
            queue,
            consumer_tag: String::new(),
            no_ack: false,
            exclusive: false,
            arguments: BTreeMap::default(),
        }
    }

    pub fn queue(&self) -> &QueueDefinition {
        &self.queue
    }

    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = tag.to_owned();
        self
    }

    /// Lets the broker consider deliveries acknowledged as soon as they are sent.
    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }
}

/// Everything known about one delivered message.
///
/// Built per delivery by the driver, consumed once by the execution loop.
#[derive(Clone)]
pub struct DeliveryContext {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    pub channel: Arc<dyn ChannelHandle>,
}

impl fmt::Debug for DeliveryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryContext")
            .field("consumer_tag", &self.consumer_tag)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

impl DeliveryContext {
    /// The message type, taken from the `type` property.
    pub fn message_type(&self) -> &str {
        self.properties.kind.as_deref().unwrap_or_default()
    }

    /// Positively acknowledges this delivery on the channel it arrived on.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.channel.acknowledge(self.delivery_tag, false).await
    }

    /// Negatively acknowledges this delivery, optionally asking the broker to requeue it.
    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.channel.reject(self.delivery_tag, requeue).await
    }
}

/// Turns deliveries into handling actions run by a consumer loop.
///
/// The driver callback only enqueues; the handler runs on the loop's worker.
pub struct Consumer {
    consumer_loop: Arc<ConsumerLoop>,
    policy: Arc<ExecutionPolicy>,
}

impl Consumer {
    pub fn new(consumer_loop: Arc<ConsumerLoop>, policy: Arc<ExecutionPolicy>) -> Self {
        Consumer {
            consumer_loop,
            policy,
        }
    }

    pub fn consumer_loop(&self) -> &Arc<ConsumerLoop> {
        &self.consumer_loop
    }

    /// Queues the execution policy for `ctx` on the consumer loop.
    pub fn handle_delivery(&self, ctx: DeliveryContext) -> Result<(), AmqpError> {
        debug!(
            consumer_tag = ctx.consumer_tag,
            delivery_tag = ctx.delivery_tag,
            "received: {} - exchange: {}",
            ctx.message_type(),
            ctx.exchange,
        );

        let policy = self.policy.clone();
        self.consumer_loop
            .queue_message_handle_action(async move { policy.execute(ctx).await }.boxed())
    }
}

/// A low-level consumer registration on one channel handle.
pub struct ConsumerHandle {
    consumer_tag: String,
    channel: Arc<dyn ChannelHandle>,
}

impl ConsumerHandle {
    pub fn new(consumer_tag: String, channel: Arc<dyn ChannelHandle>) -> Self {
        ConsumerHandle {
            consumer_tag,
            channel,
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Cancels the registration. A closed channel has nothing left to cancel.
    pub async fn cancel(&self) -> Result<(), AmqpError> {
        if !self.channel.is_open() {
            debug!(consumer_tag = self.consumer_tag, "channel already closed, nothing to cancel");
            return Ok(());
        }

        self.channel.cancel(&self.consumer_tag).await.map_err(|err| {
            error!(
                error = err.to_string(),
                consumer_tag = self.consumer_tag,
                "failure to cancel consumer"
            );
            err
        })
    }
}
