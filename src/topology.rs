// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module provides functionality for defining and installing RabbitMQ topology components.
//! The topology includes exchanges, queues, and the bindings between them. It supports advanced
//! RabbitMQ features such as Dead Letter Queues (DLQs) and retry queues.
//!
//! A topology is an owned description: it can be installed again on every channel
//! rebuild, which keeps auto-delete and exclusive queues alive across reconnects.

use crate::{
    channel::PersistentChannel,
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDefinition},
    queue::{QueueBinding, QueueDefinition},
};
use tracing::debug;

/// The exchanges, queues and bindings an application needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmqpTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) exchanges_binding: Vec<ExchangeBinding>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    /// Adds an exchange definition to the topology.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Forwards messages from one exchange of the topology to another.
    pub fn exchange_binding(mut self, binding: ExchangeBinding) -> Self {
        self.exchanges_binding.push(binding);
        self
    }

    /// Adds a queue definition to the topology. Its retry queue and DLQ, if
    /// configured, are installed with it.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.retain(|queue| queue.name != def.name);
        self.queues.push(def);
        self
    }

    /// Adds a queue binding to the topology.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Declares everything on `channel`: exchanges and the bindings between
    /// them first, then retry queues, DLQs and queues, then queue bindings.
    /// Stops at the first failure.
    pub async fn install(&self, channel: &PersistentChannel) -> Result<(), AmqpError> {
        for exch in self.exchanges.iter().filter(|e| !e.is_default()) {
            debug!("creating exchange: {}", exch.name);
            channel.declare_exchange(exch).await?;
        }

        for binding in self.exchanges_binding.iter() {
            debug!(
                "binding exchange: {} to the exchange: {} with the key: {}",
                binding.destination, binding.source, binding.routing_key
            );
            channel.bind_exchange(binding).await?;
        }

        for def in self.queues.iter() {
            if let Some(retry) = def.retry_queue() {
                debug!("creating retry queue: {}", retry.name);
                channel.declare_queue(&retry).await?;
            }

            if let Some(dlq) = def.dlq_queue() {
                debug!("creating dlq: {}", dlq.name);
                channel.declare_queue(&dlq).await?;
            }

            debug!("creating queue: {}", def.name);
            channel.declare_queue(def).await?;
        }

        for binding in self.queues_binding.iter() {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            channel.bind_queue(binding).await?;
        }

        Ok(())
    }
}
