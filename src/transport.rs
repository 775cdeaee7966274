// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Driver Seam
//!
//! The resilient layer never talks to lapin directly. It drives the broker
//! through the traits in this module: a `Transport` that opens connections,
//! `ConnectionHandle`s that create channels and report shutdowns, and
//! `ChannelHandle`s that carry topology, publish and consume operations and
//! report their own closure. The lapin implementation lives in `driver`.
//!
//! Handles are never reused once they report closure; the persistent
//! components always ask for a fresh one.

use crate::{
    config::{ChannelSettings, HostConfig, RabbitMQConfigs},
    consumer::{Consumer, ConsumerSettings},
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDefinition},
    message::{PublishSettings, RawMessage},
    queue::{
        QueueBinding, QueueDeclareResult, QueueDefinition, QueueDeletionCriteria,
        QueuePurgeResult,
    },
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

/// Invoked once when a connection shuts down, with the shutdown reason.
pub type ShutdownCallback = Box<dyn FnOnce(String) + Send + 'static>;

/// Invoked once when a channel closes.
pub type ClosedCallback = Box<dyn FnOnce() + Send + 'static>;

/// Opens transport-level connections to a broker host.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        host: &HostConfig,
        configs: &RabbitMQConfigs,
    ) -> Result<Arc<dyn ConnectionHandle>, AmqpError>;
}

/// A live transport-level connection.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// True while the transport reports the connection open.
    fn is_open(&self) -> bool;

    /// Registers the callback fired when the connection shuts down.
    fn on_shutdown(&self, callback: ShutdownCallback);

    /// Creates a raw, unconfigured channel.
    async fn create_channel(&self) -> Result<Arc<dyn ChannelHandle>, AmqpError>;

    async fn close(&self);
}

/// A channel scoped to one connection handle.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// True while the transport reports the channel open.
    fn is_open(&self) -> bool;

    /// Registers the callback fired when the channel closes.
    fn on_closed(&self, callback: ClosedCallback);

    async fn confirm_select(&self) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn declare_exchange(&self, exchange: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, queue: &QueueDefinition)
        -> Result<QueueDeclareResult, AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn unbind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn bind_exchange(&self, binding: &ExchangeBinding) -> Result<(), AmqpError>;

    async fn unbind_exchange(&self, binding: &ExchangeBinding) -> Result<(), AmqpError>;

    /// Checks for the exchange with a passive declaration.
    ///
    /// A missing exchange makes the broker close the channel.
    async fn exchange_exists(&self, exchange: &str) -> Result<bool, AmqpError>;

    async fn delete_exchange(&self, exchange: &str) -> Result<(), AmqpError>;

    /// Checks for the queue with a passive declaration, returning its counts
    /// when it exists.
    ///
    /// A missing queue makes the broker close the channel.
    async fn queue_exists(&self, queue: &str) -> Result<Option<QueueDeclareResult>, AmqpError>;

    /// Declares a server-named, exclusive, auto-delete queue.
    async fn declare_broker_generated_queue(&self) -> Result<QueueDefinition, AmqpError>;

    async fn delete_queue(
        &self,
        queue: &str,
        criteria: QueueDeletionCriteria,
    ) -> Result<QueuePurgeResult, AmqpError>;

    async fn purge_queue(&self, queue: &str) -> Result<QueuePurgeResult, AmqpError>;

    async fn publish(
        &self,
        message: &RawMessage,
        settings: &PublishSettings,
    ) -> Result<(), AmqpError>;

    /// Registers a low-level consumer and returns its consumer tag.
    ///
    /// Every delivery is handed to `consumer` as a `DeliveryContext` that
    /// references this channel for acknowledgements.
    async fn start_consuming(
        &self,
        consumer: Arc<Consumer>,
        settings: &ConsumerSettings,
    ) -> Result<String, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn acknowledge(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self);
}

/// Opens channels configured with `ChannelSettings`.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn open_channel(
        &self,
        connection: &Arc<dyn ConnectionHandle>,
        settings: &ChannelSettings,
    ) -> Result<Arc<dyn ChannelHandle>, AmqpError>;
}

/// Creates a channel, enables publisher confirms when requested and applies the
/// prefetch limit.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultChannelFactory;

#[async_trait]
impl ChannelFactory for DefaultChannelFactory {
    async fn open_channel(
        &self,
        connection: &Arc<dyn ConnectionHandle>,
        settings: &ChannelSettings,
    ) -> Result<Arc<dyn ChannelHandle>, AmqpError> {
        debug!("creating amqp channel...");

        let channel = connection.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::OpenChannelError(err.to_string())
        })?;

        let configured = async {
            if settings.publisher_confirms {
                channel.confirm_select().await?;
            }
            channel.basic_qos(settings.prefetch_count).await
        };

        if let Err(err) = configured.await {
            error!(error = err.to_string(), "error to configure the channel");
            channel.close().await;
            return Err(AmqpError::OpenChannelError(err.to_string()));
        }

        debug!("channel created");
        Ok(channel)
    }
}
