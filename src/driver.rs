// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Driver
//!
//! Implements the transport seam on top of lapin. Every lapin error is logged
//! here and mapped to the matching `AmqpError` variant; nothing above this
//! module sees a `lapin::Error`.

use crate::{
    config::{HostConfig, RabbitMQConfigs},
    consumer::{Consumer, ConsumerSettings, DeliveryContext},
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDefinition},
    message::{PublishSettings, RawMessage},
    properties,
    queue::{
        QueueBinding, QueueDeclareResult, QueueDefinition, QueueDeletionCriteria,
        QueuePurgeResult,
    },
    transport::{ChannelHandle, ClosedCallback, ConnectionHandle, ShutdownCallback, Transport},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeBindOptions,
        ExchangeDeclareOptions, ExchangeDeleteOptions, ExchangeUnbindOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use tracing::{debug, error, warn};

/// Opens lapin connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct LapinTransport;

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(
        &self,
        host: &HostConfig,
        configs: &RabbitMQConfigs,
    ) -> Result<Arc<dyn ConnectionHandle>, AmqpError> {
        debug!(host = host.host, port = host.port, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(configs.app_name.clone()));

        match Connection::connect(&configs.uri(host), options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(Arc::new(LapinConnection { conn }))
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    host = host.host,
                    port = host.port,
                    vhost = configs.vhost,
                    "failure to connect"
                );
                Err(AmqpError::ConnectionError)
            }
        }
    }
}

pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl ConnectionHandle for LapinConnection {
    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    fn on_shutdown(&self, callback: ShutdownCallback) {
        let callback = Mutex::new(Some(callback));
        self.conn.on_error(move |err| {
            let callback = callback
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(callback) = callback {
                callback(err.to_string());
            }
        });
    }

    async fn create_channel(&self) -> Result<Arc<dyn ChannelHandle>, AmqpError> {
        match self.conn.create_channel().await {
            Ok(channel) => Ok(Arc::new(LapinChannel::new(channel))),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    async fn close(&self) {
        if !self.is_open() {
            return;
        }

        if let Err(err) = self.conn.close(200, "OK").await {
            warn!(error = err.to_string(), "error closing amqp connection");
        }
    }
}

pub struct LapinChannel {
    channel: Channel,
    confirms: AtomicBool,
}

impl LapinChannel {
    fn new(channel: Channel) -> Self {
        LapinChannel {
            channel,
            confirms: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ChannelHandle for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    fn on_closed(&self, callback: ClosedCallback) {
        let callback = Mutex::new(Some(callback));
        let id = self.channel.id();
        self.channel.on_error(move |err| {
            debug!(error = err.to_string(), channel = id, "amqp channel closed");
            let callback = callback
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(callback) = callback {
                callback();
            }
        });
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to enable publisher confirms");
                AmqpError::ConfirmSelectError(err.to_string())
            })?;

        self.confirms.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn declare_exchange(&self, exchange: &ExchangeDefinition) -> Result<(), AmqpError> {
        if exchange.is_default() {
            return Ok(());
        }

        debug!(exchange = exchange.name, "declaring exchange...");
        let kind: lapin::ExchangeKind = exchange.kind.clone().try_into()?;

        match self
            .channel
            .exchange_declare(
                &exchange.name,
                kind,
                ExchangeDeclareOptions {
                    passive: exchange.passive,
                    durable: exchange.durable,
                    auto_delete: exchange.delete,
                    internal: exchange.internal,
                    nowait: exchange.no_wait,
                },
                FieldTable::from(exchange.params.clone()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), exchange = exchange.name, "error to declare the exchange");
                Err(AmqpError::DeclareExchangeError(exchange.name.clone()))
            }
            _ => {
                debug!(exchange = exchange.name, "exchange declared");
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        queue: &QueueDefinition,
    ) -> Result<QueueDeclareResult, AmqpError> {
        debug!(queue = queue.name, "declaring queue...");

        match self
            .channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    passive: queue.passive,
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.delete,
                    nowait: queue.no_wait,
                },
                queue.declare_arguments(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = queue.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(queue.name.clone()))
            }
            Ok(declared) => {
                debug!(queue = queue.name, "queue declared");
                Ok(QueueDeclareResult {
                    queue_name: declared.name().as_str().to_owned(),
                    message_count: declared.message_count(),
                    consumer_count: declared.consumer_count(),
                })
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            exchange = binding.exchange_name,
            queue = binding.queue_name,
            "binding queue..."
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::from(binding.arguments.clone()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => {
                debug!("queue was bound");
                Ok(())
            }
        }
    }

    async fn unbind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_unbind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                FieldTable::from(binding.arguments.clone()),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue = binding.queue_name, "error to unbind queue");
                AmqpError::UnbindingError(binding.exchange_name.clone(), binding.queue_name.clone())
            })?;

        debug!(exchange = binding.exchange_name, queue = binding.queue_name, "queue was unbound");
        Ok(())
    }

    async fn bind_exchange(&self, binding: &ExchangeBinding) -> Result<(), AmqpError> {
        self.channel
            .exchange_bind(
                &binding.destination,
                &binding.source,
                &binding.routing_key,
                ExchangeBindOptions::default(),
                FieldTable::from(binding.arguments.clone()),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind exchange to exchange");
                AmqpError::BindingExchangeToExchangeError(
                    binding.source.clone(),
                    binding.destination.clone(),
                )
            })?;

        debug!(source = binding.source, destination = binding.destination, "exchange was bound");
        Ok(())
    }

    async fn unbind_exchange(&self, binding: &ExchangeBinding) -> Result<(), AmqpError> {
        self.channel
            .exchange_unbind(
                &binding.destination,
                &binding.source,
                &binding.routing_key,
                ExchangeUnbindOptions::default(),
                FieldTable::from(binding.arguments.clone()),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to unbind exchange");
                AmqpError::UnbindingError(binding.source.clone(), binding.destination.clone())
            })?;

        debug!(source = binding.source, destination = binding.destination, "exchange was unbound");
        Ok(())
    }

    async fn exchange_exists(&self, exchange: &str) -> Result<bool, AmqpError> {
        if exchange.is_empty() {
            return Ok(true);
        }

        let passive = ExchangeDeclareOptions {
            passive: true,
            ..ExchangeDeclareOptions::default()
        };

        match self
            .channel
            .exchange_declare(exchange, lapin::ExchangeKind::Direct, passive, FieldTable::default())
            .await
        {
            Ok(()) => Ok(true),
            Err(err) if is_not_found(&err) => {
                debug!(exchange, "exchange does not exist");
                Ok(false)
            }
            Err(err) => {
                error!(error = err.to_string(), exchange, "error to check the exchange");
                Err(AmqpError::ExistenceCheckError(exchange.to_owned()))
            }
        }
    }

    async fn delete_exchange(&self, exchange: &str) -> Result<(), AmqpError> {
        if exchange.is_empty() {
            return Err(AmqpError::InvalidArgument(
                "the default exchange cannot be deleted".to_owned(),
            ));
        }

        self.channel
            .exchange_delete(exchange, ExchangeDeleteOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), exchange, "error to delete the exchange");
                AmqpError::DeleteExchangeError(exchange.to_owned())
            })?;

        debug!(exchange, "exchange deleted");
        Ok(())
    }

    async fn queue_exists(&self, queue: &str) -> Result<Option<QueueDeclareResult>, AmqpError> {
        let passive = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };

        match self
            .channel
            .queue_declare(queue, passive, FieldTable::default())
            .await
        {
            Ok(declared) => Ok(Some(QueueDeclareResult {
                queue_name: declared.name().as_str().to_owned(),
                message_count: declared.message_count(),
                consumer_count: declared.consumer_count(),
            })),
            Err(err) if is_not_found(&err) => {
                debug!(queue, "queue does not exist");
                Ok(None)
            }
            Err(err) => {
                error!(error = err.to_string(), queue, "error to check the queue");
                Err(AmqpError::ExistenceCheckError(queue.to_owned()))
            }
        }
    }

    async fn declare_broker_generated_queue(&self) -> Result<QueueDefinition, AmqpError> {
        let mut queue = QueueDefinition::broker_generated();
        let declared = self.declare_queue(&queue).await?;
        queue.name = declared.queue_name;
        Ok(queue)
    }

    async fn delete_queue(
        &self,
        queue: &str,
        criteria: QueueDeletionCriteria,
    ) -> Result<QueuePurgeResult, AmqpError> {
        let message_count = self
            .channel
            .queue_delete(
                queue,
                QueueDeleteOptions {
                    if_unused: criteria.if_unused,
                    if_empty: criteria.if_empty,
                    ..QueueDeleteOptions::default()
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to delete the queue");
                AmqpError::DeleteQueueError(queue.to_owned())
            })?;

        debug!(queue, message_count, "queue deleted");
        Ok(QueuePurgeResult { message_count })
    }

    async fn purge_queue(&self, queue: &str) -> Result<QueuePurgeResult, AmqpError> {
        let message_count = self
            .channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to purge the queue");
                AmqpError::PurgeQueueError(queue.to_owned())
            })?;

        debug!(queue, message_count, "queue purged");
        Ok(QueuePurgeResult { message_count })
    }

    async fn publish(
        &self,
        message: &RawMessage,
        settings: &PublishSettings,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                &settings.exchange.name,
                &settings.routing_key,
                BasicPublishOptions {
                    mandatory: settings.mandatory,
                    immediate: settings.immediate,
                },
                &message.body,
                properties::to_basic_properties(&message.properties),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError(err.to_string())
            })?;

        if !self.confirms.load(Ordering::SeqCst) {
            return Ok(());
        }

        match confirm.await {
            Ok(confirmation) if confirmation.is_nack() => {
                error!(exchange = settings.exchange.name, "message was nacked by the broker");
                Err(AmqpError::PublishingError("nacked by the broker".to_owned()))
            }
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error waiting for publisher confirm");
                Err(AmqpError::PublishingError(err.to_string()))
            }
        }
    }

    async fn start_consuming(
        &self,
        consumer: Arc<Consumer>,
        settings: &ConsumerSettings,
    ) -> Result<String, AmqpError> {
        let mut stream = match self
            .channel
            .basic_consume(
                &settings.queue.name,
                &settings.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: settings.no_ack,
                    exclusive: settings.exclusive,
                    nowait: false,
                },
                FieldTable::from(settings.arguments.clone()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(settings.queue.name.clone()))
            }
            Ok(c) => Ok(c),
        }?;

        let consumer_tag = stream.tag().as_str().to_owned();
        let handle: Arc<dyn ChannelHandle> = Arc::new(LapinChannel::new(self.channel.clone()));
        let tag = consumer_tag.clone();

        tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(delivery) => {
                        let ctx = DeliveryContext {
                            consumer_tag: tag.clone(),
                            delivery_tag: delivery.delivery_tag,
                            redelivered: delivery.redelivered,
                            exchange: delivery.exchange.as_str().to_owned(),
                            routing_key: delivery.routing_key.as_str().to_owned(),
                            properties: properties::from_basic_properties(&delivery.properties),
                            body: delivery.data,
                            channel: handle.clone(),
                        };

                        if let Err(err) = consumer.handle_delivery(ctx) {
                            warn!(error = err.to_string(), consumer_tag = tag, "consumer loop stopped, dropping delivery");
                            break;
                        }
                    }

                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }

            debug!(consumer_tag = tag, "consumer stream ended");
        });

        Ok(consumer_tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to cancel the consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn acknowledge(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn close(&self) {
        if !self.is_open() {
            return;
        }

        if let Err(err) = self.channel.close(200, "OK").await {
            warn!(error = err.to_string(), "error closing amqp channel");
        }
    }
}

// Passive declarations of a missing entity fail with a 404 channel close.
fn is_not_found(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::protocol::AMQPError;

    #[test]
    fn should_recognise_missing_entities() {
        let not_found = lapin::Error::ProtocolError(AMQPError::new(
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND),
            "NOT_FOUND - no exchange 'orders'".into(),
        ));
        let refused = lapin::Error::ProtocolError(AMQPError::new(
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED),
            "ACCESS_REFUSED".into(),
        ));

        assert!(is_not_found(&not_found));
        assert!(!is_not_found(&refused));
        assert!(!is_not_found(&lapin::Error::ChannelsLimitReached));
    }
}
