// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Bus
//!
//! Typed publish/subscribe over the resilient layer. Messages of type `T` are
//! published as JSON to a topic exchange named after `T` with the routing key
//! `#`. A subscription declares a durable `{prefix}_{type}` queue bound to that
//! exchange and hands each decoded message to the application closure on a
//! dedicated consumer loop.

use crate::{
    config::{ChannelSettings, RabbitMQConfigs},
    connection::PersistentConnection,
    consumer::{Consumer, ConsumerSettings, DeliveryContext},
    consumer_loop::ConsumerLoop,
    errors::{AmqpError, HandlerError},
    exchange::ExchangeDefinition,
    execution::{BasicHandlerSelector, ExecutionPolicy, Handler},
    persistent_consumer::{PersistentConsumer, PersistentConsumerHandle},
    pipeline::{
        exchange_name_of, message_type_of, ConsumerPipeline, ProducerPipeline, ALL_ROUTING_KEY,
    },
    publisher::PublishDispatcher,
    queue::{QueueBinding, QueueDefinition},
    topology::AmqpTopology,
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    marker::PhantomData,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, info, warn};

struct Subscription {
    handle: PersistentConsumerHandle,
    consumer_loop: Arc<ConsumerLoop>,
}

/// Typed message bus backed by one persistent connection.
pub struct RabbitMQBus {
    connection: PersistentConnection,
    dispatcher: PublishDispatcher,
    consumer: PersistentConsumer,
    producer: ProducerPipeline,
    channel_settings: ChannelSettings,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl RabbitMQBus {
    /// Connects to the configured hosts through lapin.
    pub async fn connect(configs: RabbitMQConfigs) -> Result<Self, AmqpError> {
        let connection = PersistentConnection::lapin(configs)?;
        RabbitMQBus::start(connection).await
    }

    /// Starts the bus on `connection`. An unreachable broker is not fatal: the
    /// connection keeps retrying and the publish channel opens once it is back.
    pub async fn start(connection: PersistentConnection) -> Result<Self, AmqpError> {
        match connection.try_to_connect().await {
            Ok(()) => {}
            Err(AmqpError::ConnectionError) => {
                warn!("broker unreachable, the bus will start once the connection is back")
            }
            Err(err) => return Err(err),
        }

        let configs = connection.configs();
        let channel_settings = configs.channel_settings();

        let dispatcher =
            PublishDispatcher::new().with_retry_backoff(configs.publish_retry_interval());
        dispatcher
            .initialize(&connection, channel_settings.clone())
            .await?;

        info!(app = configs.app_name, "rabbitmq bus started");

        Ok(RabbitMQBus {
            consumer: PersistentConsumer::new(&connection),
            connection,
            dispatcher,
            producer: ProducerPipeline::default(),
            channel_settings,
            subscriptions: Mutex::new(vec![]),
        })
    }

    /// Replaces the producer pipeline used by `publish`.
    pub fn with_producer_pipeline(mut self, producer: ProducerPipeline) -> Self {
        self.producer = producer;
        self
    }

    pub fn connection(&self) -> &PersistentConnection {
        &self.connection
    }

    /// Encodes `message` and enqueues it on the publish dispatcher.
    pub fn publish<T: Serialize>(&self, message: &T) -> Result<(), AmqpError> {
        let (raw, settings) = self.producer.run(message)?;
        self.dispatcher.publish(raw, settings)
    }

    /// Subscribes `handler` to every message of type `T`.
    ///
    /// Deliveries whose body does not decode as `T` are left unacknowledged.
    pub async fn subscribe<T, F>(&self, queue_prefix: &str, handler: F) -> Result<(), AmqpError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(T) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let message_type = message_type_of::<T>();
        let exchange_name = exchange_name_of::<T>();
        let queue_name = format!("{}_{}", queue_prefix, message_type);

        let queue = QueueDefinition::new(&queue_name).durable();
        let topology = AmqpTopology::new()
            .exchange(ExchangeDefinition::new(&exchange_name).topic())
            .queue(queue.clone())
            .queue_binding(
                QueueBinding::new(&queue_name)
                    .exchange(&exchange_name)
                    .routing_key(ALL_ROUTING_KEY),
            );

        let consumer_loop = Arc::new(ConsumerLoop::start(&queue_name)?);
        let selector = BasicHandlerSelector::new(Arc::new(TypedHandler {
            pipeline: ConsumerPipeline,
            handler,
            message: PhantomData::<fn() -> T>,
        }));
        let consumer = Arc::new(Consumer::new(
            consumer_loop.clone(),
            Arc::new(ExecutionPolicy::new(Arc::new(selector))),
        ));

        let handle = match self
            .consumer
            .start_consuming_with(
                consumer,
                ConsumerSettings::new(queue),
                self.channel_settings.clone(),
                Some(topology),
            )
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                consumer_loop.dispose();
                return Err(err);
            }
        };

        debug!(queue = queue_name, exchange = exchange_name, "subscribed");
        self.subscriptions().push(Subscription {
            handle,
            consumer_loop,
        });
        Ok(())
    }

    /// Cancels every subscription, stops the dispatcher and closes the
    /// connection. Idempotent.
    pub async fn dispose(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions());
        for subscription in subscriptions {
            subscription.handle.dispose().await;
            subscription.consumer_loop.dispose();
        }

        self.consumer.dispose().await;
        self.dispatcher.dispose().await;
        self.connection.dispose().await;
        debug!("rabbitmq bus disposed");
    }

    fn subscriptions(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct TypedHandler<T, F> {
    pipeline: ConsumerPipeline,
    handler: F,
    message: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F> Handler for TypedHandler<T, F>
where
    T: DeserializeOwned + Send + Sync + 'static,
    F: Fn(T) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    async fn handle(&self, ctx: &DeliveryContext) -> Result<(), HandlerError> {
        let message = self.pipeline.run::<T>(&ctx.body)?;
        (self.handler)(message)
    }
}
