// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Publish Dispatcher
//!
//! `publish` may be called from any number of threads; it only enqueues. A
//! single dedicated worker drains the queue in FIFO order and is the only
//! writer on the dispatcher's channel, declaring destination exchanges on
//! demand. When the channel fails mid-publish the request is pushed back on
//! the queue after a backoff, so it is retried once the channel is rebuilt.
//! A retried request may therefore land behind requests submitted while the
//! channel was down.
//!
//! The caller's OpenTelemetry context is injected into the message headers at
//! enqueue time.

use crate::{
    channel::PersistentChannel,
    config::ChannelSettings,
    connection::PersistentConnection,
    errors::AmqpError,
    exchange::ExchangeDeclarationCache,
    message::{PublishSettings, RawMessage},
    otel,
    worker::spawn_worker,
};
use opentelemetry::Context;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
    thread::JoinHandle,
    time::Duration,
};
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    watch,
};
use tracing::{debug, error, warn};

const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// A message waiting to be handed to the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub message: RawMessage,
    pub settings: PublishSettings,
}

/// Serialises publishes from any thread onto one channel.
pub struct PublishDispatcher {
    retry_backoff: Duration,
    channel: PersistentChannel,
    initialised: AtomicBool,
    disposed: AtomicBool,
    sender: Mutex<Option<UnboundedSender<PublishRequest>>>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for PublishDispatcher {
    fn default() -> Self {
        PublishDispatcher::new()
    }
}

impl PublishDispatcher {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);

        PublishDispatcher {
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            channel: PersistentChannel::new(),
            initialised: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            sender: Mutex::new(None),
            shutdown,
            worker: Mutex::new(None),
        }
    }

    /// Sets the wait applied before a failed publish is retried.
    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    /// Opens the dispatcher's channel and starts the dispatch worker.
    pub async fn initialize(
        &self,
        connection: &PersistentConnection,
        settings: ChannelSettings,
    ) -> Result<(), AmqpError> {
        if self.is_disposed() {
            return Err(AmqpError::Disposed);
        }
        if self.initialised.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::AlreadyInitialised);
        }

        if let Err(err) = self.channel.initialise(connection, settings).await {
            self.initialised.store(false, Ordering::SeqCst);
            return Err(err);
        }

        let (sender, receiver) = unbounded_channel();
        let worker = match spawn_worker(
            "publish-dispatcher",
            dispatch_loop(
                self.channel.clone(),
                receiver,
                sender.clone(),
                self.shutdown.subscribe(),
                self.retry_backoff,
            ),
        ) {
            Ok(worker) => worker,
            Err(err) => {
                // the channel is bound already, so the dispatcher cannot be retried
                self.dispose().await;
                return Err(err);
            }
        };

        *self.sender() = Some(sender);
        *self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(worker);

        debug!("publish dispatcher initialized");
        Ok(())
    }

    /// Enqueues a message and returns immediately.
    ///
    /// A destination exchange the broker would always refuse fails here with
    /// `InvalidArgument` instead of reaching the worker.
    pub fn publish(&self, mut message: RawMessage, settings: PublishSettings) -> Result<(), AmqpError> {
        if self.is_disposed() {
            return Err(AmqpError::Disposed);
        }
        if !self.initialised.load(Ordering::SeqCst) {
            return Err(AmqpError::NotInitialised);
        }
        settings.exchange.validate()?;

        otel::inject_context(&Context::current(), &mut message.properties);

        match self.sender().as_ref() {
            Some(sender) => sender
                .send(PublishRequest { message, settings })
                .map_err(|_| AmqpError::Disposed),
            None => Err(AmqpError::NotInitialised),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Stops the worker, abandoning queued requests, and disposes the channel.
    /// Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.send_replace(true);
        self.sender().take();
        self.channel.dispose().await;
        debug!("publish dispatcher disposed");
    }

    /// Waits for the worker thread to exit. Blocks the calling thread.
    pub fn join(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("publish dispatcher worker panicked");
            }
        }
    }

    fn sender(&self) -> MutexGuard<'_, Option<UnboundedSender<PublishRequest>>> {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn dispatch_loop(
    channel: PersistentChannel,
    mut receiver: UnboundedReceiver<PublishRequest>,
    requeue: UnboundedSender<PublishRequest>,
    mut shutdown: watch::Receiver<bool>,
    retry_backoff: Duration,
) {
    let mut declared = ExchangeDeclarationCache::default();

    while !*shutdown.borrow() {
        let request = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            request = receiver.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        match dispatch(&channel, &mut declared, &request).await {
            Ok(()) => {}
            Err(err) if err.is_usage_error() => {
                warn!(error = err.to_string(), "publish dispatcher stopping");
                break;
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    exchange = request.settings.exchange.name,
                    "publish failed, retrying in {} ms",
                    retry_backoff.as_millis()
                );

                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(retry_backoff) => {}
                }

                if requeue.send(request).is_err() {
                    break;
                }
            }
        }
    }

    debug!("publish dispatcher stopped");
}

async fn dispatch(
    channel: &PersistentChannel,
    declared: &mut ExchangeDeclarationCache,
    request: &PublishRequest,
) -> Result<(), AmqpError> {
    let epoch = channel.epoch();
    let exchange = &request.settings.exchange;

    if declared.should_declare(epoch, exchange) {
        channel.declare_exchange(exchange).await?;
        declared.declared(epoch, exchange);
    }

    channel.publish(&request.message, &request.settings).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        exchange::ExchangeDefinition,
        testing::{connected, eventually, FakeTransport},
        transport::ChannelHandle,
    };

    fn to_default_exchange(queue: &str) -> PublishSettings {
        PublishSettings::new(ExchangeDefinition::default_exchange(), queue)
    }

    fn to_orders() -> PublishSettings {
        PublishSettings::new(ExchangeDefinition::new("orders").topic(), "#")
    }

    async fn dispatcher(transport: &std::sync::Arc<FakeTransport>) -> PublishDispatcher {
        let conn = connected(transport).await;
        let dispatcher = PublishDispatcher::new().with_retry_backoff(Duration::from_millis(10));
        dispatcher
            .initialize(&conn, ChannelSettings::default())
            .await
            .unwrap();
        dispatcher
    }

    #[tokio::test]
    async fn should_deliver_publishes_in_call_order() {
        let transport = FakeTransport::new();
        let dispatcher = dispatcher(&transport).await;
        let fake = transport.last_connection().unwrap().last_channel().unwrap();

        for i in 0..50 {
            dispatcher
                .publish(RawMessage::new(i.to_string()), to_default_exchange("jobs"))
                .unwrap();
        }

        eventually(|| fake.published().len() == 50).await;
        let expected: Vec<Vec<u8>> = (0..50).map(|i| i.to_string().into_bytes()).collect();
        assert_eq!(fake.published_bodies(), expected);
        assert!(fake.declared_exchanges().is_empty());

        dispatcher.dispose().await;
        dispatcher.join();
    }

    #[tokio::test]
    async fn should_declare_an_exchange_once_per_channel() {
        let transport = FakeTransport::new();
        let dispatcher = dispatcher(&transport).await;
        let conn = transport.last_connection().unwrap();
        let first = conn.last_channel().unwrap();

        dispatcher.publish(RawMessage::new("a"), to_orders()).unwrap();
        dispatcher.publish(RawMessage::new("b"), to_orders()).unwrap();
        eventually(|| first.published().len() == 2).await;
        assert_eq!(first.declared_exchanges(), vec!["orders"]);

        first.close_from_broker();
        eventually(|| conn.channels().len() == 2).await;
        let second = conn.last_channel().unwrap();

        dispatcher.publish(RawMessage::new("c"), to_orders()).unwrap();
        eventually(|| second.published().len() == 1).await;
        assert_eq!(second.declared_exchanges(), vec!["orders"]);
        assert_eq!(first.declared_exchanges(), vec!["orders"]);

        dispatcher.dispose().await;
    }

    #[tokio::test]
    async fn should_retry_a_failed_publish_once() {
        let transport = FakeTransport::new();
        let dispatcher = dispatcher(&transport).await;
        let fake = transport.last_connection().unwrap().last_channel().unwrap();
        fake.fail_next_publishes(1);

        dispatcher
            .publish(RawMessage::new("payload"), to_default_exchange("jobs"))
            .unwrap();

        eventually(|| fake.published().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(fake.publish_attempts(), 2);
        assert_eq!(fake.published_bodies(), vec![b"payload".to_vec()]);

        dispatcher.dispose().await;
    }

    #[tokio::test]
    async fn should_fail_publishes_after_dispose() {
        let transport = FakeTransport::new();
        let dispatcher = dispatcher(&transport).await;
        let fake = transport.last_connection().unwrap().last_channel().unwrap();

        dispatcher.dispose().await;
        dispatcher.dispose().await;
        let err = dispatcher
            .publish(RawMessage::new("late"), to_default_exchange("jobs"))
            .unwrap_err();
        dispatcher.join();

        assert_eq!(err, AmqpError::Disposed);
        assert_eq!(fake.publish_attempts(), 0);
        assert!(!fake.is_open());
    }

    #[tokio::test]
    async fn should_reject_invalid_exchanges_when_publishing() {
        let transport = FakeTransport::new();
        let dispatcher = dispatcher(&transport).await;
        let fake = transport.last_connection().unwrap().last_channel().unwrap();

        let shadowing = PublishSettings::new(ExchangeDefinition::new("orders").custom("topic"), "#");
        let err = dispatcher
            .publish(RawMessage::new("a"), shadowing)
            .unwrap_err();
        assert!(matches!(err, AmqpError::InvalidArgument(_)));
        assert!(err.is_usage_error());

        let generic = PublishSettings::new(ExchangeDefinition::new("app.Envelope<app.Foo>"), "#");
        assert!(matches!(
            dispatcher.publish(RawMessage::new("b"), generic),
            Err(AmqpError::InvalidArgument(_))
        ));

        // the worker is still alive for valid requests
        dispatcher.publish(RawMessage::new("c"), to_orders()).unwrap();
        eventually(|| fake.published().len() == 1).await;

        assert_eq!(fake.publish_attempts(), 1);
        assert_eq!(fake.published_bodies(), vec![b"c".to_vec()]);
        assert_eq!(fake.declared_exchanges(), vec!["orders"]);

        dispatcher.dispose().await;
    }

    #[tokio::test]
    async fn should_allow_initialize_again_after_a_failed_attempt() {
        let transport = FakeTransport::new();
        let disposed = connected(&transport).await;
        disposed.dispose().await;
        let dispatcher = PublishDispatcher::new();

        assert_eq!(
            dispatcher
                .initialize(&disposed, ChannelSettings::default())
                .await,
            Err(AmqpError::Disposed)
        );
        assert_eq!(
            dispatcher.publish(RawMessage::new("early"), to_default_exchange("jobs")),
            Err(AmqpError::NotInitialised)
        );

        let conn = connected(&transport).await;
        dispatcher
            .initialize(&conn, ChannelSettings::default())
            .await
            .unwrap();
        let fake = transport.last_connection().unwrap().last_channel().unwrap();

        dispatcher
            .publish(RawMessage::new("late"), to_default_exchange("jobs"))
            .unwrap();
        eventually(|| fake.published().len() == 1).await;

        dispatcher.dispose().await;
    }

    #[tokio::test]
    async fn should_reject_usage_before_and_after_initialize() {
        let transport = FakeTransport::new();
        let conn = connected(&transport).await;
        let dispatcher = PublishDispatcher::new();

        assert_eq!(
            dispatcher.publish(RawMessage::new("early"), to_default_exchange("jobs")),
            Err(AmqpError::NotInitialised)
        );

        dispatcher
            .initialize(&conn, ChannelSettings::default())
            .await
            .unwrap();
        assert_eq!(
            dispatcher
                .initialize(&conn, ChannelSettings::default())
                .await,
            Err(AmqpError::AlreadyInitialised)
        );

        dispatcher.dispose().await;
        assert_eq!(
            dispatcher
                .initialize(&conn, ChannelSettings::default())
                .await,
            Err(AmqpError::Disposed)
        );
    }
}
