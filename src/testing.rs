// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory transport used by the unit tests.

use crate::{
    config::{HostConfig, RabbitMQConfigs},
    connection::PersistentConnection,
    consumer::{Consumer, ConsumerSettings, DeliveryContext},
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDefinition},
    message::{MessageProperties, PublishSettings, RawMessage},
    notifier::Notifier,
    queue::{
        QueueBinding, QueueDeclareResult, QueueDefinition, QueueDeletionCriteria,
        QueuePurgeResult,
    },
    retry::ConnectionRetryTimer,
    transport::{
        ChannelHandle, ClosedCallback, ConnectionHandle, DefaultChannelFactory, ShutdownCallback,
        Transport,
    },
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Polls `condition` until it holds, panicking after roughly five seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

/// Single-host configuration with a one second retry interval.
pub fn test_configs() -> RabbitMQConfigs {
    RabbitMQConfigs {
        hosts: vec![HostConfig::new("rabbit-1", 5672)],
        connection_retry_seconds: 1,
        ..RabbitMQConfigs::default()
    }
}

/// A persistent connection over `transport`, not yet connected.
pub fn persistent_connection(transport: &Arc<FakeTransport>) -> PersistentConnection {
    let configs = test_configs();
    let retry_timer = Arc::new(ConnectionRetryTimer::new(configs.connection_retry_interval()));

    PersistentConnection::new(
        configs,
        transport.clone(),
        Arc::new(DefaultChannelFactory),
        retry_timer,
    )
    .unwrap()
}

/// A persistent connection over `transport`, already connected.
pub async fn connected(transport: &Arc<FakeTransport>) -> PersistentConnection {
    let conn = persistent_connection(transport);
    conn.try_to_connect().await.unwrap();
    conn
}

/// Counts how many times `notifier` fires.
pub fn counter(notifier: &Notifier) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let counted = count.clone();
    notifier.subscribe(move || {
        counted.fetch_add(1, Ordering::SeqCst);
    });
    count
}

/// Builds a delivery arriving on `channel`.
pub fn delivery(
    channel: &Arc<FakeChannel>,
    delivery_tag: u64,
    kind: &str,
    body: &[u8],
) -> DeliveryContext {
    let handle: Arc<dyn ChannelHandle> = channel.clone();
    DeliveryContext {
        consumer_tag: "fake-consumer".to_owned(),
        delivery_tag,
        redelivered: false,
        exchange: "fake-exchange".to_owned(),
        routing_key: "#".to_owned(),
        properties: MessageProperties {
            kind: Some(kind.to_owned()),
            ..MessageProperties::default()
        },
        body: body.to_vec(),
        channel: handle,
    }
}

#[derive(Default)]
pub struct FakeTransport {
    unreachable: Mutex<HashSet<String>>,
    all_unreachable: AtomicBool,
    attempts: Mutex<Vec<String>>,
    early_shutdowns: AtomicUsize,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeTransport {
    pub fn new() -> Arc<FakeTransport> {
        Arc::new(FakeTransport::default())
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.all_unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_host_unreachable(&self, host: &str) {
        lock(&self.unreachable).insert(host.to_owned());
    }

    /// The next `n` connections are shut down by the broker before `connect`
    /// returns them.
    pub fn shut_down_next_connections(&self, n: usize) {
        self.early_shutdowns.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        lock(&self.attempts).len()
    }

    /// Hosts tried so far, in order.
    pub fn attempted_hosts(&self) -> Vec<String> {
        lock(&self.attempts).clone()
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        lock(&self.connections).clone()
    }

    pub fn last_connection(&self) -> Option<Arc<FakeConnection>> {
        lock(&self.connections).last().cloned()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        host: &HostConfig,
        _configs: &RabbitMQConfigs,
    ) -> Result<Arc<dyn ConnectionHandle>, AmqpError> {
        lock(&self.attempts).push(host.host.clone());

        if self.all_unreachable.load(Ordering::SeqCst) || lock(&self.unreachable).contains(&host.host)
        {
            return Err(AmqpError::ConnectionError);
        }

        let connection = FakeConnection::new();
        lock(&self.connections).push(connection.clone());
        if take_one(&self.early_shutdowns) {
            connection.shutdown("connection reset while connecting");
        }
        Ok(connection)
    }
}

pub struct FakeConnection {
    open: AtomicBool,
    closes: AtomicUsize,
    channel_failures: AtomicUsize,
    shutdown_callbacks: Mutex<Vec<ShutdownCallback>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeConnection {
    pub fn new() -> Arc<FakeConnection> {
        Arc::new(FakeConnection {
            open: AtomicBool::new(true),
            closes: AtomicUsize::new(0),
            channel_failures: AtomicUsize::new(0),
            shutdown_callbacks: Mutex::new(vec![]),
            channels: Mutex::new(vec![]),
        })
    }

    /// Simulates a broker-side shutdown. Every channel closes with it.
    pub fn shutdown(&self, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        for channel in self.channels() {
            channel.close_from_broker();
        }

        let callbacks = std::mem::take(&mut *lock(&self.shutdown_callbacks));
        for callback in callbacks {
            callback(reason.to_owned());
        }
    }

    pub fn fail_next_channels(&self, n: usize) {
        self.channel_failures.store(n, Ordering::SeqCst);
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn channels(&self) -> Vec<Arc<FakeChannel>> {
        lock(&self.channels).clone()
    }

    pub fn last_channel(&self) -> Option<Arc<FakeChannel>> {
        lock(&self.channels).last().cloned()
    }
}

#[async_trait]
impl ConnectionHandle for FakeConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn on_shutdown(&self, callback: ShutdownCallback) {
        lock(&self.shutdown_callbacks).push(callback);
    }

    async fn create_channel(&self) -> Result<Arc<dyn ChannelHandle>, AmqpError> {
        if !self.is_open() || take_one(&self.channel_failures) {
            return Err(AmqpError::ChannelError);
        }

        let channel = FakeChannel::new();
        lock(&self.channels).push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
    }
}

pub struct FakeChannel {
    me: Weak<FakeChannel>,
    open: AtomicBool,
    confirms: AtomicBool,
    qos: Mutex<Option<u16>>,
    closed_callbacks: Mutex<Vec<ClosedCallback>>,
    publish_failures: AtomicUsize,
    publish_attempts: AtomicUsize,
    exchanges: Mutex<Vec<String>>,
    queues: Mutex<Vec<String>>,
    bindings: Mutex<Vec<QueueBinding>>,
    exchange_bindings: Mutex<Vec<ExchangeBinding>>,
    depths: Mutex<HashMap<String, u32>>,
    generated_queues: AtomicUsize,
    published: Mutex<Vec<(RawMessage, PublishSettings)>>,
    consumers: Mutex<Vec<(ConsumerSettings, Arc<Consumer>)>>,
    cancels: Mutex<Vec<String>>,
    acks: Mutex<Vec<u64>>,
    rejects: Mutex<Vec<(u64, bool)>>,
}

impl FakeChannel {
    pub fn new() -> Arc<FakeChannel> {
        Arc::new_cyclic(|me| FakeChannel {
            me: me.clone(),
            open: AtomicBool::new(true),
            confirms: AtomicBool::new(false),
            qos: Mutex::new(None),
            closed_callbacks: Mutex::new(vec![]),
            publish_failures: AtomicUsize::new(0),
            publish_attempts: AtomicUsize::new(0),
            exchanges: Mutex::new(vec![]),
            queues: Mutex::new(vec![]),
            bindings: Mutex::new(vec![]),
            exchange_bindings: Mutex::new(vec![]),
            depths: Mutex::new(HashMap::new()),
            generated_queues: AtomicUsize::new(0),
            published: Mutex::new(vec![]),
            consumers: Mutex::new(vec![]),
            cancels: Mutex::new(vec![]),
            acks: Mutex::new(vec![]),
            rejects: Mutex::new(vec![]),
        })
    }

    /// Simulates the broker closing the channel.
    pub fn close_from_broker(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        let callbacks = std::mem::take(&mut *lock(&self.closed_callbacks));
        for callback in callbacks {
            callback();
        }
    }

    pub fn fail_next_publishes(&self, n: usize) {
        self.publish_failures.store(n, Ordering::SeqCst);
    }

    pub fn publish_attempts(&self) -> usize {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    pub fn qos(&self) -> Option<u16> {
        *lock(&self.qos)
    }

    pub fn confirms_enabled(&self) -> bool {
        self.confirms.load(Ordering::SeqCst)
    }

    pub fn declared_exchanges(&self) -> Vec<String> {
        lock(&self.exchanges).clone()
    }

    pub fn declared_queues(&self) -> Vec<String> {
        lock(&self.queues).clone()
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        lock(&self.bindings).clone()
    }

    pub fn exchange_bindings(&self) -> Vec<ExchangeBinding> {
        lock(&self.exchange_bindings).clone()
    }

    /// Sets the number of messages ready in `queue`.
    pub fn set_queue_depth(&self, queue: &str, messages: u32) {
        lock(&self.depths).insert(queue.to_owned(), messages);
    }

    pub fn published(&self) -> Vec<(RawMessage, PublishSettings)> {
        lock(&self.published).clone()
    }

    pub fn published_bodies(&self) -> Vec<Vec<u8>> {
        lock(&self.published)
            .iter()
            .map(|(message, _)| message.body.clone())
            .collect()
    }

    pub fn consumer_settings(&self) -> Vec<ConsumerSettings> {
        lock(&self.consumers)
            .iter()
            .map(|(settings, _)| settings.clone())
            .collect()
    }

    pub fn cancels(&self) -> Vec<String> {
        lock(&self.cancels).clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        lock(&self.acks).clone()
    }

    pub fn rejects(&self) -> Vec<(u64, bool)> {
        lock(&self.rejects).clone()
    }

    /// Hands a delivery to the most recently registered consumer.
    pub fn deliver(&self, delivery_tag: u64, kind: &str, body: &[u8]) -> Result<(), AmqpError> {
        let consumer = lock(&self.consumers)
            .last()
            .map(|(_, consumer)| consumer.clone())
            .ok_or(AmqpError::ChannelError)?;
        let me = self.me.upgrade().ok_or(AmqpError::ChannelError)?;

        consumer.handle_delivery(delivery(&me, delivery_tag, kind, body))
    }

    fn depth(&self, queue: &str) -> u32 {
        lock(&self.depths).get(queue).copied().unwrap_or_default()
    }

    fn active_consumers(&self, queue: &str) -> usize {
        let cancels = lock(&self.cancels);
        lock(&self.consumers)
            .iter()
            .enumerate()
            .filter(|(i, (settings, _))| {
                settings.queue.name == queue
                    && !cancels.contains(&format!("fake-consumer-{}", i + 1))
            })
            .count()
    }

    fn ensure_open(&self, err: AmqpError) -> Result<(), AmqpError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(err)
        }
    }
}

#[async_trait]
impl ChannelHandle for FakeChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn on_closed(&self, callback: ClosedCallback) {
        lock(&self.closed_callbacks).push(callback);
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.ensure_open(AmqpError::ConfirmSelectError("closed".to_owned()))?;
        self.confirms.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.ensure_open(AmqpError::QoSDeclarationError("closed".to_owned()))?;
        *lock(&self.qos) = Some(prefetch_count);
        Ok(())
    }

    async fn declare_exchange(&self, exchange: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open(AmqpError::DeclareExchangeError(exchange.name().to_owned()))?;
        lock(&self.exchanges).push(exchange.name().to_owned());
        Ok(())
    }

    async fn declare_queue(
        &self,
        queue: &QueueDefinition,
    ) -> Result<QueueDeclareResult, AmqpError> {
        self.ensure_open(AmqpError::DeclareQueueError(queue.name.clone()))?;
        lock(&self.queues).push(queue.name.clone());
        Ok(QueueDeclareResult {
            queue_name: queue.name.clone(),
            message_count: 0,
            consumer_count: 0,
        })
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open(AmqpError::BindingExchangeToQueueError(
            binding.exchange_name.clone(),
            binding.queue_name.clone(),
        ))?;
        lock(&self.bindings).push(binding.clone());
        Ok(())
    }

    async fn unbind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open(AmqpError::UnbindingError(
            binding.exchange_name.clone(),
            binding.queue_name.clone(),
        ))?;
        lock(&self.bindings).retain(|bound| bound != binding);
        Ok(())
    }

    async fn bind_exchange(&self, binding: &ExchangeBinding) -> Result<(), AmqpError> {
        self.ensure_open(AmqpError::BindingExchangeToExchangeError(
            binding.source.clone(),
            binding.destination.clone(),
        ))?;
        lock(&self.exchange_bindings).push(binding.clone());
        Ok(())
    }

    async fn unbind_exchange(&self, binding: &ExchangeBinding) -> Result<(), AmqpError> {
        self.ensure_open(AmqpError::UnbindingError(
            binding.source.clone(),
            binding.destination.clone(),
        ))?;
        lock(&self.exchange_bindings).retain(|bound| bound != binding);
        Ok(())
    }

    async fn exchange_exists(&self, exchange: &str) -> Result<bool, AmqpError> {
        self.ensure_open(AmqpError::ExistenceCheckError(exchange.to_owned()))?;
        if exchange.is_empty() || lock(&self.exchanges).iter().any(|name| name == exchange) {
            return Ok(true);
        }

        self.close_from_broker();
        Ok(false)
    }

    async fn delete_exchange(&self, exchange: &str) -> Result<(), AmqpError> {
        self.ensure_open(AmqpError::DeleteExchangeError(exchange.to_owned()))?;
        lock(&self.exchanges).retain(|name| name != exchange);
        Ok(())
    }

    async fn queue_exists(&self, queue: &str) -> Result<Option<QueueDeclareResult>, AmqpError> {
        self.ensure_open(AmqpError::ExistenceCheckError(queue.to_owned()))?;
        if !lock(&self.queues).iter().any(|name| name == queue) {
            self.close_from_broker();
            return Ok(None);
        }

        Ok(Some(QueueDeclareResult {
            queue_name: queue.to_owned(),
            message_count: self.depth(queue),
            consumer_count: self.active_consumers(queue) as u32,
        }))
    }

    async fn declare_broker_generated_queue(&self) -> Result<QueueDefinition, AmqpError> {
        self.ensure_open(AmqpError::DeclareQueueError(String::new()))?;
        let n = self.generated_queues.fetch_add(1, Ordering::SeqCst) + 1;
        let mut queue = QueueDefinition::broker_generated();
        queue.name = format!("amq.gen-{}", n);
        lock(&self.queues).push(queue.name.clone());
        Ok(queue)
    }

    async fn delete_queue(
        &self,
        queue: &str,
        criteria: QueueDeletionCriteria,
    ) -> Result<QueuePurgeResult, AmqpError> {
        self.ensure_open(AmqpError::DeleteQueueError(queue.to_owned()))?;
        let message_count = self.depth(queue);

        if (criteria.if_empty && message_count > 0)
            || (criteria.if_unused && self.active_consumers(queue) > 0)
        {
            self.close_from_broker();
            return Err(AmqpError::DeleteQueueError(queue.to_owned()));
        }

        lock(&self.queues).retain(|name| name != queue);
        lock(&self.depths).remove(queue);
        Ok(QueuePurgeResult { message_count })
    }

    async fn purge_queue(&self, queue: &str) -> Result<QueuePurgeResult, AmqpError> {
        self.ensure_open(AmqpError::PurgeQueueError(queue.to_owned()))?;
        let message_count = lock(&self.depths).insert(queue.to_owned(), 0).unwrap_or_default();
        Ok(QueuePurgeResult { message_count })
    }

    async fn publish(
        &self,
        message: &RawMessage,
        settings: &PublishSettings,
    ) -> Result<(), AmqpError> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        self.ensure_open(AmqpError::PublishingError("channel closed".to_owned()))?;

        if take_one(&self.publish_failures) {
            return Err(AmqpError::PublishingError("broker refused".to_owned()));
        }

        lock(&self.published).push((message.clone(), settings.clone()));
        Ok(())
    }

    async fn start_consuming(
        &self,
        consumer: Arc<Consumer>,
        settings: &ConsumerSettings,
    ) -> Result<String, AmqpError> {
        self.ensure_open(AmqpError::BindingConsumerError(settings.queue.name.clone()))?;

        let mut consumers = lock(&self.consumers);
        consumers.push((settings.clone(), consumer));
        Ok(format!("fake-consumer-{}", consumers.len()))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.ensure_open(AmqpError::CancelConsumerError(consumer_tag.to_owned()))?;
        lock(&self.cancels).push(consumer_tag.to_owned());
        Ok(())
    }

    async fn acknowledge(&self, delivery_tag: u64, _multiple: bool) -> Result<(), AmqpError> {
        self.ensure_open(AmqpError::AckMessageError)?;
        lock(&self.acks).push(delivery_tag);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.ensure_open(AmqpError::NackMessageError)?;
        lock(&self.rejects).push((delivery_tag, requeue));
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
