// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Persistent AMQP Channel
//!
//! A logical channel that stays usable across any number of underlying channel
//! rebuilds. Whenever the current handle closes, it is discarded and a fresh
//! one is opened through the `PersistentConnection`; when no channel can be
//! opened the rebuild waits for the connection's next `connected`
//! notification. Callers never hold a handle themselves: every operation is
//! forwarded to whichever handle is current.

use crate::{
    config::ChannelSettings,
    connection::PersistentConnection,
    consumer::{Consumer, ConsumerHandle, ConsumerSettings},
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDefinition},
    message::{PublishSettings, RawMessage},
    notifier::{Notifier, SubscriptionId},
    queue::{
        QueueBinding, QueueDeclareResult, QueueDefinition, QueueDeletionCriteria,
        QueuePurgeResult,
    },
    transport::ChannelHandle,
};
use futures_util::{future::BoxFuture, FutureExt};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, RwLock, Weak,
};
use tracing::{debug, info, warn};

#[derive(Default)]
pub(crate) struct ChannelInner {
    binding: RwLock<Option<(PersistentConnection, ChannelSettings)>>,
    current: RwLock<Option<Arc<dyn ChannelHandle>>>,
    epoch: AtomicU64,
    initialised: AtomicBool,
    disposed: AtomicBool,
    rebuilding: tokio::sync::Mutex<()>,
    pending: Mutex<Option<SubscriptionId>>,
    opened: Notifier,
    closed: Notifier,
}

/// A channel that rebuilds itself whenever the underlying handle closes.
///
/// Cheap to clone; all clones share the same logical channel.
#[derive(Clone, Default)]
pub struct PersistentChannel {
    inner: Arc<ChannelInner>,
}

impl PersistentChannel {
    pub fn new() -> Self {
        PersistentChannel::default()
    }

    /// Binds the channel to `connection` and attempts to open it immediately.
    ///
    /// Only disposal is a permanent failure. Any other failure to open is
    /// retried once the connection reports it is connected again.
    pub async fn initialise(
        &self,
        connection: &PersistentConnection,
        settings: ChannelSettings,
    ) -> Result<(), AmqpError> {
        if self.is_disposed() || connection.is_disposed() {
            return Err(AmqpError::Disposed);
        }
        if self.inner.initialised.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::AlreadyInitialised);
        }

        *self
            .inner
            .binding
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some((connection.clone(), settings));

        self.try_open_channel().await;
        Ok(())
    }

    fn try_open_channel(&self) -> BoxFuture<'static, ()> {
        let this = self.clone();
        async move { this.rebuild().await }.boxed()
    }

    async fn rebuild(&self) {
        if self.is_disposed() {
            return;
        }

        let rebuilding = self.inner.rebuilding.lock().await;
        if self.is_disposed() || self.current().is_some_and(|handle| handle.is_open()) {
            return;
        }

        let Some((connection, settings)) = self.binding() else {
            return;
        };

        let handle = match connection.open_channel(&settings).await {
            Ok(handle) => handle,
            Err(AmqpError::Disposed) => {
                debug!("connection disposed, channel will not be rebuilt");
                return;
            }
            Err(err) => {
                warn!(error = err.to_string(), "failed to open channel, waiting for reconnection");
                drop(rebuilding);
                self.wait_for_reconnection(&connection);
                return;
            }
        };

        if self.is_disposed() {
            handle.close().await;
            return;
        }

        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = self.downgrade();
        handle.on_closed(Box::new(move || {
            if let Some(channel) = PersistentChannel::upgrade(&weak) {
                channel.on_channel_closed(epoch);
            }
        }));

        *self
            .inner
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle.clone());
        drop(rebuilding);

        // a close before the callback was registered is never reported
        if !handle.is_open() {
            self.inner
                .current
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            warn!(epoch, "amqp channel closed while opening, waiting for reconnection");
            self.wait_for_reconnection(&connection);
            return;
        }

        info!(epoch, "amqp channel opened");
        self.inner.opened.notify();
    }

    fn on_channel_closed(&self, epoch: u64) {
        if self.is_disposed() || self.inner.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        let Some((connection, _)) = self.binding() else {
            return;
        };

        let Some(old) = self
            .inner
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        else {
            return;
        };

        info!(epoch, "amqp channel closed, rebuilding");
        let this = self.clone();
        connection.runtime().spawn(async move {
            old.close().await;
            this.inner.closed.notify();
            this.try_open_channel().await;
        });
    }

    fn wait_for_reconnection(&self, connection: &PersistentConnection) {
        let weak = self.downgrade();
        let runtime = connection.runtime().clone();
        let id = connection.connected().subscribe_once(move || {
            if let Some(channel) = PersistentChannel::upgrade(&weak) {
                channel.pending().take();
                if !channel.is_disposed() {
                    runtime.spawn(channel.try_open_channel());
                }
            }
        });

        if let Some(previous) = self.pending().replace(id) {
            connection.connected().unsubscribe(previous);
        }

        // the connection may have come back before the subscription was in place
        if connection.is_connected() && connection.connected().unsubscribe(id) {
            self.pending().take();
            let delay = connection.retry_interval();
            debug!(
                "connection already established, retrying channel in {} seconds",
                delay.as_secs()
            );

            let this = self.clone();
            connection.runtime().spawn(async move {
                tokio::time::sleep(delay).await;
                this.try_open_channel().await;
            });
        }
    }

    fn handle(&self) -> Result<Arc<dyn ChannelHandle>, AmqpError> {
        if self.is_disposed() {
            return Err(AmqpError::Disposed);
        }
        if !self.inner.initialised.load(Ordering::SeqCst) {
            return Err(AmqpError::NotInitialised);
        }

        self.current()
            .filter(|handle| handle.is_open())
            .ok_or(AmqpError::ChannelUnavailable)
    }

    pub async fn publish(
        &self,
        message: &RawMessage,
        settings: &PublishSettings,
    ) -> Result<(), AmqpError> {
        self.handle()?.publish(message, settings).await
    }

    pub async fn declare_exchange(&self, exchange: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.handle()?.declare_exchange(exchange).await
    }

    pub async fn declare_queue(
        &self,
        queue: &QueueDefinition,
    ) -> Result<QueueDeclareResult, AmqpError> {
        self.handle()?.declare_queue(queue).await
    }

    pub async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.handle()?.bind_queue(binding).await
    }

    pub async fn unbind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.handle()?.unbind_queue(binding).await
    }

    pub async fn bind_exchange(&self, binding: &ExchangeBinding) -> Result<(), AmqpError> {
        self.handle()?.bind_exchange(binding).await
    }

    pub async fn unbind_exchange(&self, binding: &ExchangeBinding) -> Result<(), AmqpError> {
        self.handle()?.unbind_exchange(binding).await
    }

    /// Checks whether `exchange` exists. A negative answer costs the current
    /// channel, which is rebuilt like any other broker-side close.
    pub async fn exchange_exists(&self, exchange: &str) -> Result<bool, AmqpError> {
        self.handle()?.exchange_exists(exchange).await
    }

    pub async fn delete_exchange(&self, exchange: &str) -> Result<(), AmqpError> {
        self.handle()?.delete_exchange(exchange).await
    }

    /// Returns the queue's counts, or `None` when it does not exist. A missing
    /// queue costs the current channel, which is rebuilt.
    pub async fn queue_exists(&self, queue: &str) -> Result<Option<QueueDeclareResult>, AmqpError> {
        self.handle()?.queue_exists(queue).await
    }

    pub async fn declare_broker_generated_queue(&self) -> Result<QueueDefinition, AmqpError> {
        self.handle()?.declare_broker_generated_queue().await
    }

    /// Deletes `queue` when `criteria` hold and returns the number of messages
    /// it held.
    pub async fn delete_queue(
        &self,
        queue: &str,
        criteria: QueueDeletionCriteria,
    ) -> Result<QueuePurgeResult, AmqpError> {
        self.handle()?.delete_queue(queue, criteria).await
    }

    pub async fn purge_queue(&self, queue: &str) -> Result<QueuePurgeResult, AmqpError> {
        self.handle()?.purge_queue(queue).await
    }

    /// Registers `consumer` on the current handle.
    ///
    /// The registration dies with the handle; see `PersistentConsumer` for a
    /// registration that survives rebuilds.
    pub async fn start_consuming(
        &self,
        consumer: Arc<Consumer>,
        settings: &ConsumerSettings,
    ) -> Result<ConsumerHandle, AmqpError> {
        let handle = self.handle()?;
        let consumer_tag = handle.start_consuming(consumer, settings).await?;

        debug!(consumer_tag, queue = settings.queue.name, "consumer registered");
        Ok(ConsumerHandle::new(consumer_tag, handle))
    }

    /// True while the current handle is open.
    pub fn is_open(&self) -> bool {
        self.handle().is_ok()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Number of handles opened so far. Incremented on every successful open.
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    /// Fired once per successful open, including the first.
    pub fn opened(&self) -> &Notifier {
        &self.inner.opened
    }

    /// Fired once per teardown of a handle, and once on disposal.
    pub fn closed(&self) -> &Notifier {
        &self.inner.closed
    }

    /// Closes the current handle and stops every pending rebuild. Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let pending = self.pending().take();
        if let (Some(id), Some((connection, _))) = (pending, self.binding()) {
            connection.connected().unsubscribe(id);
        }

        let current = self
            .inner
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = current {
            handle.close().await;
        }

        self.inner.closed.notify();
        debug!("amqp channel disposed");
    }

    pub(crate) fn downgrade(&self) -> Weak<ChannelInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<ChannelInner>) -> Option<PersistentChannel> {
        weak.upgrade().map(|inner| PersistentChannel { inner })
    }

    fn current(&self) -> Option<Arc<dyn ChannelHandle>> {
        self.inner
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn binding(&self) -> Option<(PersistentConnection, ChannelSettings)> {
        self.inner
            .binding
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn pending(&self) -> MutexGuard<'_, Option<SubscriptionId>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
