// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Persistent Consumer
//!
//! Keeps a consumer registration alive across channel rebuilds. Each
//! subscription owns a `PersistentChannel`; every time that channel opens, the
//! optional topology is installed again and the same consumer settings are
//! registered on the fresh handle. The application handler never notices.

use crate::{
    channel::PersistentChannel,
    config::ChannelSettings,
    connection::PersistentConnection,
    consumer::{Consumer, ConsumerHandle, ConsumerSettings},
    errors::AmqpError,
    topology::AmqpTopology,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};
use tracing::{debug, error, info, warn};

type ActiveRegistration = Arc<Mutex<Option<ConsumerHandle>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registers consumers that survive reconnects.
pub struct PersistentConsumer {
    connection: PersistentConnection,
    channels: Mutex<Vec<PersistentChannel>>,
    disposed: AtomicBool,
}

impl PersistentConsumer {
    pub fn new(connection: &PersistentConnection) -> Self {
        PersistentConsumer {
            connection: connection.clone(),
            channels: Mutex::new(vec![]),
            disposed: AtomicBool::new(false),
        }
    }

    /// Starts consuming on a dedicated channel and keeps the registration
    /// alive across channel rebuilds.
    pub async fn start_consuming(
        &self,
        consumer: Arc<Consumer>,
        settings: ConsumerSettings,
        channel_settings: ChannelSettings,
    ) -> Result<PersistentConsumerHandle, AmqpError> {
        self.start_consuming_with(consumer, settings, channel_settings, None)
            .await
    }

    /// Same as `start_consuming`, installing `topology` on every channel open
    /// before the consumer is registered.
    pub async fn start_consuming_with(
        &self,
        consumer: Arc<Consumer>,
        settings: ConsumerSettings,
        channel_settings: ChannelSettings,
        topology: Option<AmqpTopology>,
    ) -> Result<PersistentConsumerHandle, AmqpError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(AmqpError::Disposed);
        }

        let channel = PersistentChannel::new();
        let active: ActiveRegistration = Arc::new(Mutex::new(None));

        let weak = channel.downgrade();
        let runtime = self.connection.runtime().clone();
        let registration = active.clone();
        channel.opened().subscribe(move || {
            let Some(channel) = PersistentChannel::upgrade(&weak) else {
                return;
            };
            if channel.is_disposed() {
                return;
            }

            runtime.spawn(register(
                channel.clone(),
                channel.epoch(),
                consumer.clone(),
                settings.clone(),
                topology.clone(),
                registration.clone(),
            ));
        });

        lock(&self.channels).push(channel.clone());
        channel.initialise(&self.connection, channel_settings).await?;

        Ok(PersistentConsumerHandle { channel, active })
    }

    /// Disposes every channel created by this consumer. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let channels = std::mem::take(&mut *lock(&self.channels));
        for channel in channels {
            channel.dispose().await;
        }
        debug!("persistent consumer disposed");
    }
}

async fn register(
    channel: PersistentChannel,
    epoch: u64,
    consumer: Arc<Consumer>,
    settings: ConsumerSettings,
    topology: Option<AmqpTopology>,
    active: ActiveRegistration,
) {
    // a newer open already has its own registration on the way
    if channel.is_disposed() || channel.epoch() != epoch {
        return;
    }

    if let Some(topology) = topology {
        if let Err(err) = topology.install(&channel).await {
            error!(
                error = err.to_string(),
                queue = settings.queue.name,
                "failure to install consumer topology"
            );
            return;
        }
    }

    match channel.start_consuming(consumer, &settings).await {
        Ok(handle) => {
            info!(
                consumer_tag = handle.consumer_tag(),
                queue = settings.queue.name,
                "consuming"
            );

            if channel.is_disposed() {
                if let Err(err) = handle.cancel().await {
                    warn!(error = err.to_string(), "failure to cancel a late registration");
                }
                return;
            }
            *lock(&active) = Some(handle);
        }
        Err(err) => error!(
            error = err.to_string(),
            queue = settings.queue.name,
            "failure to register consumer, waiting for the next channel"
        ),
    }
}

/// Controls one persistent subscription.
pub struct PersistentConsumerHandle {
    channel: PersistentChannel,
    active: ActiveRegistration,
}

impl PersistentConsumerHandle {
    /// Tag of the registration on the current channel, if one is active.
    pub fn consumer_tag(&self) -> Option<String> {
        lock(&self.active)
            .as_ref()
            .map(|handle| handle.consumer_tag().to_owned())
    }

    /// Cancels the active registration, if any, and disposes the subscription's
    /// channel. Safe to call mid-rebuild and more than once.
    pub async fn dispose(&self) {
        let active = lock(&self.active).take();
        if let Some(handle) = active {
            if let Err(err) = handle.cancel().await {
                warn!(error = err.to_string(), "failure to cancel consumer on dispose");
            }
        }

        self.channel.dispose().await;
    }
}
