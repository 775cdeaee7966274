// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient RabbitMQ
//!
//! A RabbitMQ client layer that survives broker restarts and network failures.
//!
//! `PersistentConnection` walks the configured hosts and reconnects after a
//! retry interval whenever the connection drops. `PersistentChannel` rebuilds
//! its channel on every reconnect. On top of those, `PublishDispatcher`
//! serialises publishes from any thread onto one channel and
//! `PersistentConsumer` re-registers consumers on every rebuilt channel,
//! handing deliveries to a `ConsumerLoop` that runs each handler through an
//! `ExecutionPolicy`. `RabbitMQBus` wires everything into typed JSON
//! publish/subscribe.

mod otel;
mod worker;

pub mod bus;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod consumer_loop;
pub mod driver;
pub mod errors;
pub mod exchange;
pub mod execution;
pub mod message;
pub mod notifier;
pub mod persistent_consumer;
pub mod pipeline;
pub mod properties;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod topology;
pub mod transport;

#[cfg(test)]
mod testing;

pub use bus::RabbitMQBus;
pub use channel::PersistentChannel;
pub use config::{ChannelSettings, RabbitMQConfigs};
pub use connection::PersistentConnection;
pub use errors::AmqpError;
pub use publisher::PublishDispatcher;
