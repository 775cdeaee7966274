// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient RabbitMQ Layer
//!
//! This module provides the error type shared by every component of the crate.
//! The `AmqpError` enum represents the failures that can occur while connecting,
//! opening channels, declaring topology, publishing and consuming, plus the
//! usage errors raised when a component is called in the wrong state.

use thiserror::Error;

/// Error returned by application message handlers.
///
/// Handler errors are never propagated past the consumer execution loop; they
/// are logged and the delivery is left unacknowledged.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Variants only carry `String` context so the enum stays comparable, which the
/// tests rely on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// The persistent connection has no live connection handle
    #[error("rabbit server is not connected")]
    NotConnected,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error opening and configuring a channel through the channel factory
    #[error("failure to open a channel `{0}`")]
    OpenChannelError(String),

    /// The persistent channel is between two underlying channels
    #[error("no channel is currently open")]
    ChannelUnavailable,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding an exchange to another exchange
    #[error("failure to binding exchange `{0}` to exchange `{1}`")]
    BindingExchangeToExchangeError(String, String),

    /// Error removing a binding between a source and a destination
    #[error("failure to unbind `{0}` from `{1}`")]
    UnbindingError(String, String),

    /// Error deleting an exchange with the given name
    #[error("failure to delete exchange `{0}`")]
    DeleteExchangeError(String),

    /// Error deleting a queue with the given name
    #[error("failure to delete queue `{0}`")]
    DeleteQueueError(String),

    /// Error purging a queue with the given name
    #[error("failure to purge queue `{0}`")]
    PurgeQueueError(String),

    /// Error checking whether an exchange or queue exists
    #[error("failure to check existence of `{0}`")]
    ExistenceCheckError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error serializing or deserializing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error enabling publisher confirms on a channel
    #[error("failure to enable publisher confirms `{0}`")]
    ConfirmSelectError(String),

    /// The component was used before being initialised
    #[error("component is not initialised")]
    NotInitialised,

    /// The component was initialised twice
    #[error("component is already initialised")]
    AlreadyInitialised,

    /// The component was used after being disposed
    #[error("component is disposed")]
    Disposed,

    /// A message handle action was queued on a stopped consumer loop
    #[error("consumer loop is no longer running")]
    LoopStopped,

    /// A delivery arrived before a handler was configured
    #[error("a handler must be set before messages can be consumed")]
    HandlerNotSet,

    /// No handler is registered for the message type
    #[error("unsupported message type `{0}`")]
    UnsupportedMessageType(String),

    /// The configuration is not usable
    #[error("invalid configuration `{0}`")]
    InvalidConfig(String),

    /// An argument can never be accepted by the broker
    #[error("invalid argument `{0}`")]
    InvalidArgument(String),

    /// A component was created outside of a tokio runtime
    #[error("no tokio runtime available")]
    RuntimeUnavailable,

    /// A dedicated worker thread could not be started
    #[error("failure to spawn worker `{0}`")]
    WorkerSpawnError(String),
}

impl AmqpError {
    /// Returns true for errors caused by the caller, which are never retried.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            AmqpError::NotInitialised
                | AmqpError::AlreadyInitialised
                | AmqpError::Disposed
                | AmqpError::LoopStopped
                | AmqpError::HandlerNotSet
                | AmqpError::InvalidConfig(_)
                | AmqpError::InvalidArgument(_)
                | AmqpError::RuntimeUnavailable
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_classify_usage_errors() {
        assert!(AmqpError::Disposed.is_usage_error());
        assert!(AmqpError::NotInitialised.is_usage_error());
        assert!(AmqpError::InvalidArgument("kind".to_owned()).is_usage_error());
        assert!(!AmqpError::ChannelUnavailable.is_usage_error());
        assert!(!AmqpError::PublishingError("boom".to_owned()).is_usage_error());
    }
}
