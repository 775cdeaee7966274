// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! This module provides types for defining RabbitMQ exchanges and for tracking
//! which exchanges were already declared on the current channel.
//! Exchanges are the routing mechanism in RabbitMQ that determine how messages are
//! distributed to queues. Exchange definitions are owned values so they can be
//! queued with a publish request and re-sent verbatim after a failure.

use crate::errors::AmqpError;
use lapin::types::{AMQPValue, LongString, ShortString};
use std::collections::{BTreeMap, HashSet};

/// Constant for the header field used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Longest exchange name the protocol can carry (a short string)
pub const MAX_EXCHANGE_NAME_LEN: usize = 255;

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Extension for delayed message delivery (plugin required)
/// - Custom: Any other exchange type provided by a broker plugin
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
    Custom(String),
}

impl TryInto<lapin::ExchangeKind> for ExchangeKind {
    type Error = AmqpError;

    /// Converts the internal ExchangeKind to lapin's ExchangeKind.
    ///
    /// XMessageDelayed maps to the custom type registered by the delayed message
    /// exchange plugin. Custom kinds must not shadow a built-in type.
    fn try_into(self) -> Result<lapin::ExchangeKind, AmqpError> {
        match self {
            ExchangeKind::Direct => Ok(lapin::ExchangeKind::Direct),
            ExchangeKind::Fanout => Ok(lapin::ExchangeKind::Fanout),
            ExchangeKind::Headers => Ok(lapin::ExchangeKind::Headers),
            ExchangeKind::Topic => Ok(lapin::ExchangeKind::Topic),
            ExchangeKind::XMessageDelayed => {
                Ok(lapin::ExchangeKind::Custom("x-delayed-message".to_owned()))
            }
            ExchangeKind::Custom(kind) => match kind.as_str() {
                "" | "direct" | "fanout" | "topic" | "headers" => {
                    Err(AmqpError::DeclareExchangeError(kind))
                }
                _ => Ok(lapin::ExchangeKind::Custom(kind)),
            },
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure exchange definitions.
/// It supports standard exchange types as well as special configurations like delayed messaging.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// By default, the exchange is created as a durable Direct exchange.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    ///
    /// # Returns
    /// A new exchange definition with default settings
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: true,
            passive: false,
            internal: false,
            no_wait: false,
            params: BTreeMap::default(),
        }
    }

    /// The broker's default (nameless) direct exchange.
    ///
    /// It always exists and can never be declared.
    pub fn default_exchange() -> ExchangeDefinition {
        ExchangeDefinition::new("")
    }

    /// Returns true for the default (nameless) exchange.
    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }

    /// The exchange name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The exchange type.
    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.kind
    }

    /// Sets the exchange type.
    ///
    /// # Parameters
    /// * `kind` - The exchange type
    ///
    /// # Returns
    /// Self for method chaining
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Direct.
    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    /// Sets the exchange type to Fanout.
    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    /// Sets the exchange type to Topic.
    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Sets the exchange type to Headers.
    pub fn headers(mut self) -> Self {
        self.kind = ExchangeKind::Headers;
        self
    }

    /// Uses an exchange type provided by a broker plugin.
    pub fn custom(mut self, kind: &str) -> Self {
        self.kind = ExchangeKind::Custom(kind.to_owned());
        self
    }

    /// Creates a delayed direct exchange.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn delayed_direct(mut self) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.params.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from("direct")),
        );
        self
    }

    /// Creates a delayed fanout exchange.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn delayed_fanout(mut self) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.params.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from("fanout")),
        );
        self
    }

    /// Sets the exchange parameters.
    pub fn params(mut self, params: BTreeMap<ShortString, AMQPValue>) -> Self {
        self.params = params;
        self
    }

    /// Adds a single parameter to the exchange.
    ///
    /// # Parameters
    /// * `key` - The parameter name
    /// * `value` - The parameter value
    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange transient, removed on broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Makes the exchange passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Sets no_wait flag, making the operation non-blocking.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Checks the definition for mistakes the broker would always refuse.
    ///
    /// Names may only hold letters, digits, hyphens, underscores, periods and
    /// colons. The kind must convert to a lapin exchange kind.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.name.len() > MAX_EXCHANGE_NAME_LEN {
            return Err(AmqpError::InvalidArgument(format!(
                "exchange name longer than {} bytes",
                MAX_EXCHANGE_NAME_LEN
            )));
        }

        if let Some(c) = self
            .name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
        {
            return Err(AmqpError::InvalidArgument(format!(
                "exchange name `{}` contains `{}`",
                self.name, c
            )));
        }

        let _: lapin::ExchangeKind = self.kind.clone().try_into().map_err(|_| {
            AmqpError::InvalidArgument(format!("exchange kind {:?}", self.kind))
        })?;

        Ok(())
    }
}

/// Binding from a source exchange to a destination exchange.
///
/// Messages routed by `source` with a matching routing key are forwarded to
/// `destination`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangeBinding {
    pub(crate) source: String,
    pub(crate) destination: String,
    pub(crate) routing_key: String,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeBinding {
    pub fn new(source: &str, destination: &str) -> Self {
        ExchangeBinding {
            source: source.to_owned(),
            destination: destination.to_owned(),
            ..ExchangeBinding::default()
        }
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Adds a binding argument, used by headers exchanges.
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }
}

/// Tracks the exchanges declared on the current channel epoch.
///
/// A rebuilt channel starts a new epoch, which empties the cache: declarations are
/// reissued after every rebuild so conflicting redeclarations surface early.
#[derive(Debug, Default)]
pub struct ExchangeDeclarationCache {
    epoch: u64,
    declared: HashSet<String>,
}

impl ExchangeDeclarationCache {
    /// Returns true if `exchange` still needs to be declared in `epoch`.
    pub fn should_declare(&mut self, epoch: u64, exchange: &ExchangeDefinition) -> bool {
        self.sync(epoch);
        !exchange.is_default() && !self.declared.contains(&exchange.name)
    }

    /// Records a successful declaration in `epoch`.
    pub fn declared(&mut self, epoch: u64, exchange: &ExchangeDefinition) {
        self.sync(epoch);
        self.declared.insert(exchange.name.clone());
    }

    fn sync(&mut self, epoch: u64) {
        if self.epoch != epoch {
            self.declared.clear();
            self.epoch = epoch;
        }
    }
}
