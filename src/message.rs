// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages and Publish Settings
//!
//! Application-facing message types: the raw message body with its properties,
//! the typed header values carried in the `headers` property and the settings
//! describing where a message is published.

use crate::exchange::ExchangeDefinition;
use std::collections::BTreeMap;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    NonPersistent = 1,
    Persistent = 2,
}

impl DeliveryMode {
    pub fn from_wire(value: u8) -> Option<DeliveryMode> {
        match value {
            1 => Some(DeliveryMode::NonPersistent),
            2 => Some(DeliveryMode::Persistent),
            _ => None,
        }
    }
}

/// Typed value stored in the message headers.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u16),
    LongUint(u32),
    Timestamp(u64),
}

impl HeaderValue {
    /// Borrows the value as text when it is a string header.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::ShortString(v) | HeaderValue::LongString(v) => Some(v),
            _ => None,
        }
    }
}

/// Message headers keyed by name.
pub type Headers = BTreeMap<String, HeaderValue>;

/// The AMQP basic properties of a message. Unset properties are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
    pub content_encoding: Option<String>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub delivery_mode: Option<DeliveryMode>,
    pub expiration: Option<String>,
    pub headers: Option<Headers>,
    pub message_id: Option<String>,
    pub priority: Option<u8>,
    pub reply_to: Option<String>,
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
}

impl MessageProperties {
    /// Inserts a header, creating the header table if needed.
    pub fn insert_header(&mut self, key: &str, value: HeaderValue) {
        self.headers
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_owned(), value);
    }

    /// Looks a header up by name.
    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.as_ref().and_then(|h| h.get(key))
    }
}

/// A message body and its properties, ready to be published.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl RawMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        RawMessage {
            body: body.into(),
            properties: MessageProperties::default(),
        }
    }

    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }
}

/// Where and how a message is published.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishSettings {
    pub exchange: ExchangeDefinition,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
}

impl PublishSettings {
    pub fn new(exchange: ExchangeDefinition, routing_key: &str) -> Self {
        PublishSettings {
            exchange,
            routing_key: routing_key.to_owned(),
            mandatory: false,
            immediate: false,
        }
    }

    /// Asks the broker to return the message if it cannot be routed.
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }
}
