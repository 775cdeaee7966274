// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Property Mapping
//!
//! Copies message properties between the application representation and
//! lapin's `BasicProperties`, one field at a time. Unset fields stay unset in
//! both directions.

use crate::message::{DeliveryMode, HeaderValue, Headers, MessageProperties};
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use std::collections::BTreeMap;

/// Builds lapin properties from message properties.
pub fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();

    if let Some(v) = &properties.app_id {
        basic = basic.with_app_id(ShortString::from(v.as_str()));
    }
    if let Some(v) = &properties.cluster_id {
        basic = basic.with_cluster_id(ShortString::from(v.as_str()));
    }
    if let Some(v) = &properties.content_encoding {
        basic = basic.with_content_encoding(ShortString::from(v.as_str()));
    }
    if let Some(v) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(v.as_str()));
    }
    if let Some(v) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(v.as_str()));
    }
    if let Some(v) = properties.delivery_mode {
        basic = basic.with_delivery_mode(v as u8);
    }
    if let Some(v) = &properties.expiration {
        basic = basic.with_expiration(ShortString::from(v.as_str()));
    }
    if let Some(v) = &properties.headers {
        basic = basic.with_headers(field_table(v));
    }
    if let Some(v) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(v.as_str()));
    }
    if let Some(v) = properties.priority {
        basic = basic.with_priority(v);
    }
    if let Some(v) = &properties.reply_to {
        basic = basic.with_reply_to(ShortString::from(v.as_str()));
    }
    if let Some(v) = properties.timestamp {
        basic = basic.with_timestamp(v);
    }
    if let Some(v) = &properties.kind {
        basic = basic.with_type(ShortString::from(v.as_str()));
    }
    if let Some(v) = &properties.user_id {
        basic = basic.with_user_id(ShortString::from(v.as_str()));
    }

    basic
}

/// Reads message properties from lapin properties.
pub fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    let text = |v: &Option<ShortString>| v.as_ref().map(|s| s.as_str().to_owned());

    MessageProperties {
        app_id: text(basic.app_id()),
        cluster_id: text(basic.cluster_id()),
        content_encoding: text(basic.content_encoding()),
        content_type: text(basic.content_type()),
        correlation_id: text(basic.correlation_id()),
        delivery_mode: basic.delivery_mode().and_then(DeliveryMode::from_wire),
        expiration: text(basic.expiration()),
        headers: basic.headers().as_ref().map(headers),
        message_id: text(basic.message_id()),
        priority: *basic.priority(),
        reply_to: text(basic.reply_to()),
        timestamp: *basic.timestamp(),
        kind: text(basic.kind()),
        user_id: text(basic.user_id()),
    }
}

fn field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in headers {
        let amqp_value = match value {
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v.as_str())),
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v.as_str())),
            HeaderValue::Int(v) => AMQPValue::ShortInt(*v),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(*v),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::Uint(v) => AMQPValue::ShortUInt(*v),
            HeaderValue::LongUint(v) => AMQPValue::LongUInt(*v),
            HeaderValue::Timestamp(v) => AMQPValue::Timestamp(*v),
        };

        btree.insert(ShortString::from(key.as_str()), amqp_value);
    }

    FieldTable::from(btree)
}

// Header values with no application counterpart (floats, decimals, nested
// tables, arrays) are dropped.
fn headers(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
                AMQPValue::ShortString(v) => HeaderValue::ShortString(v.as_str().to_owned()),
                AMQPValue::LongString(v) => {
                    HeaderValue::LongString(String::from_utf8_lossy(v.as_bytes()).into_owned())
                }
                AMQPValue::ShortShortInt(v) => HeaderValue::Int(i16::from(*v)),
                AMQPValue::ShortInt(v) => HeaderValue::Int(*v),
                AMQPValue::LongInt(v) => HeaderValue::LongInt(*v),
                AMQPValue::LongLongInt(v) => HeaderValue::LongLongInt(*v),
                AMQPValue::ShortShortUInt(v) => HeaderValue::Uint(u16::from(*v)),
                AMQPValue::ShortUInt(v) => HeaderValue::Uint(*v),
                AMQPValue::LongUInt(v) => HeaderValue::LongUint(*v),
                AMQPValue::Timestamp(v) => HeaderValue::Timestamp(*v),
                _ => return None,
            };
            Some((key.as_str().to_owned(), value))
        })
        .collect()
}
