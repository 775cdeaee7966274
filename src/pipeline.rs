// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Pipelines
//!
//! The producer pipeline turns an application value into a raw message plus
//! its publish settings by running an ordered list of plain functions over a
//! `PublishingContext`. The consumer pipeline does the reverse for a delivery
//! body.
//!
//! The default producer pipeline serializes to JSON, encodes the text as UTF-8,
//! stamps the `type`, `content_type` and `content_encoding` properties, sets a
//! correlation id when none is present and routes the message to a topic
//! exchange named after the message type with the routing key `#`.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{PublishSettings, RawMessage, JSON_CONTENT_TYPE},
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::error;
use uuid::Uuid;

/// Content encoding stamped on every message produced by the default pipeline
pub const UTF8_CONTENT_ENCODING: &str = "UTF8";

/// Routing key used when publishing to a message type's topic exchange
pub const ALL_ROUTING_KEY: &str = "#";

/// Short name of `T`, stamped in the `type` property.
///
/// Generic arguments are flattened into the name, so `Vec<app::Foo>` becomes
/// `Vec_Foo`.
pub fn message_type_of<T: ?Sized>() -> String {
    render_type_name(std::any::type_name::<T>(), |path| {
        path.rsplit("::").next().unwrap_or(path).to_owned()
    })
}

/// Name of the topic exchange carrying messages of type `T`.
///
/// `alloc::vec::Vec<app::Foo>` becomes `alloc.vec.Vec_app.Foo`.
pub fn exchange_name_of<T: ?Sized>() -> String {
    render_type_name(std::any::type_name::<T>(), |path| path.replace("::", "."))
}

// Splits a type name into its paths, dropping the generic punctuation, and
// joins the rendered paths with `_`.
fn render_type_name(full: &str, render_path: impl Fn(&str) -> String) -> String {
    full.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == ':'))
        .filter(|path| !path.is_empty())
        .map(render_path)
        .collect::<Vec<_>>()
        .join("_")
}

/// State threaded through the producer steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishingContext {
    pub message_type: String,
    pub exchange_name: String,
    pub value: serde_json::Value,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub json: Option<String>,
    pub body: Vec<u8>,
    pub message: Option<RawMessage>,
    pub settings: Option<PublishSettings>,
}

/// One producer transform.
pub type ProducerStep = fn(PublishingContext) -> Result<PublishingContext, AmqpError>;

/// Serializes the value to JSON text.
pub fn serialize(mut ctx: PublishingContext) -> Result<PublishingContext, AmqpError> {
    let json = serde_json::to_string(&ctx.value).map_err(|err| {
        error!(error = err.to_string(), "error serializing message");
        AmqpError::ParsePayloadError(err.to_string())
    })?;

    ctx.content_type = Some(JSON_CONTENT_TYPE.to_owned());
    ctx.json = Some(json);
    Ok(ctx)
}

/// Encodes the JSON text as UTF-8 bytes.
pub fn encode_utf8(mut ctx: PublishingContext) -> Result<PublishingContext, AmqpError> {
    let json = ctx.json.take().ok_or(AmqpError::InternalError)?;
    ctx.content_encoding = Some(UTF8_CONTENT_ENCODING.to_owned());
    ctx.body = json.into_bytes();
    Ok(ctx)
}

pub fn create_message(mut ctx: PublishingContext) -> Result<PublishingContext, AmqpError> {
    ctx.message = Some(RawMessage::new(std::mem::take(&mut ctx.body)));
    Ok(ctx)
}

/// Stamps the message type, content type and content encoding.
pub fn set_message_properties(
    mut ctx: PublishingContext,
) -> Result<PublishingContext, AmqpError> {
    let message = ctx.message.as_mut().ok_or(AmqpError::InternalError)?;
    message.properties.kind = Some(ctx.message_type.clone());
    message.properties.content_type = ctx.content_type.clone();
    message.properties.content_encoding = ctx.content_encoding.clone();
    Ok(ctx)
}

pub fn set_correlation_id(mut ctx: PublishingContext) -> Result<PublishingContext, AmqpError> {
    let message = ctx.message.as_mut().ok_or(AmqpError::InternalError)?;
    if message.properties.correlation_id.is_none() {
        message.properties.correlation_id = Some(Uuid::new_v4().to_string());
    }
    Ok(ctx)
}

/// Routes to the message type's topic exchange.
pub fn set_exchange_and_routing_key(
    mut ctx: PublishingContext,
) -> Result<PublishingContext, AmqpError> {
    let exchange = ExchangeDefinition::new(&ctx.exchange_name).topic();
    ctx.settings = Some(PublishSettings::new(exchange, ALL_ROUTING_KEY));
    Ok(ctx)
}

/// An ordered list of producer steps.
#[derive(Debug, Clone)]
pub struct ProducerPipeline {
    steps: Vec<ProducerStep>,
}

impl Default for ProducerPipeline {
    fn default() -> Self {
        ProducerPipeline {
            steps: vec![
                serialize,
                encode_utf8,
                create_message,
                set_message_properties,
                set_correlation_id,
                set_exchange_and_routing_key,
            ],
        }
    }
}

impl ProducerPipeline {
    pub fn new(steps: Vec<ProducerStep>) -> Self {
        ProducerPipeline { steps }
    }

    /// Appends a step run after the existing ones.
    pub fn then(mut self, step: ProducerStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Runs every step over `message`.
    pub fn run<T: Serialize>(
        &self,
        message: &T,
    ) -> Result<(RawMessage, PublishSettings), AmqpError> {
        let value = serde_json::to_value(message).map_err(|err| {
            error!(error = err.to_string(), "error serializing message");
            AmqpError::ParsePayloadError(err.to_string())
        })?;

        let ctx = PublishingContext {
            message_type: message_type_of::<T>(),
            exchange_name: exchange_name_of::<T>(),
            value,
            ..PublishingContext::default()
        };

        let ctx = self.steps.iter().try_fold(ctx, |ctx, step| step(ctx))?;

        match (ctx.message, ctx.settings) {
            (Some(message), Some(settings)) => Ok((message, settings)),
            _ => Err(AmqpError::InternalError),
        }
    }
}

/// Decodes delivery bodies: UTF-8 text, then JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumerPipeline;

impl ConsumerPipeline {
    pub fn run<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, AmqpError> {
        let text = convert_to_string(body)?;
        deserialize(text)
    }
}

fn convert_to_string(body: &[u8]) -> Result<&str, AmqpError> {
    std::str::from_utf8(body).map_err(|err| {
        error!(error = err.to_string(), "message body is not utf-8");
        AmqpError::ParsePayloadError(err.to_string())
    })
}

fn deserialize<T: DeserializeOwned>(text: &str) -> Result<T, AmqpError> {
    serde_json::from_str(text).map_err(|err| {
        error!(error = err.to_string(), "error deserializing message");
        AmqpError::ParsePayloadError(err.to_string())
    })
}
