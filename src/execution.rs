// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Selection and Execution Policy
//!
//! The execution policy wraps every handler invocation: it resolves the handler
//! for a delivery, runs it, acknowledges the delivery when the handler returns
//! normally and contains every failure. A handler error or panic is logged and
//! the delivery is left unacknowledged, so redelivery is governed by the
//! broker. Handlers that want to decline a message deliberately call
//! `DeliveryContext::reject`.

use crate::{
    consumer::DeliveryContext,
    errors::{AmqpError, HandlerError},
    otel,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{Arc, RwLock},
};
use tracing::{debug, error};

/// Application code invoked for each delivery.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &DeliveryContext) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&DeliveryContext) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, ctx: &DeliveryContext) -> Result<(), HandlerError> {
        (self.0)(ctx)
    }
}

/// Adapts a synchronous closure into a `Handler`.
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(&DeliveryContext) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Resolves the handler for a delivery.
#[cfg_attr(test, mockall::automock)]
pub trait HandlerSelector: Send + Sync {
    fn select(&self, ctx: &DeliveryContext) -> Result<Arc<dyn Handler>, AmqpError>;
}

/// Routes every delivery to a single handler.
#[derive(Default)]
pub struct BasicHandlerSelector {
    handler: RwLock<Option<Arc<dyn Handler>>>,
}

impl BasicHandlerSelector {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        BasicHandlerSelector {
            handler: RwLock::new(Some(handler)),
        }
    }

    pub fn set_handler(&self, handler: Arc<dyn Handler>) {
        *self
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handler);
    }
}

impl HandlerSelector for BasicHandlerSelector {
    fn select(&self, _ctx: &DeliveryContext) -> Result<Arc<dyn Handler>, AmqpError> {
        self.handler
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(AmqpError::HandlerNotSet)
    }
}

/// Routes deliveries by their `type` property.
#[derive(Default)]
pub struct TypeHandlerSelector {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl TypeHandlerSelector {
    pub fn new() -> Self {
        TypeHandlerSelector::default()
    }

    /// Registers the handler for one message type.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn register(mut self, msg_type: &str, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(msg_type.to_owned(), handler);
        self
    }
}

impl HandlerSelector for TypeHandlerSelector {
    fn select(&self, ctx: &DeliveryContext) -> Result<Arc<dyn Handler>, AmqpError> {
        let msg_type = ctx.message_type();
        self.handlers
            .get(msg_type)
            .cloned()
            .ok_or_else(|| AmqpError::UnsupportedMessageType(msg_type.to_owned()))
    }
}

/// Wraps handler invocation with acknowledgement and failure containment.
pub struct ExecutionPolicy {
    selector: Arc<dyn HandlerSelector>,
}

impl ExecutionPolicy {
    pub fn new(selector: Arc<dyn HandlerSelector>) -> Self {
        ExecutionPolicy { selector }
    }

    /// Handles one delivery. Never fails and never panics.
    pub async fn execute(&self, ctx: DeliveryContext) {
        let tracer = global::tracer("amqp consumer");
        let (_, mut span) = otel::new_span(&ctx.properties, &tracer, ctx.message_type());

        let handler = match self.selector.select(&ctx) {
            Ok(handler) => handler,
            Err(AmqpError::UnsupportedMessageType(msg_type)) => {
                let msg = "removing message from queue - reason: unsupported msg type";
                debug!(msg_type, "{}", msg);
                span.set_status(Status::Error {
                    description: Cow::from(msg),
                });

                if let Err(err) = ctx.reject(false).await {
                    error!(error = err.to_string(), "error whiling nack msg");
                }
                return;
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    delivery_tag = ctx.delivery_tag,
                    "no handler for delivery, leaving it unacknowledged"
                );
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("no handler for delivery"),
                });
                return;
            }
        };

        match AssertUnwindSafe(handler.handle(&ctx)).catch_unwind().await {
            Ok(Ok(())) => {
                debug!(delivery_tag = ctx.delivery_tag, "message successfully processed");
                match ctx.ack().await {
                    Ok(()) => span.set_status(Status::Ok),
                    Err(err) => {
                        error!(error = err.to_string(), "error whiling ack msg");
                        span.record_error(&err);
                        span.set_status(Status::Error {
                            description: Cow::from("error to ack msg"),
                        });
                    }
                }
            }
            Ok(Err(err)) => {
                error!(
                    error = err.to_string(),
                    delivery_tag = ctx.delivery_tag,
                    "error whiling handling msg, leaving it unacknowledged"
                );
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
            Err(_) => {
                error!(
                    delivery_tag = ctx.delivery_tag,
                    "handler panicked, leaving message unacknowledged"
                );
                span.set_status(Status::Error {
                    description: Cow::from("handler panicked"),
                });
            }
        }
    }
}
