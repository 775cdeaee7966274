// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection and Channel Configuration
//!
//! This module holds the small set of named options the resilient layer needs:
//! the broker host candidates and credentials, the connection retry interval,
//! the publish retry backoff and the per-channel QoS/confirm settings.
//! Configurations can be loaded from the environment or from JSON.

use crate::errors::AmqpError;
use serde::Deserialize;
use std::time::Duration;

/// Default AMQP port
pub const DEFAULT_PORT: u16 = 5672;
/// Default number of unacknowledged deliveries a channel may hold
pub const DEFAULT_PREFETCH_COUNT: u16 = 50;
/// Default delay before a failed connect attempt is retried
pub const DEFAULT_CONNECTION_RETRY_SECONDS: u16 = 5;
/// Default delay before a failed publish is retried
pub const DEFAULT_PUBLISH_RETRY_MILLIS: u64 = 1000;

/// A single broker host candidate.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl HostConfig {
    /// Creates a host candidate.
    pub fn new(host: &str, port: u16) -> Self {
        HostConfig {
            host: host.to_owned(),
            port,
        }
    }

    /// Parses `host` or `host:port`, falling back to `default_port`.
    pub fn parse(value: &str, default_port: u16) -> Result<Self, AmqpError> {
        let value = value.trim();
        match value.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| AmqpError::InvalidConfig(format!("invalid port in `{}`", value)))?;
                Ok(HostConfig::new(host, port))
            }
            None => Ok(HostConfig::new(value, default_port)),
        }
    }
}

/// Immutable per-channel settings.
///
/// Supplied once when a persistent channel is initialised and read-only afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    pub prefetch_count: u16,
    pub publisher_confirms: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        ChannelSettings {
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            publisher_confirms: false,
        }
    }
}

impl ChannelSettings {
    /// Sets the QoS prefetch limit.
    pub fn prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    /// Enables broker publisher acknowledgements.
    pub fn with_publisher_confirms(mut self) -> Self {
        self.publisher_confirms = true;
        self
    }
}

/// RabbitMQ connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub app_name: String,
    pub hosts: Vec<HostConfig>,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connection_retry_seconds: u16,
    pub publish_retry_millis: u64,
    pub prefetch_count: u16,
    pub publisher_confirms: bool,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            app_name: "resilient-rabbitmq".to_owned(),
            hosts: vec![HostConfig::new("localhost", DEFAULT_PORT)],
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            connection_retry_seconds: DEFAULT_CONNECTION_RETRY_SECONDS,
            publish_retry_millis: DEFAULT_PUBLISH_RETRY_MILLIS,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            publisher_confirms: false,
        }
    }
}

impl RabbitMQConfigs {
    /// Loads the configuration from the process environment.
    ///
    /// Unset variables keep their default value.
    pub fn from_env() -> Result<Self, AmqpError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration through an arbitrary key lookup.
    ///
    /// Recognised keys: `APP_NAME`, `RABBITMQ_HOST` (comma separated list of
    /// `host[:port]`), `RABBITMQ_PORT`, `RABBITMQ_USER`, `RABBITMQ_PASSWORD`,
    /// `RABBITMQ_VHOST`, `RABBITMQ_CONNECTION_RETRY_SECONDS`,
    /// `RABBITMQ_PUBLISH_RETRY_MILLIS`, `RABBITMQ_PREFETCH_COUNT` and
    /// `RABBITMQ_PUBLISHER_CONFIRMS`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = RabbitMQConfigs::default();

        if let Some(name) = lookup("APP_NAME") {
            cfg.app_name = name;
        }

        let port = match lookup("RABBITMQ_PORT") {
            Some(value) => parse_value::<u16>("RABBITMQ_PORT", &value)?,
            None => DEFAULT_PORT,
        };

        if let Some(hosts) = lookup("RABBITMQ_HOST") {
            cfg.hosts = hosts
                .split(',')
                .filter(|h| !h.trim().is_empty())
                .map(|h| HostConfig::parse(h, port))
                .collect::<Result<Vec<_>, _>>()?;
        } else {
            for host in cfg.hosts.iter_mut() {
                host.port = port;
            }
        }

        if let Some(user) = lookup("RABBITMQ_USER") {
            cfg.user = user;
        }
        if let Some(password) = lookup("RABBITMQ_PASSWORD") {
            cfg.password = password;
        }
        if let Some(vhost) = lookup("RABBITMQ_VHOST") {
            cfg.vhost = vhost;
        }
        if let Some(value) = lookup("RABBITMQ_CONNECTION_RETRY_SECONDS") {
            cfg.connection_retry_seconds =
                parse_value("RABBITMQ_CONNECTION_RETRY_SECONDS", &value)?;
        }
        if let Some(value) = lookup("RABBITMQ_PUBLISH_RETRY_MILLIS") {
            cfg.publish_retry_millis = parse_value("RABBITMQ_PUBLISH_RETRY_MILLIS", &value)?;
        }
        if let Some(value) = lookup("RABBITMQ_PREFETCH_COUNT") {
            cfg.prefetch_count = parse_value("RABBITMQ_PREFETCH_COUNT", &value)?;
        }
        if let Some(value) = lookup("RABBITMQ_PUBLISHER_CONFIRMS") {
            cfg.publisher_confirms = parse_value("RABBITMQ_PUBLISHER_CONFIRMS", &value)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Parses a JSON document; missing fields keep their default value.
    pub fn from_json(raw: &str) -> Result<Self, AmqpError> {
        let cfg: RabbitMQConfigs =
            serde_json::from_str(raw).map_err(|err| AmqpError::InvalidConfig(err.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks the configuration can be used to connect.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.hosts.is_empty() {
            return Err(AmqpError::InvalidConfig("at least one host is required".to_owned()));
        }
        if let Some(host) = self.hosts.iter().find(|h| h.host.is_empty() || h.port == 0) {
            return Err(AmqpError::InvalidConfig(format!(
                "invalid host `{}:{}`",
                host.host, host.port
            )));
        }
        if self.connection_retry_seconds == 0 {
            return Err(AmqpError::InvalidConfig(
                "connection_retry_seconds must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }

    /// Delay before a failed connect attempt is retried.
    pub fn connection_retry_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.connection_retry_seconds))
    }

    /// Delay before a failed publish is retried.
    pub fn publish_retry_interval(&self) -> Duration {
        Duration::from_millis(self.publish_retry_millis)
    }

    /// Channel settings derived from this configuration.
    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            prefetch_count: self.prefetch_count,
            publisher_confirms: self.publisher_confirms,
        }
    }

    /// Renders the AMQP URI for one host candidate.
    pub fn uri(&self, host: &HostConfig) -> String {
        let vhost = if self.vhost == "/" {
            "%2f"
        } else {
            self.vhost.trim_start_matches('/')
        };

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, host.host, host.port, vhost
        )
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, AmqpError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| AmqpError::InvalidConfig(format!("invalid value `{}` for {}", value, key)))
}
