// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Persistent Connection
//!
//! Owns the broker connection for its whole lifetime: it walks the configured
//! host candidates until one accepts, reconnects whenever the live connection
//! shuts down and schedules a delayed retry when every host fails. Lifecycle
//! changes are published through the `connected` and `disconnected`
//! notifiers. Disposal is terminal and suppresses every further attempt.

use crate::{
    config::{ChannelSettings, RabbitMQConfigs},
    driver::LapinTransport,
    errors::AmqpError,
    notifier::Notifier,
    retry::{ConnectionRetryTimer, RetryTimer},
    transport::{ChannelFactory, ChannelHandle, ConnectionHandle, DefaultChannelFactory, Transport},
};
use futures_util::{future::BoxFuture, FutureExt};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, RwLock, Weak,
};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a `PersistentConnection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disposed,
}

pub(crate) struct ConnectionInner {
    configs: RabbitMQConfigs,
    transport: Arc<dyn Transport>,
    channel_factory: Arc<dyn ChannelFactory>,
    retry_timer: Arc<dyn RetryTimer>,
    runtime: Handle,
    state: Mutex<ConnectionState>,
    current: RwLock<Option<Arc<dyn ConnectionHandle>>>,
    generation: AtomicU64,
    disposed: AtomicBool,
    connecting: tokio::sync::Mutex<()>,
    connected: Notifier,
    disconnected: Notifier,
}

/// A broker connection that survives broker restarts and network failures.
///
/// Cheap to clone; all clones share the same underlying connection.
#[derive(Clone)]
pub struct PersistentConnection {
    inner: Arc<ConnectionInner>,
}

impl PersistentConnection {
    /// Creates a disconnected instance. Nothing is attempted until
    /// `try_to_connect` is called.
    ///
    /// Must be called inside a tokio runtime: reconnects triggered from driver
    /// callbacks are spawned on it.
    pub fn new(
        configs: RabbitMQConfigs,
        transport: Arc<dyn Transport>,
        channel_factory: Arc<dyn ChannelFactory>,
        retry_timer: Arc<dyn RetryTimer>,
    ) -> Result<Self, AmqpError> {
        configs.validate()?;
        let runtime = Handle::try_current().map_err(|_| AmqpError::RuntimeUnavailable)?;

        Ok(PersistentConnection {
            inner: Arc::new(ConnectionInner {
                configs,
                transport,
                channel_factory,
                retry_timer,
                runtime,
                state: Mutex::new(ConnectionState::Disconnected),
                current: RwLock::new(None),
                generation: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
                connecting: tokio::sync::Mutex::new(()),
                connected: Notifier::new(),
                disconnected: Notifier::new(),
            }),
        })
    }

    /// Creates an instance backed by lapin, the default channel factory and a
    /// retry timer using `connection_retry_seconds`.
    pub fn lapin(configs: RabbitMQConfigs) -> Result<Self, AmqpError> {
        let retry_timer = Arc::new(ConnectionRetryTimer::new(configs.connection_retry_interval()));
        PersistentConnection::new(
            configs,
            Arc::new(LapinTransport),
            Arc::new(DefaultChannelFactory),
            retry_timer,
        )
    }

    /// Walks the host candidates in order until one accepts a connection.
    ///
    /// Fails with `Disposed` after disposal and with `ConnectionError` when no
    /// host accepted, in which case a retry has already been scheduled.
    pub fn try_to_connect(&self) -> BoxFuture<'static, Result<(), AmqpError>> {
        let this = self.clone();
        async move { this.connect_loop().await }.boxed()
    }

    async fn connect_loop(&self) -> Result<(), AmqpError> {
        let inner = &self.inner;
        if self.is_disposed() {
            warn!("connection disposed, not connecting");
            return Err(AmqpError::Disposed);
        }

        let _connecting = inner.connecting.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        if self.is_disposed() {
            return Err(AmqpError::Disposed);
        }

        self.set_state(ConnectionState::Connecting);
        debug!("trying to connect");

        for host in inner.configs.hosts.iter() {
            let handle = match inner.transport.connect(host, &inner.configs).await {
                Ok(handle) => handle,
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        host = host.host,
                        port = host.port,
                        vhost = inner.configs.vhost,
                        "failed to connect to broker"
                    );
                    continue;
                }
            };

            if self.is_disposed() {
                warn!(host = host.host, "connection disposed while connecting, abandoning");
                handle.close().await;
                return Err(AmqpError::Disposed);
            }

            if !self.install(handle) {
                warn!(
                    host = host.host,
                    port = host.port,
                    "connection closed before it could be used"
                );
                continue;
            }

            info!(
                host = host.host,
                port = host.port,
                vhost = inner.configs.vhost,
                "connected to rabbitmq"
            );
            inner.connected.notify();
            return Ok(());
        }

        self.set_state(ConnectionState::Disconnected);
        error!(
            "failed to connect to any broker, retrying in {} seconds",
            inner.retry_timer.interval().as_secs()
        );

        let weak = Arc::downgrade(&self.inner);
        inner.retry_timer.retry(Box::new(move || {
            if let Some(conn) = PersistentConnection::upgrade(&weak) {
                let runtime = conn.inner.runtime.clone();
                runtime.spawn(async move {
                    let _ = conn.try_to_connect().await;
                });
            }
        }));

        Err(AmqpError::ConnectionError)
    }

    /// Makes `handle` the live connection. Returns false, leaving nothing
    /// installed, when the handle is already closed.
    fn install(&self, handle: Arc<dyn ConnectionHandle>) -> bool {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(&self.inner);

        *self
            .inner
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle.clone());

        handle.on_shutdown(Box::new(move |reason| {
            if let Some(conn) = PersistentConnection::upgrade(&weak) {
                conn.on_shutdown(generation, reason);
            }
        }));

        // a shutdown before the callback was registered is never reported
        if !handle.is_open() {
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            self.inner
                .current
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            return false;
        }

        self.set_state(ConnectionState::Connected);
        true
    }

    fn on_shutdown(&self, generation: u64, reason: String) {
        if self.is_disposed() {
            return;
        }
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            debug!(reason, "ignoring shutdown of a replaced connection");
            return;
        }

        self.inner
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.set_state(ConnectionState::Disconnected);
        info!(reason, "disconnected from rabbitmq");
        self.inner.disconnected.notify();

        let this = self.clone();
        self.inner.runtime.spawn(async move {
            let _ = this.try_to_connect().await;
        });
    }

    /// Opens a configured channel on the live connection.
    pub async fn open_channel(
        &self,
        settings: &ChannelSettings,
    ) -> Result<Arc<dyn ChannelHandle>, AmqpError> {
        if self.is_disposed() {
            return Err(AmqpError::Disposed);
        }

        let handle = self
            .inner
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        match handle {
            Some(handle) if handle.is_open() => {
                self.inner.channel_factory.open_channel(&handle, settings).await
            }
            _ => Err(AmqpError::NotConnected),
        }
    }

    /// True while a connection handle exists, the transport reports it open and
    /// the instance is not disposed.
    pub fn is_connected(&self) -> bool {
        if self.is_disposed() {
            return false;
        }

        self.inner
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|handle| handle.is_open())
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fired after every successful connect.
    pub fn connected(&self) -> &Notifier {
        &self.inner.connected
    }

    /// Fired when a live connection shuts down.
    pub fn disconnected(&self) -> &Notifier {
        &self.inner.disconnected
    }

    pub fn configs(&self) -> &RabbitMQConfigs {
        &self.inner.configs
    }

    /// Delay between connect attempts.
    pub fn retry_interval(&self) -> std::time::Duration {
        self.inner.retry_timer.interval()
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnectionInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<ConnectionInner>) -> Option<PersistentConnection> {
        weak.upgrade().map(|inner| PersistentConnection { inner })
    }

    /// Stops reconnecting and closes the live connection. Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.set_state(ConnectionState::Disposed);
        self.inner.retry_timer.cancel();

        let handle = self
            .inner
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.close().await;
        }

        info!("rabbitmq connection disposed");
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if *current != ConnectionState::Disposed {
            *current = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::HostConfig,
        retry::MockRetryTimer,
        testing::{counter, eventually, FakeTransport},
    };
    use std::time::Duration;

    fn configs(hosts: &[&str]) -> RabbitMQConfigs {
        RabbitMQConfigs {
            hosts: hosts.iter().map(|h| HostConfig::new(h, 5672)).collect(),
            connection_retry_seconds: 1,
            ..RabbitMQConfigs::default()
        }
    }

    fn connection(transport: &Arc<FakeTransport>, hosts: &[&str]) -> PersistentConnection {
        PersistentConnection::new(
            configs(hosts),
            transport.clone(),
            Arc::new(DefaultChannelFactory),
            Arc::new(ConnectionRetryTimer::new(Duration::from_secs(1))),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn should_connect_and_notify() {
        let transport = FakeTransport::new();
        let conn = connection(&transport, &["rabbit-1"]);
        let connected = counter(conn.connected());

        conn.try_to_connect().await.unwrap();

        assert!(conn.is_connected());
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(connected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_walk_the_host_candidates() {
        let transport = FakeTransport::new();
        transport.set_host_unreachable("rabbit-1");
        let conn = connection(&transport, &["rabbit-1", "rabbit-2"]);

        conn.try_to_connect().await.unwrap();

        assert_eq!(transport.attempted_hosts(), vec!["rabbit-1", "rabbit-2"]);
        assert!(conn.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn should_retry_an_unreachable_host_after_the_retry_interval() {
        let transport = FakeTransport::new();
        transport.set_unreachable(true);
        let conn = connection(&transport, &["rabbit-1"]);

        let err = conn.try_to_connect().await.unwrap_err();
        assert_eq!(err, AmqpError::ConnectionError);
        assert_eq!(transport.attempts(), 1);
        assert!(!conn.is_connected());

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(transport.attempts(), 1);
        assert!(!conn.is_connected());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.attempts(), 2);
        assert!(!conn.is_connected());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn should_schedule_one_retry_when_every_host_fails() {
        let transport = FakeTransport::new();
        transport.set_unreachable(true);

        let mut timer = MockRetryTimer::new();
        timer
            .expect_interval()
            .return_const(Duration::from_secs(5));
        timer.expect_retry().times(1).return_const(());

        let conn = PersistentConnection::new(
            configs(&["rabbit-1", "rabbit-2"]),
            transport.clone(),
            Arc::new(DefaultChannelFactory),
            Arc::new(timer),
        )
        .unwrap();

        assert!(conn.try_to_connect().await.is_err());
        assert_eq!(transport.attempts(), 2);
    }

    #[tokio::test]
    async fn should_reconnect_after_a_shutdown() {
        let transport = FakeTransport::new();
        let conn = connection(&transport, &["rabbit-1"]);
        let connected = counter(conn.connected());
        let disconnected = counter(conn.disconnected());

        conn.try_to_connect().await.unwrap();
        transport.last_connection().unwrap().shutdown("connection reset");

        eventually(|| transport.connections().len() == 2 && conn.is_connected()).await;
        assert_eq!(connected.load(Ordering::SeqCst), 2);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_retry_when_the_connection_drops_while_connecting() {
        let transport = FakeTransport::new();
        transport.shut_down_next_connections(1);
        let conn = connection(&transport, &["rabbit-1"]);
        let connected = counter(conn.connected());

        let err = conn.try_to_connect().await.unwrap_err();
        assert_eq!(err, AmqpError::ConnectionError);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(connected.load(Ordering::SeqCst), 0);

        eventually(|| conn.is_connected()).await;
        assert_eq!(transport.connections().len(), 2);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(connected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_refuse_channels_while_disconnected() {
        let transport = FakeTransport::new();
        let conn = connection(&transport, &["rabbit-1"]);

        let err = conn
            .open_channel(&ChannelSettings::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err, AmqpError::NotConnected);

        conn.try_to_connect().await.unwrap();
        assert!(conn.open_channel(&ChannelSettings::default()).await.is_ok());
    }

    #[tokio::test]
    async fn should_stop_reconnecting_once_disposed() {
        let transport = FakeTransport::new();
        let conn = connection(&transport, &["rabbit-1"]);
        let disconnected = counter(conn.disconnected());

        conn.try_to_connect().await.unwrap();
        let live = transport.last_connection().unwrap();

        conn.dispose().await;
        conn.dispose().await;
        live.shutdown("closed by broker");
        tokio::task::yield_now().await;

        assert_eq!(live.closes(), 1);
        assert_eq!(disconnected.load(Ordering::SeqCst), 0);
        assert_eq!(transport.connections().len(), 1);
        assert_eq!(conn.state(), ConnectionState::Disposed);
        assert!(!conn.is_connected());
        assert_eq!(conn.try_to_connect().await.unwrap_err(), AmqpError::Disposed);
        assert_eq!(
            conn.open_channel(&ChannelSettings::default())
                .await
                .err()
                .unwrap(),
            AmqpError::Disposed
        );
    }
}
