//! Connection lifecycle: connect, retry with backoff, recreate channels, close.
//!
//! [`ConnectionManager`] is shared by the consumer and the publisher. Each role plugs its
//! own topology setup in through [`ChannelSetup`]; the manager takes care of everything else.
mod backoff;
mod error;
mod readiness;

pub use backoff::{Backoff, MAX_RECONNECT_WAIT_MS};
pub use error::{CloseError, ConnectionError};
pub use readiness::{Readiness, ReadyWaiter};

use crate::amqp::configuration::RabbitMqSettings;
use crate::amqp::{BrokerChannel, BrokerConnection, Transport, TransportError};
use crate::sync::lock;
use shutdown_handler::ShutdownHandler;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// The channel type handed out by a [`Transport`].
pub type ChannelOf<T> = <<T as Transport>::Connection as BrokerConnection>::Channel;

/// Where a [`ConnectionManager`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Nothing is running, or the last connection failed and a retry is scheduled.
    Disconnected,
    Connecting,
    /// A connection is open but no channel is usable yet.
    Connected,
    /// A channel is open and its topology has been set up.
    ChannelReady,
    /// Closed on request. Nothing happens until the next `connect`.
    Closed,
}

/// Role-specific work performed on every fresh channel before it is announced as ready.
#[async_trait::async_trait]
pub trait ChannelSetup<C: BrokerChannel>: Send + Sync + 'static {
    /// Declare topology and register subscriptions.
    ///
    /// The channel is discarded and a new one is requested if this fails.
    async fn setup(&self, channel: &ActiveChannel<C>) -> Result<(), TransportError>;

    /// The channel with the given generation, set up successfully earlier, is gone.
    fn channel_lost(&self, _generation: u64) {}
}

/// A channel that went through [`ChannelSetup::setup`].
///
/// The generation tells channels of the same manager apart: it grows with every channel.
#[derive(Clone)]
pub struct ActiveChannel<C> {
    pub generation: u64,
    pub channel: C,
}

/// Keeps a connection and a channel to the broker alive until told otherwise.
///
/// Every started session is driven by a supervisor task that reconnects with [`Backoff`]
/// on connection faults and recreates the channel on channel faults.
pub struct ConnectionManager<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T: Transport> {
    transport: T,
    settings: Arc<RabbitMqSettings>,
    backoff: Mutex<Backoff>,
    readiness: Readiness,
    session: Mutex<Session<T::Connection>>,
    channels: Mutex<ChannelSlot<ChannelOf<T>>>,
    /// Generation of the last channel reported as faulty by a role.
    channel_faults: watch::Sender<u64>,
}

struct Session<C> {
    lifecycle: Lifecycle,
    connection: Option<Arc<C>>,
    shutdown: Option<Arc<ShutdownHandler>>,
}

struct ChannelSlot<C> {
    last_generation: u64,
    active: Option<ActiveChannel<C>>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, settings: Arc<RabbitMqSettings>) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                settings,
                backoff: Mutex::new(Backoff::default()),
                readiness: Readiness::default(),
                session: Mutex::new(Session {
                    lifecycle: Lifecycle::Disconnected,
                    connection: None,
                    shutdown: None,
                }),
                channels: Mutex::new(ChannelSlot {
                    last_generation: 0,
                    active: None,
                }),
                channel_faults: watch::channel(0).0,
            }),
        }
    }

    pub fn settings(&self) -> &RabbitMqSettings {
        &self.inner.settings
    }

    /// The connection URL, password included.
    pub fn url(&self) -> String {
        self.inner.settings.url()
    }

    pub fn state(&self) -> Lifecycle {
        lock(&self.inner.session).lifecycle
    }

    /// Every time a channel becomes ready a `()` is sent on the returned receiver.
    pub fn subscribe_ready(&self) -> broadcast::Receiver<()> {
        self.inner.readiness.subscribe()
    }

    /// Forget about previous failures: the next retry happens straight away.
    pub fn reset_backoff(&self) {
        lock(&self.inner.backoff).reset();
    }

    /// The channel currently in use, if any.
    pub fn active_channel(&self) -> Option<ActiveChannel<ChannelOf<T>>> {
        lock(&self.inner.channels).active.clone()
    }

    /// Start a session if none is running and wait until a channel is ready.
    ///
    /// Resolves immediately if a channel is ready already. Connection failures are not
    /// reported here: they are retried until the session is closed, in which case
    /// [`ConnectionError::Closed`] is returned.
    pub async fn connect<S>(&self, setup: Arc<S>) -> Result<(), ConnectionError>
    where
        S: ChannelSetup<ChannelOf<T>>,
    {
        self.start(setup);
        self.channel_ready_after(None).await.map(|_| ())
    }

    /// Start a session if none is running, without waiting for it.
    pub fn start<S>(&self, setup: Arc<S>)
    where
        S: ChannelSetup<ChannelOf<T>>,
    {
        let shutdown = {
            let mut session = lock(&self.inner.session);
            if session.shutdown.is_some() {
                return;
            }
            let shutdown = Arc::new(ShutdownHandler::new());
            session.shutdown = Some(Arc::clone(&shutdown));
            session.lifecycle = Lifecycle::Connecting;
            shutdown
        };
        tokio::spawn(supervise(Arc::clone(&self.inner), setup, shutdown));
    }

    /// Wait for a ready channel newer than `previous`.
    ///
    /// With `previous` set to `None` any ready channel will do.
    pub async fn channel_ready_after(
        &self,
        previous: Option<u64>,
    ) -> Result<ActiveChannel<ChannelOf<T>>, ConnectionError> {
        loop {
            // Register before looking, a firing in between would be lost otherwise.
            let waiter = self.inner.readiness.next();
            if let Some(active) = self.active_channel() {
                if previous.map_or(true, |generation| active.generation > generation) {
                    return Ok(active);
                }
            }
            if lock(&self.inner.session).shutdown.is_none() {
                return Err(ConnectionError::Closed);
            }
            waiter.wait().await?;
        }
    }

    /// Report that an operation on `faulty` failed: it is replaced with a new channel.
    ///
    /// Reports about a channel that has been replaced already are ignored.
    pub fn report_channel_fault(&self, faulty: &ActiveChannel<ChannelOf<T>>) {
        let is_current = lock(&self.inner.channels)
            .active
            .as_ref()
            .map_or(false, |active| active.generation == faulty.generation);
        if is_current {
            self.inner.channel_faults.send_replace(faulty.generation);
        }
    }

    /// Stop the running session and close its connection.
    ///
    /// Pending retries are cancelled. Completes straight away if there is no connection.
    #[tracing::instrument(name = "rabbitmq_close", skip(self))]
    pub async fn close(&self) -> Result<(), CloseError> {
        let Some(connection) = self.inner.end_session() else {
            return Ok(());
        };
        info!("Closing the connection with RabbitMq");
        connection.close().await.map_err(CloseError)
    }

    /// Stop the running session without waiting for its connection to be closed.
    ///
    /// The connection is closed in the background, provided a tokio runtime is available.
    pub fn shutdown(&self) {
        let Some(connection) = self.inner.end_session() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = connection.close().await {
                    warn!("Failed to close a RabbitMq connection: {:?}", e);
                }
            });
        }
    }
}

impl<T: Transport> Inner<T> {
    fn is_current(session: &Session<T::Connection>, shutdown: &Arc<ShutdownHandler>) -> bool {
        session
            .shutdown
            .as_ref()
            .map_or(false, |current| Arc::ptr_eq(current, shutdown))
    }

    fn set_lifecycle(&self, shutdown: &Arc<ShutdownHandler>, lifecycle: Lifecycle) {
        let mut session = lock(&self.session);
        if Self::is_current(&session, shutdown) {
            session.lifecycle = lifecycle;
        }
    }

    /// Signal the running session to stop, dropping its channel and the pending waiters.
    ///
    /// The connection, if any, is handed over to the caller for closing.
    fn end_session(&self) -> Option<Arc<T::Connection>> {
        let mut session = lock(&self.session);
        let connection = session.connection.take();
        if let Some(shutdown) = session.shutdown.take() {
            session.lifecycle = Lifecycle::Closed;
            shutdown.shutdown();
        }
        lock(&self.channels).active = None;
        self.readiness.abandon();
        connection
    }

    /// Store a fresh connection, unless the session has been closed in the meantime.
    fn attach(&self, shutdown: &Arc<ShutdownHandler>, connection: Arc<T::Connection>) -> bool {
        let mut session = lock(&self.session);
        if !Self::is_current(&session, shutdown) {
            return false;
        }
        session.connection = Some(connection);
        session.lifecycle = Lifecycle::Connected;
        true
    }

    /// Forget about a failed connection.
    fn detach(&self, shutdown: &Arc<ShutdownHandler>, connection: &Arc<T::Connection>) {
        let mut session = lock(&self.session);
        let attached = session
            .connection
            .as_ref()
            .map_or(false, |current| Arc::ptr_eq(current, connection));
        if attached {
            session.connection = None;
        }
        if Self::is_current(&session, shutdown) {
            session.lifecycle = Lifecycle::Disconnected;
        }
    }

    fn next_generation(&self) -> u64 {
        let mut channels = lock(&self.channels);
        channels.last_generation += 1;
        channels.last_generation
    }

    /// Publish a set up channel, unless the session has been closed in the meantime.
    fn activate(&self, shutdown: &Arc<ShutdownHandler>, channel: ActiveChannel<ChannelOf<T>>) {
        let mut session = lock(&self.session);
        if Self::is_current(&session, shutdown) {
            lock(&self.channels).active = Some(channel);
            session.lifecycle = Lifecycle::ChannelReady;
        }
    }

    /// Withdraw the channel with the given generation, if it is still the active one.
    fn deactivate(&self, generation: u64) {
        let mut channels = lock(&self.channels);
        if channels
            .active
            .as_ref()
            .map_or(false, |active| active.generation == generation)
        {
            channels.active = None;
        }
    }
}

async fn supervise<T, S>(inner: Arc<Inner<T>>, setup: Arc<S>, shutdown: Arc<ShutdownHandler>)
where
    T: Transport,
    S: ChannelSetup<ChannelOf<T>>,
{
    // Generation of the channel currently set up for this session, 0 if none.
    let current = AtomicU64::new(0);
    run_session(&inner, setup.as_ref(), &shutdown, &current).await;
    let generation = current.swap(0, Ordering::SeqCst);
    if generation != 0 {
        inner.deactivate(generation);
        setup.channel_lost(generation);
    }
    debug!("RabbitMq session stopped");
}

/// Connect, serve, reconnect. Only returns once the session has been shut down.
async fn run_session<T, S>(
    inner: &Inner<T>,
    setup: &S,
    shutdown: &Arc<ShutdownHandler>,
    current: &AtomicU64,
) where
    T: Transport,
    S: ChannelSetup<ChannelOf<T>>,
{
    loop {
        inner.set_lifecycle(shutdown, Lifecycle::Connecting);
        info!(
            "Connecting to RabbitMq at {}",
            inner.settings.redacted_url()
        );
        // Never raced against shutdown: a dropped handshake keeps going in the background.
        // Bounded by the connection timeout.
        let attempt = inner.transport.connect().await;

        match attempt {
            Ok(connection) => {
                let connection = Arc::new(connection);
                if !inner.attach(shutdown, Arc::clone(&connection)) {
                    debug!("Session closed while connecting, closing the new connection");
                    if let Err(e) = connection.close().await {
                        warn!("Failed to close a RabbitMq connection: {:?}", e);
                    }
                    return;
                }
                lock(&inner.backoff).reset();
                info!("Connected to RabbitMq");

                let serve = serve_connection(inner, setup, shutdown, connection.as_ref(), current);
                // The connection is closed by whoever shut the session down.
                let fault = tokio::select! {
                    biased;
                    _ = shutdown.wait_for_signal() => return,
                    fault = serve => fault,
                };

                let generation = current.swap(0, Ordering::SeqCst);
                if generation != 0 {
                    inner.deactivate(generation);
                    setup.channel_lost(generation);
                }
                inner.detach(shutdown, &connection);
                error!("RabbitMq connection failed: {:?}", fault);
            }
            Err(e) => {
                inner.set_lifecycle(shutdown, Lifecycle::Disconnected);
                error!("Failed to connect to RabbitMq: {:?}", e);
            }
        }

        let delay = lock(&inner.backoff).next_delay();
        debug!("Reconnecting to RabbitMq in {} ms", delay.as_millis());
        tokio::select! {
            biased;
            _ = shutdown.wait_for_signal() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Keep a ready channel on `connection`. Returns the fault that took the connection down.
async fn serve_connection<T, S>(
    inner: &Inner<T>,
    setup: &S,
    shutdown: &Arc<ShutdownHandler>,
    connection: &T::Connection,
    current: &AtomicU64,
) -> TransportError
where
    T: Transport,
    S: ChannelSetup<ChannelOf<T>>,
{
    let retry_delay = inner.settings.channel_retry_delay();
    loop {
        inner.set_lifecycle(shutdown, Lifecycle::Connected);
        let created = tokio::select! {
            fault = connection.closed() => return fault,
            created = connection.create_channel(inner.settings.confirm_channel) => created,
        };
        let channel = match created {
            Ok(channel) => ActiveChannel {
                generation: inner.next_generation(),
                channel,
            },
            Err(e) => {
                error!("Failed to create a RabbitMq channel: {:?}", e);
                pace(retry_delay).await;
                continue;
            }
        };

        let set_up = tokio::select! {
            fault = connection.closed() => return fault,
            set_up = setup.setup(&channel) => set_up,
        };
        if let Err(e) = set_up {
            error!("Failed to set up a RabbitMq channel: {:?}", e);
            pace(retry_delay).await;
            continue;
        }

        let generation = channel.generation;
        let mut fault_reports = inner.channel_faults.subscribe();
        current.store(generation, Ordering::SeqCst);
        inner.activate(shutdown, channel.clone());
        inner.readiness.fire();
        debug!(generation, "RabbitMq channel ready");

        let fault = tokio::select! {
            fault = connection.closed() => return fault,
            fault = channel.channel.closed() => fault,
            _ = reported_fault(&mut fault_reports, generation) => {
                TransportError::from(anyhow::anyhow!("An operation on the channel failed"))
            }
        };
        current.store(0, Ordering::SeqCst);
        inner.deactivate(generation);
        setup.channel_lost(generation);
        error!("RabbitMq channel failed, re-creating it: {:?}", fault);
    }
}

/// Resolves once a fault has been reported for the channel with the given generation.
async fn reported_fault(reports: &mut watch::Receiver<u64>, generation: u64) {
    loop {
        if *reports.borrow_and_update() == generation {
            return;
        }
        if reports.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

/// Pause between two channel attempts. Without a configured delay we only yield, to let
/// the rest of the runtime make progress.
async fn pace(delay: Duration) {
    if delay.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(delay).await;
    }
}
