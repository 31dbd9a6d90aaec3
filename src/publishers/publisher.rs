use crate::amqp::configuration::RabbitMqSettings;
use crate::amqp::{
    BrokerChannel, ConnectionFactory, PendingConfirmation, PublishOutcome, Transport,
    TransportError,
};
use crate::connection::{
    ActiveChannel, ChannelSetup, CloseError, ConnectionError, ConnectionManager, Lifecycle,
};
use crate::publishers::{Payload, PublishOptions};
use crate::sync::lock;
use futures_util::FutureExt;
use lapin::message::BasicReturnMessage;
use lapin::publisher_confirm::Confirmation;
use shutdown_handler::ShutdownHandler;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// AMQP reply code returned with messages that could not be routed to any queue.
///
/// See <https://www.rabbitmq.com/amqp-0-9-1-reference.html#constants>
const NO_ROUTE: u16 = 312;

/// Publishes messages to the configured exchange, holding them while no channel is usable.
///
/// # Fault tolerance
///
/// [`Publisher::publish`] never fails because the broker is unreachable: messages are
/// queued and handed over to the channel, in submission order, as soon as one is ready.
/// The publisher reconnects on its own when the connection or the channel breaks.
///
/// # Backpressure
///
/// When the channel cannot take more messages, the first queued message is kept at the
/// head of the queue until the channel drains or a new channel becomes ready. Nothing is
/// dropped or sent twice.
///
/// ```rust,no_run
/// use carrot_tether::amqp::configuration::RabbitMqSettings;
/// use carrot_tether::publishers::{Payload, PublishOptions, Publisher};
///
/// # async fn run() -> Result<(), anyhow::Error> {
/// let publisher = Publisher::new(RabbitMqSettings::default())?;
/// publisher.connect().await?;
/// publisher
///     .publish("hello", PublishOptions::default(), None)
///     .await?;
/// publisher
///     .publish(Payload::json(&[1, 2, 3])?, PublishOptions::default(), Some("numbers"))
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Publisher<T: Transport = ConnectionFactory> {
    manager: ConnectionManager<T>,
    topology: Arc<PublisherTopology>,
    outbound: Arc<Outbound>,
    dispatch: Mutex<DispatchState>,
}

/// Error returned when trying to publish a message using `Publisher`.
#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("Failed to serialize the message payload")]
    Serialization(#[source] serde_json::Error),
    #[error("Generic error encountered when interacting with the RabbitMq broker")]
    GenericError(#[source] anyhow::Error),
    #[error("The message could not be routed: {0:?}")]
    UnroutableMessage(Box<BasicReturnMessage>),
    #[error("The RabbitMq broker nacked the publishing of the message: {0:?}")]
    NegativeAck(Option<Box<BasicReturnMessage>>),
    #[error("The publisher went away before the outcome of the publishing was known")]
    Dropped,
}

/// The outcome of a [`Publisher::publish`] call.
///
/// Outside confirm mode it resolves once the message has been handed over to the channel.
/// On a confirm channel it resolves once the broker acknowledged (or refused) the message.
/// Dropping it does not cancel the publishing.
#[must_use = "the message is published either way, but errors go unnoticed unless awaited"]
pub struct PendingPublish(oneshot::Receiver<Result<(), PublisherError>>);

impl Future for PendingPublish {
    type Output = Result<(), PublisherError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(PublisherError::Dropped)))
    }
}

impl Publisher<ConnectionFactory> {
    /// Create a publisher for the broker described by `settings`.
    ///
    /// Nothing happens on the network until [`Publisher::connect`] is called, but messages
    /// can be submitted already.
    pub fn new(settings: RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let factory = ConnectionFactory::new_from_config(&settings)?;
        Ok(Self::with_transport(factory, settings))
    }
}

impl<T: Transport> Publisher<T> {
    pub fn with_transport(transport: T, settings: RabbitMqSettings) -> Self {
        let settings = Arc::new(settings);
        Self {
            manager: ConnectionManager::new(transport, Arc::clone(&settings)),
            topology: Arc::new(PublisherTopology { settings }),
            outbound: Arc::new(Outbound::default()),
            dispatch: Mutex::new(DispatchState::default()),
        }
    }

    /// Connect and declare the exchange. Resolves once a channel is ready.
    ///
    /// Queued messages start flowing at that point.
    #[tracing::instrument(name = "publisher_connect", skip(self))]
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.manager.start(Arc::clone(&self.topology));
        self.start_dispatcher();
        self.manager.connect(Arc::clone(&self.topology)).await
    }

    /// Close the connection.
    ///
    /// Messages still waiting for a channel stay queued: a later [`Publisher::connect`]
    /// sends them.
    pub async fn close(&self) -> Result<(), CloseError> {
        self.stop_dispatcher();
        self.manager.close().await
    }

    /// Queue a message for publishing on the configured exchange.
    ///
    /// `routing_key` defaults to the configured one.
    pub fn publish(
        &self,
        payload: impl Into<Payload>,
        options: PublishOptions,
        routing_key: Option<&str>,
    ) -> PendingPublish {
        let (done, outcome) = oneshot::channel();
        let routing_key = routing_key
            .unwrap_or(&self.topology.settings.routing_key)
            .to_owned();
        self.outbound.push(OutboundMessage {
            payload: payload.into(),
            options,
            routing_key,
            done,
        });
        PendingPublish(outcome)
    }

    /// How many messages are waiting to be handed over to a channel.
    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    pub fn url(&self) -> String {
        self.manager.url()
    }

    pub fn state(&self) -> Lifecycle {
        self.manager.state()
    }

    /// Receives a `()` every time the publisher becomes ready.
    pub fn subscribe_ready(&self) -> broadcast::Receiver<()> {
        self.manager.subscribe_ready()
    }

    fn start_dispatcher(&self) {
        let mut dispatch = lock(&self.dispatch);
        if dispatch.running.is_some() {
            return;
        }
        let stop = Arc::new(ShutdownHandler::new());
        // A single dispatcher at a time: the new one waits for the previous one to wind down.
        let previous = dispatch.retiring.take();
        let task = tokio::spawn({
            let manager = self.manager.clone();
            let outbound = Arc::clone(&self.outbound);
            let exchange = self.topology.settings.exchange.name.clone();
            let stop = Arc::clone(&stop);
            async move {
                if let Some(previous) = previous {
                    let _ = previous.await;
                }
                dispatch_messages(manager, outbound, exchange, stop).await;
            }
        });
        dispatch.running = Some(Dispatcher { stop, task });
    }

    fn stop_dispatcher(&self) {
        let mut dispatch = lock(&self.dispatch);
        if let Some(dispatcher) = dispatch.running.take() {
            dispatcher.stop.shutdown();
            dispatch.retiring = Some(dispatcher.task);
        }
    }
}

impl<T: Transport> Drop for Publisher<T> {
    fn drop(&mut self) {
        self.stop_dispatcher();
        self.manager.shutdown();
    }
}

struct PublisherTopology {
    settings: Arc<RabbitMqSettings>,
}

#[async_trait::async_trait]
impl<C: BrokerChannel> ChannelSetup<C> for PublisherTopology {
    #[tracing::instrument(
        name = "publisher_setup",
        skip_all,
        fields(generation = active.generation)
    )]
    async fn setup(&self, active: &ActiveChannel<C>) -> Result<(), TransportError> {
        info!("Declaring exchange {}", self.settings.exchange.name);
        active.channel.assert_exchange(&self.settings.exchange).await
    }
}

#[derive(Default)]
struct DispatchState {
    running: Option<Dispatcher>,
    retiring: Option<JoinHandle<()>>,
}

struct Dispatcher {
    stop: Arc<ShutdownHandler>,
    task: JoinHandle<()>,
}

struct OutboundMessage {
    payload: Payload,
    options: PublishOptions,
    routing_key: String,
    done: oneshot::Sender<Result<(), PublisherError>>,
}

/// The FIFO of messages waiting for a channel.
#[derive(Default)]
struct Outbound {
    queue: Mutex<VecDeque<OutboundMessage>>,
    pushed: Notify,
}

impl Outbound {
    fn push(&self, message: OutboundMessage) {
        lock(&self.queue).push_back(message);
        self.pushed.notify_one();
    }

    fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    /// What is needed to publish the head of the queue, leaving it in place.
    fn peek(&self) -> Option<(Payload, PublishOptions, String)> {
        lock(&self.queue).front().map(|message| {
            (
                message.payload.clone(),
                message.options.clone(),
                message.routing_key.clone(),
            )
        })
    }

    fn pop(&self) -> Option<OutboundMessage> {
        lock(&self.queue).pop_front()
    }
}

/// Hand queued messages over to the channel, one at a time, until stopped.
async fn dispatch_messages<T: Transport>(
    manager: ConnectionManager<T>,
    outbound: Arc<Outbound>,
    exchange: String,
    stop: Arc<ShutdownHandler>,
) {
    // The last channel known to be broken.
    let mut faulty: Option<u64> = None;
    loop {
        let Some((payload, options, routing_key)) = outbound.peek() else {
            tokio::select! {
                biased;
                _ = stop.wait_for_signal() => return,
                _ = outbound.pushed.notified() => {}
            }
            continue;
        };

        let active = tokio::select! {
            biased;
            _ = stop.wait_for_signal() => return,
            ready = manager.channel_ready_after(faulty) => match ready {
                Ok(active) => active,
                Err(_) => return,
            },
        };

        let outcome = active
            .channel
            .publish(
                &exchange,
                &routing_key,
                payload.as_bytes(),
                options.flags,
                options.properties,
            )
            .await;
        match outcome {
            Ok(PublishOutcome::Written(confirmation)) => {
                if let Some(message) = outbound.pop() {
                    settle(message.done, confirmation);
                }
            }
            Ok(PublishOutcome::BufferFull) => {
                debug!("The channel write buffer is full, waiting for it to drain");
                tokio::select! {
                    biased;
                    _ = stop.wait_for_signal() => return,
                    _ = manager.channel_ready_after(Some(active.generation)) => {}
                    _ = active.channel.drained() => {}
                }
            }
            Err(e) => {
                error!("Failed to publish a message, replacing the channel: {:?}", e);
                manager.report_channel_fault(&active);
                faulty = Some(active.generation);
            }
        }
    }
}

/// Forward the broker's verdict on a published message to whoever is waiting for it.
fn settle(done: oneshot::Sender<Result<(), PublisherError>>, mut confirmation: PendingConfirmation) {
    // Channels without publisher confirms answer straight away.
    match (&mut confirmation).now_or_never() {
        Some(confirmation) => {
            let _ = done.send(outcome(confirmation));
        }
        None => {
            tokio::spawn(async move {
                let _ = done.send(outcome(confirmation.await));
            });
        }
    }
}

fn outcome(confirmation: Result<Confirmation, TransportError>) -> Result<(), PublisherError> {
    match confirmation.map_err(|e| PublisherError::GenericError(e.into()))? {
        Confirmation::Ack(Some(returned)) if returned.reply_code == NO_ROUTE => {
            Err(PublisherError::UnroutableMessage(returned))
        }
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        Confirmation::Nack(returned) => Err(PublisherError::NegativeAck(returned)),
    }
}
