use crate::amqp::configuration::RabbitMqSettings;
use crate::amqp::{BrokerChannel, ConnectionFactory, DeliveryStream, Transport, TransportError};
use crate::connection::{
    ActiveChannel, ChannelOf, ChannelSetup, CloseError, ConnectionError, ConnectionManager,
    Lifecycle,
};
use crate::consumers::{Handler, IgnoreMessages, Incoming};
use crate::sync::lock;
use futures_util::StreamExt;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

type SharedHandler<C> = Arc<Mutex<Arc<dyn Handler<C>>>>;

/// A RabbitMq consumer that survives connection and channel failures.
///
/// On every fresh channel the consumer declares its exchange and queue, binds them together
/// with the configured routing key and subscribes to the queue. Each message is handed to
/// the current [`Handler`], one at a time, in the order the broker delivered them.
///
/// ```rust,no_run
/// use carrot_tether::amqp::configuration::RabbitMqSettings;
/// use carrot_tether::consumers::{ClosureHandler, Consumer, Incoming};
/// use carrot_tether::amqp::AmqpChannel;
/// use std::sync::Arc;
///
/// # async fn run() -> Result<(), anyhow::Error> {
/// let consumer = Consumer::new(RabbitMqSettings::default())?;
/// consumer.set_message_handler(Some(Arc::new(ClosureHandler(
///     |incoming: Incoming<AmqpChannel>| async move {
///         println!("{}", incoming.body);
///         Ok::<_, anyhow::Error>(())
///     },
/// ))));
/// consumer.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct Consumer<T: Transport = ConnectionFactory> {
    manager: ConnectionManager<T>,
    topology: Arc<ConsumerTopology<T>>,
}

impl Consumer<ConnectionFactory> {
    /// Create a consumer talking to the broker described by `settings`.
    ///
    /// Nothing happens on the network until [`Consumer::start`] is called.
    pub fn new(settings: RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let factory = ConnectionFactory::new_from_config(&settings)?;
        Ok(Self::with_transport(factory, settings))
    }
}

impl<T: Transport> Consumer<T> {
    pub fn with_transport(transport: T, settings: RabbitMqSettings) -> Self {
        let settings = Arc::new(settings);
        let manager = ConnectionManager::new(transport, Arc::clone(&settings));
        Self {
            manager: manager.clone(),
            topology: Arc::new(ConsumerTopology {
                settings,
                manager,
                handler: Arc::new(Mutex::new(Arc::new(IgnoreMessages))),
                queue_name: Mutex::new(None),
            }),
        }
    }

    /// Connect and subscribe. Resolves once messages are flowing.
    ///
    /// Previous connection failures are forgotten: the first attempt happens straight away.
    #[tracing::instrument(name = "consumer_start", skip(self))]
    pub async fn start(&self) -> Result<(), ConnectionError> {
        self.manager.reset_backoff();
        self.manager.connect(Arc::clone(&self.topology)).await
    }

    /// Close the connection. Messages stop flowing and no reconnection is attempted.
    pub async fn stop(&self) -> Result<(), CloseError> {
        self.manager.close().await
    }

    /// Replace the message handler. `None` installs a handler that ignores every message.
    ///
    /// Takes effect from the next message onwards.
    pub fn set_message_handler(&self, handler: Option<Arc<dyn Handler<ChannelOf<T>>>>) {
        let handler = handler.unwrap_or_else(|| Arc::new(IgnoreMessages));
        *lock(&self.topology.handler) = handler;
    }

    /// The queue messages are consumed from.
    ///
    /// `None` until the queue has been declared: names generated by the broker are only
    /// known at that point.
    pub fn queue_name(&self) -> Option<String> {
        lock(&self.topology.queue_name).clone()
    }

    pub fn url(&self) -> String {
        self.manager.url()
    }

    pub fn state(&self) -> Lifecycle {
        self.manager.state()
    }

    /// Receives a `()` every time the consumer becomes ready.
    pub fn subscribe_ready(&self) -> broadcast::Receiver<()> {
        self.manager.subscribe_ready()
    }
}

impl<T: Transport> Drop for Consumer<T> {
    fn drop(&mut self) {
        self.manager.shutdown();
    }
}

struct ConsumerTopology<T: Transport> {
    settings: Arc<RabbitMqSettings>,
    /// Told about subscriptions that end while their channel stays open.
    manager: ConnectionManager<T>,
    handler: SharedHandler<ChannelOf<T>>,
    queue_name: Mutex<Option<String>>,
}

#[async_trait::async_trait]
impl<T: Transport> ChannelSetup<ChannelOf<T>> for ConsumerTopology<T> {
    #[tracing::instrument(
        name = "consumer_setup",
        skip_all,
        fields(generation = active.generation)
    )]
    async fn setup(&self, active: &ActiveChannel<ChannelOf<T>>) -> Result<(), TransportError> {
        let settings = &self.settings;
        let channel = &active.channel;

        channel.assert_exchange(&settings.exchange).await?;
        let queue_name = channel.assert_queue(&settings.queue).await?;
        info!(
            "Binding queue {} to exchange {} with routing key {}",
            queue_name, settings.exchange.name, settings.routing_key
        );
        channel
            .bind_queue(
                &queue_name,
                &settings.exchange.name,
                &settings.routing_key,
                settings.queue.bind_arguments_table(),
            )
            .await?;
        let deliveries = channel.consume(&queue_name, &settings.consume).await?;

        *lock(&self.queue_name) = Some(queue_name.clone());
        tokio::spawn(handle_deliveries(
            deliveries,
            active.clone(),
            self.manager.clone(),
            Arc::clone(&self.handler),
            queue_name,
        ));
        Ok(())
    }
}

/// Feed deliveries to the handler, one at a time, until the stream ends.
#[tracing::instrument(skip_all, name = "consumer_run", fields(queue_name = %queue_name))]
async fn handle_deliveries<T: Transport>(
    mut deliveries: DeliveryStream,
    active: ActiveChannel<ChannelOf<T>>,
    manager: ConnectionManager<T>,
    handler: SharedHandler<ChannelOf<T>>,
    queue_name: String,
) {
    while let Some(delivery) = deliveries.next().await {
        let message = match delivery {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to receive a message from RabbitMq: {:?}", e);
                break;
            }
        };
        let delivery_tag = message.delivery_tag;
        let current = Arc::clone(&*lock(&handler));
        if let Err(e) = current.handle(Incoming::new(active.channel.clone(), message)).await {
            error!(delivery_tag, "Failed to handle a message: {:?}", e);
        }
    }

    let still_active = manager
        .active_channel()
        .map_or(false, |current| current.generation == active.generation);
    if still_active {
        // Cancelled by the broker, e.g. because the queue was deleted.
        error!("The subscription ended while its channel is open, replacing the channel");
        manager.report_channel_fault(&active);
    } else {
        debug!("The subscription ended");
    }
}
