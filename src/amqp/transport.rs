use crate::amqp::configuration::{ConsumeSettings, ExchangeSettings, QueueSettings};
use amq_protocol_types::{DeliveryTag, FieldTable, ShortString};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use lapin::{options::BasicPublishOptions, publisher_confirm::Confirmation, BasicProperties};

/// `Transport` defines an interface for types that are capable of establishing
/// connections to a RabbitMq broker.
///
/// [`ConnectionFactory`](crate::amqp::ConnectionFactory) is the implementation backed by
/// `lapin`. The lifecycle logic in [`ConnectionManager`](crate::connection::ConnectionManager)
/// only ever talks to the broker through this trait and the two below.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Open a new connection.
    ///
    /// Fails if the broker cannot be reached or refuses the handshake.
    async fn connect(&self) -> Result<Self::Connection, TransportError>;
}

/// A live connection to a RabbitMq broker.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    /// Open a channel on top of this connection.
    ///
    /// When `confirm` is `true` the broker acknowledges every message published on the channel.
    async fn create_channel(&self, confirm: bool) -> Result<Self::Channel, TransportError>;

    /// Resolves once the connection has failed or has been closed by the broker.
    async fn closed(&self) -> TransportError;

    /// Gracefully close the connection and all its channels.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A RabbitMq channel: topology declarations and message transfer.
///
/// Channels are cheap handles: clones share the same underlying channel.
#[async_trait::async_trait]
pub trait BrokerChannel: Clone + Send + Sync + 'static {
    async fn assert_exchange(&self, exchange: &ExchangeSettings) -> Result<(), TransportError>;

    /// Declare a queue, returning its name - the broker picks one if `queue.name` is empty.
    async fn assert_queue(&self, queue: &QueueSettings) -> Result<String, TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), TransportError>;

    /// Subscribe to a queue. The stream ends when the channel goes away.
    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeSettings,
    ) -> Result<DeliveryStream, TransportError>;

    /// Hand a message over to the channel.
    ///
    /// Returns [`PublishOutcome::BufferFull`] without sending anything if the channel
    /// cannot accept more messages right now; wait for [`BrokerChannel::drained`] before
    /// trying again.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: BasicPublishOptions,
        properties: BasicProperties,
    ) -> Result<PublishOutcome, TransportError>;

    /// Resolves when the channel might accept messages again after reporting a full buffer.
    async fn drained(&self);

    /// Resolves once the channel has failed or has been closed.
    async fn closed(&self) -> TransportError;

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), TransportError>;

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), TransportError>;

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool)
        -> Result<(), TransportError>;
}

/// Messages pushed by the broker to a consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// Resolves when the broker confirms (or refuses) a published message.
///
/// Resolves straight away with [`Confirmation::NotRequested`] on channels without
/// publisher confirms.
pub type PendingConfirmation = BoxFuture<'static, Result<Confirmation, TransportError>>;

/// The result of handing a message over to a channel.
pub enum PublishOutcome {
    /// The message has been written to the channel.
    Written(PendingConfirmation),
    /// The channel write buffer is full: the message has NOT been sent.
    BufferFull,
}

impl std::fmt::Debug for PublishOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Written(_) => f.write_str("Written"),
            Self::BufferFull => f.write_str("BufferFull"),
        }
    }
}

/// A received AMQP message.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// The delivery tag of the message. Use it to ack/nack the message through the channel.
    pub delivery_tag: DeliveryTag,

    /// The exchange of the message. May be an empty string
    /// if the default exchange is used.
    pub exchange: ShortString,

    /// The routing key of the message. May be an empty string
    /// if no routing key is specified.
    pub routing_key: ShortString,

    /// Whether this message was redelivered
    pub redelivered: bool,

    /// Contains the properties and the headers of the
    /// message.
    pub properties: BasicProperties,

    /// The payload of the message in binary format.
    pub content: Vec<u8>,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(value: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: value.delivery_tag,
            exchange: value.exchange,
            routing_key: value.routing_key,
            redelivered: value.redelivered,
            properties: value.properties,
            content: value.data,
        }
    }
}

/// Any failure reported while talking to the broker.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct TransportError(#[from] anyhow::Error);

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        Self(err.into())
    }
}
