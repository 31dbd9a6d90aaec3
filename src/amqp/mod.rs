//! Helpers for connecting to a RabbitMq broker

pub mod configuration;
mod factory;
mod signals;
pub mod transport;

pub use factory::{AmqpChannel, AmqpConnection, ConnectionFactory};
pub use transport::{
    BrokerChannel, BrokerConnection, Delivery, DeliveryStream, PendingConfirmation,
    PublishOutcome, Transport, TransportError,
};

pub use lapin::publisher_confirm::Confirmation;
pub use lapin::{message::BasicReturnMessage, options, types, BasicProperties, ExchangeKind};
