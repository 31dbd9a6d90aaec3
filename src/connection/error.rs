use crate::amqp::TransportError;

/// Error returned when waiting for a channel to become ready.
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("The connection was closed before a channel became ready")]
    Closed,
}

/// Error returned when the broker connection could not be closed gracefully.
///
/// The connection is not retried: it is dropped either way.
#[derive(thiserror::Error, Debug)]
#[error("Failed to close the connection with the RabbitMq broker")]
pub struct CloseError(#[source] pub TransportError);
