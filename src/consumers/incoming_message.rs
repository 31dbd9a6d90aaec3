use crate::amqp::Delivery;

/// A message received from RabbitMq, ready for processing.
///
/// `Incoming` is the input type of message handlers (check out
/// [`Handler`](crate::consumers::Handler)'s docs for more details).
pub struct Incoming<Ch> {
    /// The payload decoded as UTF-8. Invalid sequences are replaced with `U+FFFD`.
    pub body: String,
    /// The channel the message was received on: use it to ack, nack or reject the message
    /// when automatic acknowledgements are disabled.
    pub channel: Ch,
    /// What we received from RabbitMq: properties, headers, raw payload, delivery tag, etc.
    pub message: Delivery,
}

impl<Ch> Incoming<Ch> {
    pub fn new(channel: Ch, message: Delivery) -> Self {
        Self {
            body: String::from_utf8_lossy(&message.content).into_owned(),
            channel,
            message,
        }
    }
}
