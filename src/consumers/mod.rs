//! Facilities to consume messages from a RabbitMq queue. Check out [`Consumer`] as a
//! starting point.
pub use consumer::Consumer;
pub use handler::{AsyncClosure, ClosureHandler, Handler, IgnoreMessages};
pub use incoming_message::Incoming;

mod consumer;
mod handler;
mod incoming_message;
