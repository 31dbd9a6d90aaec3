//! `carrot-tether` keeps long-lived RabbitMQ consumers and publishers connected, built on
//! top of [`lapin`].
//!
//! Both roles reconnect on their own when the connection drops (with a backoff capped at
//! 30 seconds) and recreate their channel when it fails, re-declaring their topology every
//! time. [`Publisher`](crate::publishers::Publisher) queues messages while no channel is
//! usable and honours channel backpressure; [`Consumer`](crate::consumers::Consumer)
//! hands every delivery to a message handler that can be swapped at any time.
//!
//! Both are configured with [`RabbitMqSettings`](crate::amqp::configuration::RabbitMqSettings).
//!
//! Logs go through [`tracing`]: install a subscriber to see them.

pub mod amqp;
pub mod connection;
pub mod consumers;
pub mod publishers;

mod sync;
