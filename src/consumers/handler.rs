//! The `Handler` trait follows the same approach as `tide`'s endpoint handlers.
use crate::consumers::Incoming;
use std::future::Future;

/// Implementers of the `Handler` trait process the messages received by a
/// [`Consumer`](crate::consumers::Consumer).
///
/// # Acknowledgements
///
/// When the consumer is configured with `no_ack = false`, the handler is in charge of
/// acking, nacking or rejecting the message through [`Incoming::channel`]. With the default
/// configuration (`no_ack = true`) the broker considers the message delivered as soon as it
/// is sent.
///
/// # Errors
///
/// Errors are logged and otherwise ignored: the consumer moves on to the next message.
///
/// # Implementers
///
/// Most of the time you will not implement `Handler` by hand: wrap an async function or
/// closure with a matching signature in a [`ClosureHandler`] instead.
#[async_trait::async_trait]
pub trait Handler<Ch>: Send + Sync + 'static {
    async fn handle(&self, incoming: Incoming<Ch>) -> Result<(), anyhow::Error>;
}

/// `AsyncClosure` is implemented for all functions of the form:
/// ```ignore
/// async fn(incoming: Incoming<Channel>) -> Result<(), impl Into<anyhow::Error>>;
/// ```
///
/// Wrap it in a [`ClosureHandler`] to get a [`Handler`].
pub trait AsyncClosure<Ch>: Send + Sync + 'static {
    type Output: Future<Output = Result<(), Self::Err>> + Send + 'static;
    type Err: Into<anyhow::Error> + 'static;
    fn call(&self, incoming: Incoming<Ch>) -> Self::Output;
}

impl<F, Fut, Err, Ch> AsyncClosure<Ch> for F
where
    F: Fn(Incoming<Ch>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Err>> + Send + 'static,
    Err: Into<anyhow::Error> + 'static,
{
    type Err = Err;
    type Output = Fut;

    fn call(&self, incoming: Incoming<Ch>) -> Self::Output {
        (self)(incoming)
    }
}

/// Wrapper type to turn an [`AsyncClosure`] into a [`Handler`].
pub struct ClosureHandler<F>(pub F);

#[async_trait::async_trait]
impl<Ch, F> Handler<Ch> for ClosureHandler<F>
where
    Ch: Send + 'static,
    F: AsyncClosure<Ch>,
{
    async fn handle(&self, incoming: Incoming<Ch>) -> Result<(), anyhow::Error> {
        self.0.call(incoming).await.map_err(Into::into)
    }
}

/// A handler that drops every message. Consumers start with it.
pub struct IgnoreMessages;

#[async_trait::async_trait]
impl<Ch: Send + 'static> Handler<Ch> for IgnoreMessages {
    async fn handle(&self, _incoming: Incoming<Ch>) -> Result<(), anyhow::Error> {
        Ok(())
    }
}
