use crate::publishers::PublisherError;
use amq_protocol_types::{FieldTable, ShortShortUInt, ShortString, Timestamp};
use lapin::options::BasicPublishOptions;
use lapin::BasicProperties;
use serde::Serialize;
use std::sync::Arc;

/// The body of a message, as a sequence of bytes.
///
/// Build it from raw bytes, from text, or from any serializable value with [`Payload::json`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload(Arc<[u8]>);

impl Payload {
    /// Serialize `value` to JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, PublisherError> {
        serde_json::to_vec(value)
            .map(Self::from)
            .map_err(PublisherError::Serialization)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        text.into_bytes().into()
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        text.as_bytes().into()
    }
}

/// Per-message publishing options: AMQP properties and publish flags.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PublishOptions {
    pub properties: BasicProperties,
    pub flags: BasicPublishOptions,
}

impl PublishOptions {
    /// Ask the broker to return the message if it cannot be routed to any queue.
    ///
    /// On a confirm channel the publish then fails with
    /// [`PublisherError::UnroutableMessage`].
    pub fn mandatory(mut self) -> Self {
        self.flags.mandatory = true;
        self
    }

    fn props(mut self, f: impl FnOnce(BasicProperties) -> BasicProperties) -> Self {
        self.properties = f(self.properties);
        self
    }

    pub fn with_content_type(self, value: ShortString) -> Self {
        self.props(|p| p.with_content_type(value))
    }

    pub fn with_content_encoding(self, value: ShortString) -> Self {
        self.props(|p| p.with_content_encoding(value))
    }

    pub fn with_headers(self, value: FieldTable) -> Self {
        self.props(|p| p.with_headers(value))
    }

    /// Non-persistent (1) or persistent (2).
    pub fn with_delivery_mode(self, value: ShortShortUInt) -> Self {
        self.props(|p| p.with_delivery_mode(value))
    }

    pub fn with_priority(self, value: ShortShortUInt) -> Self {
        self.props(|p| p.with_priority(value))
    }

    pub fn with_correlation_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_correlation_id(value))
    }

    pub fn with_reply_to(self, value: ShortString) -> Self {
        self.props(|p| p.with_reply_to(value))
    }

    pub fn with_expiration(self, value: ShortString) -> Self {
        self.props(|p| p.with_expiration(value))
    }

    pub fn with_message_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_message_id(value))
    }

    pub fn with_timestamp(self, value: Timestamp) -> Self {
        self.props(|p| p.with_timestamp(value))
    }

    pub fn with_app_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_app_id(value))
    }
}
