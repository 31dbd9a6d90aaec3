use crate::amqp::configuration::{
    ConsumeSettings, ExchangeSettings, QueueSettings, RabbitMqSettings,
};
use crate::amqp::signals::{FaultSignal, WriteWindow};
use crate::amqp::transport::{
    BrokerChannel, BrokerConnection, Delivery, DeliveryStream, PublishOutcome, Transport,
    TransportError,
};
use amq_protocol_types::{DeliveryTag, FieldTable};
use anyhow::Context;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    BasicProperties, ConnectionProperties, ConnectionStatus,
};
use native_tls::{Certificate, Identity};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

/// How often a channel checks whether the broker lifted a connection block.
const BLOCKED_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// AMQP reply code for a regular shutdown.
const REPLY_SUCCESS: u16 = 200;

#[derive(Clone)]
/// All the information required to connect to a RabbitMq broker.
pub struct ConnectionFactory {
    uri: AMQPUri,
    /// The timeout observed when trying to connect to RabbitMq.
    connection_timeout: Duration,
    /// TLS configuration for the connection to RabbitMq.
    /// If `None`, the connection will not be encrypted.
    tls: Option<Arc<Tls>>,
    publish_buffer_size: usize,
}

#[derive(Clone)]
struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// Certificate files referenced by the TLS settings are read and parsed here: a missing
    /// or malformed file is reported straight away rather than on every connection attempt.
    ///
    /// If the connection timeout is left unspecified, it will be defaulted to 10 seconds.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let tls = settings
            .tls
            .enabled
            .then(|| tls_connector(settings))
            .transpose()?;
        let connection_timeout = settings
            .connection_timeout()
            .unwrap_or_else(|| Duration::from_secs(10));
        Ok(Self {
            uri: settings.amqp_uri(),
            connection_timeout,
            tls: tls.map(Arc::new),
            publish_buffer_size: settings.publish_buffer_size,
        })
    }

    /// Create a new connection to a RabbitMq broker.
    ///
    /// It establishes an encrypted connection if `self.tls` is `Some`.
    /// It establishes an unencrypted connection if `self.tls` is `None`.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self))]
    pub async fn new_connection(&self) -> Result<AmqpConnection, anyhow::Error> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connection = timeout(self.connection_timeout, async {
            match &self.tls {
                None => self.connect_without_tls(properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        })
        .await
        .context("Timed out while trying to connect to RabbitMQ.")?
        .context("Failed to connect to RabbitMQ.")?;

        let fault = FaultSignal::new();
        connection.on_error({
            let fault = fault.clone();
            move |e| {
                warn!("RabbitMQ broken connection: {:?}", e);
                fault.raise(e);
            }
        });
        Ok(AmqpConnection {
            inner: connection,
            fault,
            publish_buffer_size: self.publish_buffer_size,
        })
    }

    /// Establish a new unencrypted connection to a RabbitMq broker.
    async fn connect_without_tls(
        &self,
        properties: ConnectionProperties,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connect_uri(self.uri.clone(), properties).await
    }

    /// Establish a new TLS connection to a RabbitMq broker.
    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls_configuration: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // First establish a plain TCP connection using the AMQP protocol
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri
                    .connect()
                    // Then perform a TLS handshake with custom settings
                    // including customisation of the expected domain for the server certificate
                    .and_then(|tcp| {
                        tcp.into_native_tls(
                            &tls_configuration.connector,
                            &tls_configuration.domain_name,
                        )
                    })
            }),
            properties,
        )
        .await
    }
}

fn tls_connector(settings: &RabbitMqSettings) -> Result<Tls, anyhow::Error> {
    let tls_settings = &settings.tls;
    let domain_name = tls_settings
        .domain
        .clone()
        .unwrap_or_else(|| settings.host.clone());

    let mut connector_builder = NativeTlsConnector::builder();
    if let Some(path) = &tls_settings.ca_certificate_file {
        let pem = std::fs::read(path)
            .with_context(|| format!("Failed to read the RabbitMQ CA certificate at {path}."))?;
        let certificate = Certificate::from_pem(&pem)
            .context("Failed to decode PEM certificate chain for RabbitMQ TLS.")?;
        connector_builder.add_root_certificate(certificate);
    }
    match (&tls_settings.certificate_file, &tls_settings.key_file) {
        (Some(certificate_path), Some(key_path)) => {
            let certificate = std::fs::read(certificate_path).with_context(|| {
                format!("Failed to read the RabbitMQ client certificate at {certificate_path}.")
            })?;
            let key = std::fs::read(key_path)
                .with_context(|| format!("Failed to read the RabbitMQ client key at {key_path}."))?;
            let identity = Identity::from_pkcs8(&certificate, &key)
                .context("Failed to decode the RabbitMQ client certificate and key.")?;
            connector_builder.identity(identity);
        }
        (None, None) => {}
        _ => anyhow::bail!(
            "RabbitMQ TLS client authentication requires both a certificate and a key file."
        ),
    }

    let connector = connector_builder
        .build()
        .context("TLS configuration failed")?;
    Ok(Tls {
        connector,
        domain_name,
    })
}

#[async_trait::async_trait]
impl Transport for ConnectionFactory {
    type Connection = AmqpConnection;

    async fn connect(&self) -> Result<AmqpConnection, TransportError> {
        Ok(self.new_connection().await?)
    }
}

/// A `lapin` connection, watched for faults.
pub struct AmqpConnection {
    inner: lapin::Connection,
    fault: FaultSignal,
    publish_buffer_size: usize,
}

#[async_trait::async_trait]
impl BrokerConnection for AmqpConnection {
    type Channel = AmqpChannel;

    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn create_channel(&self, confirm: bool) -> Result<AmqpChannel, TransportError> {
        let channel = self.inner.create_channel().await?;
        if confirm {
            // Enable publish confirms on the channel
            // See https://www.rabbitmq.com/amqp-0-9-1-reference.html#confirm.select.nowait
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await?;
        }

        let fault = FaultSignal::new();
        channel.on_error({
            let fault = fault.clone();
            move |e| {
                warn!("RabbitMQ broken channel: {:?}", e);
                fault.raise(e);
            }
        });
        Ok(AmqpChannel {
            inner: channel,
            connection_status: self.inner.status().clone(),
            window: Arc::new(WriteWindow::new(self.publish_buffer_size)),
            fault,
        })
    }

    async fn closed(&self) -> TransportError {
        self.fault.wait().await.into()
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(self.inner.close(REPLY_SUCCESS, "Bye").await?)
    }
}

/// A `lapin` channel, with backpressure reporting.
///
/// The write buffer is reported full while the broker blocks the connection (resource
/// alarms) or while `publish_buffer_size` messages are waiting for a confirmation.
#[derive(Clone)]
pub struct AmqpChannel {
    inner: lapin::Channel,
    connection_status: ConnectionStatus,
    window: Arc<WriteWindow>,
    fault: FaultSignal,
}

impl AmqpChannel {
    /// Get access to the underlying raw channel
    pub fn raw(&self) -> &lapin::Channel {
        &self.inner
    }
}

#[async_trait::async_trait]
impl BrokerChannel for AmqpChannel {
    #[tracing::instrument(name = "rabbitmq_assert_exchange", skip(self))]
    async fn assert_exchange(&self, exchange: &ExchangeSettings) -> Result<(), TransportError> {
        let options = ExchangeDeclareOptions {
            passive: false,
            durable: exchange.options.durable,
            auto_delete: exchange.options.auto_delete,
            internal: exchange.options.internal,
            nowait: false,
        };
        self.inner
            .exchange_declare(
                &exchange.name,
                exchange.exchange_kind(),
                options,
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_assert_queue", skip(self))]
    async fn assert_queue(&self, queue: &QueueSettings) -> Result<String, TransportError> {
        let options = QueueDeclareOptions {
            passive: false,
            durable: queue.options.durable,
            exclusive: queue.options.exclusive,
            auto_delete: queue.options.auto_delete,
            nowait: false,
        };
        let declared = self
            .inner
            .queue_declare(&queue.name, options, FieldTable::default())
            .await?;
        Ok(declared.name().as_str().to_owned())
    }

    #[tracing::instrument(name = "rabbitmq_bind_queue", skip(self))]
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), TransportError> {
        let options = QueueBindOptions { nowait: false };
        self.inner
            .queue_bind(queue, exchange, routing_key, options, arguments)
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_consume", skip(self))]
    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeSettings,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                &Uuid::new_v4().to_string(),
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;
        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(TransportError::from))
            .boxed())
    }

    #[tracing::instrument(level = "debug", skip(self, payload, properties))]
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: BasicPublishOptions,
        properties: BasicProperties,
    ) -> Result<PublishOutcome, TransportError> {
        if self.connection_status.blocked() {
            return Ok(PublishOutcome::BufferFull);
        }
        let Some(slot) = self.window.try_reserve() else {
            return Ok(PublishOutcome::BufferFull);
        };
        let confirm = self
            .inner
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await?;
        Ok(PublishOutcome::Written(Box::pin(async move {
            let confirmation = confirm.await;
            drop(slot);
            Ok::<_, TransportError>(confirmation?)
        })))
    }

    async fn drained(&self) {
        loop {
            tokio::select! {
                _ = self.window.released() => {}
                _ = tokio::time::sleep(BLOCKED_POLL_INTERVAL) => {}
            }
            if !self.connection_status.blocked() && self.window.has_capacity() {
                return;
            }
        }
    }

    async fn closed(&self) -> TransportError {
        self.fault.wait().await.into()
    }

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), TransportError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    async fn reject(
        &self,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), TransportError> {
        self.inner
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }
}
