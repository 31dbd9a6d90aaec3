use crate::helpers::{
    eventually, get_rabbitmq_settings, within_timeout, Binding, FakeBroker, FakeChannel,
};
use carrot_tether::amqp::configuration::RabbitMqSettings;
use carrot_tether::amqp::BrokerChannel;
use carrot_tether::connection::Lifecycle;
use carrot_tether::consumers::{ClosureHandler, Consumer, Handler, Incoming};
use carrot_tether::publishers::{PublishOptions, Publisher};
use fake::faker::lorem::en::Sentence;
use fake::Fake;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A handler forwarding message bodies to the returned receiver.
fn forwarding_handler() -> (
    Arc<dyn Handler<FakeChannel>>,
    mpsc::UnboundedReceiver<String>,
) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let handler = ClosureHandler(move |incoming: Incoming<FakeChannel>| {
        let sender = sender.clone();
        async move {
            sender
                .send(incoming.body)
                .map_err(|_| anyhow::anyhow!("The test is over"))
        }
    });
    (Arc::new(handler), receiver)
}

async fn started_consumer(
    broker: &FakeBroker,
    settings: RabbitMqSettings,
) -> (Consumer<FakeBroker>, mpsc::UnboundedReceiver<String>) {
    let consumer = Consumer::with_transport(broker.clone(), settings);
    let (handler, receiver) = forwarding_handler();
    consumer.set_message_handler(Some(handler));
    within_timeout(consumer.start()).await.unwrap();
    (consumer, receiver)
}

fn shared_queue_settings() -> RabbitMqSettings {
    let mut settings = get_rabbitmq_settings();
    settings.queue.name = "test".into();
    settings.queue.options.exclusive = false;
    settings
}

#[tokio::test]
async fn published_messages_reach_the_handler() {
    // Arrange
    let broker = FakeBroker::default();
    let (_consumer, mut received) = started_consumer(&broker, get_rabbitmq_settings()).await;
    let publisher = Publisher::with_transport(broker.clone(), get_rabbitmq_settings());
    within_timeout(publisher.connect()).await.unwrap();
    let body: String = Sentence(3..8).fake();

    // Act
    within_timeout(publisher.publish(body.as_str(), PublishOptions::default(), None))
        .await
        .unwrap();

    // Assert
    assert_eq!(within_timeout(received.recv()).await.unwrap(), body);
}

#[tokio::test]
async fn a_server_generated_queue_is_bound_and_consumed() {
    // Arrange
    let broker = FakeBroker::default();

    // Act
    let (consumer, _received) = started_consumer(&broker, get_rabbitmq_settings()).await;

    // Assert
    let queue_name = consumer.queue_name().unwrap();
    assert!(queue_name.starts_with("amq.gen-"));
    assert_eq!(
        broker.bindings(),
        vec![Binding {
            queue: queue_name.clone(),
            exchange: "amqp.direct".into(),
            routing_key: "amqp.direct".into(),
        }]
    );
    assert_eq!(broker.consumers_on(&queue_name), 1);
    assert_eq!(consumer.state(), Lifecycle::ChannelReady);
}

#[tokio::test]
async fn messages_are_handled_in_arrival_order() {
    // Arrange
    let broker = FakeBroker::default();
    let (consumer, mut received) = started_consumer(&broker, get_rabbitmq_settings()).await;
    let queue_name = consumer.queue_name().unwrap();
    let bodies: Vec<String> = (0..20).map(|i| format!("message-{i}")).collect();

    // Act
    for body in &bodies {
        broker.deliver(&queue_name, body);
    }

    // Assert
    let mut handled = Vec::new();
    for _ in 0..bodies.len() {
        handled.push(within_timeout(received.recv()).await.unwrap());
    }
    assert_eq!(handled, bodies);
}

#[tokio::test]
async fn consumers_sharing_a_queue_split_the_load() {
    // Arrange
    let broker = FakeBroker::default();
    let (_first, mut first_received) = started_consumer(&broker, shared_queue_settings()).await;
    let (_second, mut second_received) = started_consumer(&broker, shared_queue_settings()).await;
    let publisher = Publisher::with_transport(broker.clone(), get_rabbitmq_settings());

    // Act
    for i in 0..10 {
        let _ = publisher.publish(format!("{i}"), PublishOptions::default(), None);
    }
    within_timeout(publisher.connect()).await.unwrap();

    // Assert
    let mut first = Vec::new();
    let mut second = Vec::new();
    for _ in 0..5 {
        first.push(within_timeout(first_received.recv()).await.unwrap());
        second.push(within_timeout(second_received.recv()).await.unwrap());
    }
    let mut all: Vec<u32> = first
        .iter()
        .chain(second.iter())
        .map(|body| body.parse().unwrap())
        .collect();
    all.sort_unstable();
    assert_eq!(all, (0..10).collect::<Vec<_>>());
    assert_eq!(broker.consumers_on("test"), 2);
}

#[tokio::test]
async fn every_subscriber_gets_a_copy_of_each_message() {
    // Arrange
    let broker = FakeBroker::default();
    let (_first, mut first_received) = started_consumer(&broker, get_rabbitmq_settings()).await;
    let (_second, mut second_received) = started_consumer(&broker, get_rabbitmq_settings()).await;
    let publisher = Publisher::with_transport(broker.clone(), get_rabbitmq_settings());
    within_timeout(publisher.connect()).await.unwrap();

    // Act
    within_timeout(publisher.publish("news", PublishOptions::default(), None))
        .await
        .unwrap();

    // Assert
    assert_eq!(within_timeout(first_received.recv()).await.unwrap(), "news");
    assert_eq!(within_timeout(second_received.recv()).await.unwrap(), "news");
}

#[tokio::test]
async fn only_matching_routing_keys_are_delivered() {
    // Arrange
    let broker = FakeBroker::default();
    let mut settings = get_rabbitmq_settings();
    settings.routing_key = "orders".into();
    let (_orders, mut orders_received) = started_consumer(&broker, settings).await;
    let mut settings = get_rabbitmq_settings();
    settings.routing_key = "refunds".into();
    let (_refunds, mut refunds_received) = started_consumer(&broker, settings).await;
    let publisher = Publisher::with_transport(broker.clone(), get_rabbitmq_settings());
    within_timeout(publisher.connect()).await.unwrap();

    // Act
    within_timeout(publisher.publish("order #1", PublishOptions::default(), Some("orders")))
        .await
        .unwrap();

    // Assert
    assert_eq!(
        within_timeout(orders_received.recv()).await.unwrap(),
        "order #1"
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(refunds_received.try_recv().is_err());
}

#[tokio::test]
async fn the_message_handler_can_be_replaced() {
    // Arrange
    let broker = FakeBroker::default();
    let (consumer, mut first_received) = started_consumer(&broker, get_rabbitmq_settings()).await;
    let queue_name = consumer.queue_name().unwrap();
    let (second, mut second_received) = forwarding_handler();

    // Act
    consumer.set_message_handler(Some(second));
    broker.deliver(&queue_name, "for the second handler");

    // Assert
    assert_eq!(
        within_timeout(second_received.recv()).await.unwrap(),
        "for the second handler"
    );
    assert!(first_received.try_recv().is_err());
}

#[tokio::test]
async fn removing_the_handler_ignores_messages() {
    // Arrange
    let broker = FakeBroker::default();
    let (consumer, mut received) = started_consumer(&broker, get_rabbitmq_settings()).await;
    let queue_name = consumer.queue_name().unwrap();

    // Act
    consumer.set_message_handler(None);
    broker.deliver(&queue_name, "nobody listens");
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Assert
    assert!(received.try_recv().is_err());
}

#[tokio::test]
async fn handler_errors_do_not_stop_the_consumer() {
    // Arrange
    let broker = FakeBroker::default();
    let consumer = Consumer::with_transport(broker.clone(), get_rabbitmq_settings());
    let (sender, mut received) = mpsc::unbounded_channel();
    consumer.set_message_handler(Some(Arc::new(ClosureHandler(
        move |incoming: Incoming<FakeChannel>| {
            let sender = sender.clone();
            async move {
                if incoming.body == "poison" {
                    anyhow::bail!("Cannot process this message");
                }
                let _ = sender.send(incoming.body);
                Ok(())
            }
        },
    ))));
    within_timeout(consumer.start()).await.unwrap();
    let queue_name = consumer.queue_name().unwrap();

    // Act
    broker.deliver(&queue_name, "poison");
    broker.deliver(&queue_name, "healthy");

    // Assert
    assert_eq!(within_timeout(received.recv()).await.unwrap(), "healthy");
}

#[tokio::test]
async fn handlers_can_acknowledge_messages_through_the_channel() {
    // Arrange
    let broker = FakeBroker::default();
    let mut settings = get_rabbitmq_settings();
    settings.consume.no_ack = false;
    let consumer = Consumer::with_transport(broker.clone(), settings);
    consumer.set_message_handler(Some(Arc::new(ClosureHandler(
        |incoming: Incoming<FakeChannel>| async move {
            if incoming.body == "reject me" {
                incoming
                    .channel
                    .reject(incoming.message.delivery_tag, false)
                    .await
            } else {
                incoming.channel.ack(incoming.message.delivery_tag).await
            }
        },
    ))));
    within_timeout(consumer.start()).await.unwrap();
    let queue_name = consumer.queue_name().unwrap();

    // Act
    broker.deliver(&queue_name, "ack me");
    broker.deliver(&queue_name, "reject me");

    // Assert
    eventually(|| broker.acked().len() == 1 && broker.rejected().len() == 1).await;
}

#[tokio::test]
async fn the_consumer_resubscribes_after_a_channel_failure() {
    // Arrange
    let broker = FakeBroker::default();
    let (consumer, mut received) = started_consumer(&broker, get_rabbitmq_settings()).await;
    let mut ready = consumer.subscribe_ready();

    // Act
    broker.break_channels();
    within_timeout(ready.recv()).await.unwrap();
    broker.deliver(&consumer.queue_name().unwrap(), "still here");

    // Assert
    assert_eq!(
        within_timeout(received.recv()).await.unwrap(),
        "still here"
    );
    assert_eq!(broker.exchanges_declared().len(), 2);
    assert_eq!(broker.connections_opened(), 1);
}

#[tokio::test]
async fn the_consumer_resubscribes_after_a_connection_loss() {
    // Arrange
    let broker = FakeBroker::default();
    let (consumer, mut received) = started_consumer(&broker, shared_queue_settings()).await;
    let mut ready = consumer.subscribe_ready();

    // Act
    broker.drop_connections();
    within_timeout(ready.recv()).await.unwrap();
    broker.deliver("test", "welcome back");

    // Assert
    assert_eq!(
        within_timeout(received.recv()).await.unwrap(),
        "welcome back"
    );
    assert_eq!(broker.connections_opened(), 2);
    assert_eq!(broker.consumers_on("test"), 1);
}

#[tokio::test]
async fn the_consumer_resubscribes_after_the_broker_cancels_its_subscription() {
    // Arrange
    let broker = FakeBroker::default();
    let (consumer, mut received) = started_consumer(&broker, shared_queue_settings()).await;
    let mut ready = consumer.subscribe_ready();

    // Act
    broker.cancel_consumers("test");
    within_timeout(ready.recv()).await.unwrap();
    broker.deliver("test", "after the cancellation");

    // Assert
    assert_eq!(
        within_timeout(received.recv()).await.unwrap(),
        "after the cancellation"
    );
    assert_eq!(broker.consumers_on("test"), 1);
    assert_eq!(broker.channels_opened(), 2);
    assert_eq!(broker.connections_opened(), 1);
    assert_eq!(consumer.state(), Lifecycle::ChannelReady);
}

#[tokio::test]
async fn stop_closes_the_connection() {
    // Arrange
    let broker = FakeBroker::default();
    let (consumer, mut received) = started_consumer(&broker, shared_queue_settings()).await;

    // Act
    within_timeout(consumer.stop()).await.unwrap();
    broker.deliver("test", "too late");
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Assert
    assert_eq!(consumer.state(), Lifecycle::Closed);
    assert_eq!(broker.connections_closed(), 1);
    assert_eq!(broker.consumers_on("test"), 0);
    assert!(received.try_recv().is_err());
}

#[tokio::test]
async fn stopping_a_consumer_that_never_started_is_a_no_op() {
    let broker = FakeBroker::default();
    let consumer = Consumer::with_transport(broker.clone(), get_rabbitmq_settings());

    within_timeout(consumer.stop()).await.unwrap();

    assert_eq!(broker.connections_opened(), 0);
    assert_eq!(consumer.queue_name(), None);
}
