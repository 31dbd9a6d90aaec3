use crate::helpers::{eventually, get_rabbitmq_settings, within_timeout, FakeBroker, Published};
use carrot_tether::amqp::configuration::RabbitMqSettings;
use carrot_tether::connection::Lifecycle;
use carrot_tether::publishers::{Payload, PublishOptions, Publisher, PublisherError};
use fake::faker::lorem::en::Sentence;
use fake::Fake;
use std::time::Duration;

fn publisher(broker: &FakeBroker, settings: RabbitMqSettings) -> Publisher<FakeBroker> {
    Publisher::with_transport(broker.clone(), settings)
}

fn confirming_settings() -> RabbitMqSettings {
    let mut settings = get_rabbitmq_settings();
    settings.confirm_channel = true;
    settings
}

fn sentences(n: usize) -> Vec<String> {
    (0..n).map(|_| Sentence(3..8).fake()).collect()
}

#[tokio::test]
async fn messages_published_before_connecting_are_sent_in_order_once_connected() {
    // Arrange
    let broker = FakeBroker::default();
    let publisher = publisher(&broker, get_rabbitmq_settings());
    let bodies = sentences(5);
    let pending: Vec<_> = bodies
        .iter()
        .map(|body| publisher.publish(body.as_str(), PublishOptions::default(), None))
        .collect();
    assert_eq!(publisher.queued(), 5);
    assert!(broker.published().is_empty());

    // Act
    within_timeout(publisher.connect()).await.unwrap();

    // Assert
    for outcome in pending {
        within_timeout(outcome).await.unwrap();
    }
    assert_eq!(broker.published_bodies(), bodies);
    assert_eq!(publisher.queued(), 0);
    assert_eq!(publisher.state(), Lifecycle::ChannelReady);
}

#[tokio::test]
async fn messages_use_the_configured_exchange_and_routing_key_by_default() {
    // Arrange
    let broker = FakeBroker::default();
    let publisher = publisher(&broker, get_rabbitmq_settings());
    within_timeout(publisher.connect()).await.unwrap();

    // Act
    within_timeout(publisher.publish("first", PublishOptions::default(), None))
        .await
        .unwrap();
    within_timeout(publisher.publish("second", PublishOptions::default(), Some("custom")))
        .await
        .unwrap();

    // Assert
    assert_eq!(
        broker.published(),
        vec![
            Published {
                exchange: "amqp.direct".into(),
                routing_key: "amqp.direct".into(),
                body: "first".into(),
            },
            Published {
                exchange: "amqp.direct".into(),
                routing_key: "custom".into(),
                body: "second".into(),
            },
        ]
    );
    assert_eq!(broker.exchanges_declared(), vec!["amqp.direct".to_string()]);
}

#[tokio::test]
async fn json_payloads_are_serialized() {
    // Arrange
    let broker = FakeBroker::default();
    let publisher = publisher(&broker, get_rabbitmq_settings());
    within_timeout(publisher.connect()).await.unwrap();
    let payload = Payload::json(&serde_json::json!({ "id": 42 })).unwrap();

    // Act
    within_timeout(publisher.publish(payload, PublishOptions::default(), None))
        .await
        .unwrap();

    // Assert
    assert_eq!(broker.published_bodies(), vec![r#"{"id":42}"#.to_string()]);
}

#[tokio::test]
async fn a_full_buffer_holds_messages_back_until_it_drains() {
    // Arrange
    let broker = FakeBroker::default();
    broker.set_buffer_full(true);
    let publisher = publisher(&broker, get_rabbitmq_settings());
    within_timeout(publisher.connect()).await.unwrap();
    let bodies = sentences(3);
    let pending: Vec<_> = bodies
        .iter()
        .map(|body| publisher.publish(body.as_str(), PublishOptions::default(), None))
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(broker.published().is_empty());
    assert_eq!(publisher.queued(), 3);

    // Act
    broker.set_buffer_full(false);

    // Assert
    for outcome in pending {
        within_timeout(outcome).await.unwrap();
    }
    assert_eq!(broker.published_bodies(), bodies);
    assert_eq!(publisher.queued(), 0);
}

#[tokio::test]
async fn messages_held_back_by_a_full_buffer_survive_a_channel_replacement() {
    // Arrange
    let broker = FakeBroker::default();
    broker.set_buffer_full(true);
    let publisher = publisher(&broker, get_rabbitmq_settings());
    within_timeout(publisher.connect()).await.unwrap();
    let pending = publisher.publish("stuck", PublishOptions::default(), None);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut ready = publisher.subscribe_ready();

    // Act
    broker.break_channels();
    within_timeout(ready.recv()).await.unwrap();
    broker.set_buffer_full(false);

    // Assert
    within_timeout(pending).await.unwrap();
    assert_eq!(broker.published_bodies(), vec!["stuck".to_string()]);
}

#[tokio::test]
async fn a_failed_publish_replaces_the_channel_without_losing_the_message() {
    // Arrange
    let broker = FakeBroker::default();
    broker.fail_next_publishes(1);
    let publisher = publisher(&broker, get_rabbitmq_settings());
    within_timeout(publisher.connect()).await.unwrap();

    // Act
    let outcome = within_timeout(publisher.publish("resilient", PublishOptions::default(), None))
        .await;

    // Assert
    assert!(outcome.is_ok());
    assert_eq!(broker.published_bodies(), vec!["resilient".to_string()]);
    assert_eq!(broker.channels_opened(), 2);
    assert_eq!(broker.connections_opened(), 1);
}

#[tokio::test]
async fn messages_survive_a_connection_loss() {
    // Arrange
    let broker = FakeBroker::default();
    let publisher = publisher(&broker, get_rabbitmq_settings());
    within_timeout(publisher.connect()).await.unwrap();
    within_timeout(publisher.publish("before", PublishOptions::default(), None))
        .await
        .unwrap();

    // Act
    broker.drop_connections();
    let outcome = within_timeout(publisher.publish("after", PublishOptions::default(), None))
        .await;

    // Assert
    assert!(outcome.is_ok());
    assert_eq!(
        broker.published_bodies(),
        vec!["before".to_string(), "after".to_string()]
    );
    assert_eq!(broker.connections_opened(), 2);
}

#[tokio::test]
async fn acknowledged_messages_resolve_successfully_in_confirm_mode() {
    // Arrange
    let broker = FakeBroker::default();
    let publisher = publisher(&broker, confirming_settings());
    within_timeout(publisher.connect()).await.unwrap();

    // Act
    let outcome = within_timeout(publisher.publish("confirmed", PublishOptions::default(), None))
        .await;

    // Assert
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn negatively_acknowledged_messages_are_reported() {
    // Arrange
    let broker = FakeBroker::default();
    broker.nack_publishes();
    let publisher = publisher(&broker, confirming_settings());
    within_timeout(publisher.connect()).await.unwrap();

    // Act
    let outcome = within_timeout(publisher.publish("refused", PublishOptions::default(), None))
        .await;

    // Assert
    assert!(matches!(outcome, Err(PublisherError::NegativeAck(None))));
    assert_eq!(publisher.queued(), 0);
}

#[tokio::test]
async fn dropping_the_outcome_does_not_cancel_the_publishing() {
    // Arrange
    let broker = FakeBroker::default();
    let publisher = publisher(&broker, get_rabbitmq_settings());
    within_timeout(publisher.connect()).await.unwrap();

    // Act
    drop(publisher.publish("fire and forget", PublishOptions::default(), None));

    // Assert
    eventually(|| broker.published_bodies() == vec!["fire and forget".to_string()]).await;
}

#[tokio::test]
async fn messages_queued_after_close_are_sent_on_the_next_connect() {
    // Arrange
    let broker = FakeBroker::default();
    let publisher = publisher(&broker, get_rabbitmq_settings());
    within_timeout(publisher.connect()).await.unwrap();
    within_timeout(publisher.close()).await.unwrap();

    // Act
    let pending = publisher.publish("later", PublishOptions::default(), None);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(broker.published().is_empty());
    assert_eq!(publisher.queued(), 1);
    within_timeout(publisher.connect()).await.unwrap();

    // Assert
    within_timeout(pending).await.unwrap();
    assert_eq!(broker.published_bodies(), vec!["later".to_string()]);
    assert_eq!(broker.connections_opened(), 2);
}

#[tokio::test]
async fn close_is_idempotent() {
    // Arrange
    let broker = FakeBroker::default();
    let publisher = publisher(&broker, get_rabbitmq_settings());
    within_timeout(publisher.connect()).await.unwrap();

    // Act
    within_timeout(publisher.close()).await.unwrap();
    within_timeout(publisher.close()).await.unwrap();

    // Assert
    assert_eq!(broker.connections_closed(), 1);
    assert_eq!(publisher.state(), Lifecycle::Closed);
}

#[tokio::test]
async fn closing_a_publisher_that_never_connected_is_a_no_op() {
    let broker = FakeBroker::default();
    let publisher = publisher(&broker, get_rabbitmq_settings());

    within_timeout(publisher.close()).await.unwrap();

    assert_eq!(broker.connections_opened(), 0);
}
