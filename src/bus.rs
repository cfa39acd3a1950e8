//! RabbitMQ client shared by every subscription and publish path.
//!
//! All traffic flows through one durable topic exchange; services subscribe
//! with routing-key patterns (`*` one token, `#` zero or more).

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use tracing::warn;

use crate::errors::BusError;

pub const EXCHANGE: &str = "forge.events";

const CONNECT_ATTEMPTS: u32 = 10;

/// Publish seam between the state machine and the broker. The orchestrator
/// and the ingress publish through this trait; tests substitute a recording
/// implementation.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<(), BusError>;
}

/// Connection to the broker plus the channel every operation runs on.
pub struct Broker {
    conn: Connection,
    channel: Channel,
}

impl Broker {
    /// Connect and declare the durable topic exchange.
    pub async fn connect(amqp_url: &str) -> Result<Self, BusError> {
        let conn = dial(amqp_url).await?;
        let channel = conn.create_channel().await.map_err(BusError::Channel)?;
        channel
            .exchange_declare(
                EXCHANGE,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(BusError::Channel)?;
        Ok(Self { conn, channel })
    }

    /// Publish a persistent JSON message and wait for the broker to take it.
    pub async fn publish(&self, routing_key: &str, body: &[u8]) -> Result<(), BusError> {
        let publish_err = |source| BusError::Publish {
            routing_key: routing_key.to_string(),
            source,
        };
        self.channel
            .basic_publish(
                EXCHANGE,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2) // persistent
                    .with_timestamp(Utc::now().timestamp() as u64),
            )
            .await
            .map_err(publish_err)?
            .await
            .map_err(publish_err)?;
        Ok(())
    }

    /// Declare a durable queue, bind it to the exchange under `pattern`, and
    /// start a manual-ack consumer with prefetch=1.
    pub async fn subscribe(&self, queue: &str, pattern: &str) -> Result<Consumer, BusError> {
        let sub_err = |source| BusError::Subscribe {
            queue: queue.to_string(),
            source,
        };
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(sub_err)?;
        self.channel
            .queue_bind(
                queue,
                EXCHANGE,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(sub_err)?;
        // One unacked delivery at a time per consumer.
        self.channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(sub_err)?;
        self.channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(sub_err)
    }

    pub async fn close(&self) {
        let _ = self.conn.close(200, "shutdown").await;
    }
}

#[async_trait]
impl EventPublisher for Broker {
    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<(), BusError> {
        Broker::publish(self, routing_key, &body).await
    }
}

/// Dial with linearly increasing backoff: 1s after the first failure, 2s
/// after the second, up to [`CONNECT_ATTEMPTS`].
async fn dial(amqp_url: &str) -> Result<Connection, BusError> {
    let mut last_err = None;
    for attempt in 1..=CONNECT_ATTEMPTS {
        match Connection::connect(amqp_url, ConnectionProperties::default()).await {
            Ok(conn) => return Ok(conn),
            Err(err) => {
                warn!(attempt, error = %err, "bus connection failed, retrying");
                last_err = Some(err);
            }
        }
        tokio::time::sleep(backoff(attempt)).await;
    }
    Err(BusError::TransientUnavailable {
        attempts: CONNECT_ATTEMPTS,
        source: last_err.unwrap_or(lapin::Error::InvalidConnectionState(
            lapin::ConnectionState::Closed,
        )),
    })
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(u64::from(attempt))
}

// ── Test publishers ───────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear_in_seconds() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(5), Duration::from_secs(5));
        assert_eq!(backoff(CONNECT_ATTEMPTS), Duration::from_secs(10));
    }

    #[test]
    fn exchange_name_is_stable() {
        // Queue bindings and peer services both key on this name.
        assert_eq!(EXCHANGE, "forge.events");
    }

    #[tokio::test]
    async fn recording_publisher_captures_in_order() {
        use testing::RecordingPublisher;
        let publisher = RecordingPublisher::default();
        publisher.publish("a.one", vec![1]).await.unwrap();
        publisher.publish("b.two", vec![2]).await.unwrap();
        let published = publisher.published();
        assert_eq!(published[0].0, "a.one");
        assert_eq!(published[1].0, "b.two");
        assert_eq!(publisher.count("a.one"), 1);
    }
}
