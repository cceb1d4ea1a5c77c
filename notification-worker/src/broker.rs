//! Broker session.
//!
//! Owns the AMQP connection and channel, declares the topology, and exposes
//! the three delivery primitives the processing pipeline needs behind an
//! async trait (`BrokerActions`) keyed on delivery tag rather than on
//! `lapin::message::Delivery` directly, so the pipeline can be driven by an
//! in-memory fake in tests without a live broker.

use std::time::Duration;

use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use thiserror::Error;
use tracing::{info, warn};

use shared::Channel as NotificationChannel;

pub const EXCHANGE: &str = "notifications.exchange";
pub const DLX_EXCHANGE: &str = "notifications.dlx";
pub const DLQ_QUEUE: &str = "notifications.dlq";
pub const DLQ_ROUTING_KEY: &str = "dead";
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Startup reconnect backoff, capped at 10 attempts.
const STARTUP_BACKOFF_SECS: [u64; 5] = [2, 4, 8, 16, 30];
const MAX_CONNECT_ATTEMPTS: usize = 10;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    Connect(#[source] lapin::Error),

    #[error("failed to declare topology: {0}")]
    Topology(#[source] lapin::Error),

    #[error("failed to publish: {0}")]
    Publish(#[source] lapin::Error),

    #[error("failed to ack/nack delivery: {0}")]
    Ack(#[source] lapin::Error),
}

/// The three primitives the processing pipeline drives a delivery through.
/// Implemented for `lapin::Channel` for production use and for an
/// in-memory fake in tests.
#[async_trait]
pub trait BrokerActions: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Negative-ack without requeue. Routes to the DLX.
    async fn dead_letter(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Negative-ack with requeue, used when infrastructure (not the
    /// message) is at fault.
    async fn requeue(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Publish `body` back to `routing_key` with TTL `delay` and header
    /// `x-retry-count = retry_count`, persistent delivery mode, then ack the
    /// original delivery.
    async fn republish_with_delay(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        retry_count: u32,
        delay: Duration,
        original_delivery_tag: u64,
    ) -> Result<(), BrokerError>;
}

#[async_trait]
impl BrokerActions for Channel {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(BrokerError::Ack)
    }

    async fn dead_letter(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.basic_nack(
            delivery_tag,
            BasicNackOptions {
                multiple: false,
                requeue: false,
            },
        )
        .await
        .map_err(BrokerError::Ack)
    }

    async fn requeue(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.basic_nack(
            delivery_tag,
            BasicNackOptions {
                multiple: false,
                requeue: true,
            },
        )
        .await
        .map_err(BrokerError::Ack)
    }

    async fn republish_with_delay(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        retry_count: u32,
        delay: Duration,
        original_delivery_tag: u64,
    ) -> Result<(), BrokerError> {
        let mut headers = FieldTable::default();
        headers.insert(
            RETRY_COUNT_HEADER.into(),
            AMQPValue::LongLongInt(retry_count as i64),
        );

        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_headers(headers)
            .with_expiration(delay.as_millis().to_string().into());

        self.basic_publish(
            EXCHANGE,
            routing_key,
            BasicPublishOptions::default(),
            &body,
            properties,
        )
        .await
        .map_err(BrokerError::Publish)?;

        self.ack(original_delivery_tag).await
    }
}

pub struct BrokerSession {
    connection: Connection,
    channel: Channel,
}

impl BrokerSession {
    /// Connect with exponential backoff, 2/4/8/16/30s capped, up to 10
    /// attempts, then give up.
    pub async fn connect_with_retry(url: &str) -> Result<Self, BrokerError> {
        let mut last_err = match Self::connect(url).await {
            Ok(session) => return Ok(session),
            Err(e) => {
                warn!(attempt = 1, max_attempts = MAX_CONNECT_ATTEMPTS, error = %e, "broker connect failed");
                e
            }
        };

        for attempt in 2..=MAX_CONNECT_ATTEMPTS {
            let idx = (attempt - 2).min(STARTUP_BACKOFF_SECS.len() - 1);
            tokio::time::sleep(Duration::from_secs(STARTUP_BACKOFF_SECS[idx])).await;

            match Self::connect(url).await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    warn!(attempt, max_attempts = MAX_CONNECT_ATTEMPTS, error = %e, "broker connect failed");
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    async fn connect(url: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(BrokerError::Connect)?;
        let channel = connection
            .create_channel()
            .await
            .map_err(BrokerError::Connect)?;
        Ok(Self { connection, channel })
    }

    /// Declare the full topology idempotently.
    pub async fn declare_topology(&self) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                EXCHANGE,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::Topology)?;

        self.channel
            .exchange_declare(
                DLX_EXCHANGE,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::Topology)?;

        self.channel
            .queue_declare(
                DLQ_QUEUE,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::Topology)?;

        self.channel
            .queue_bind(
                DLQ_QUEUE,
                DLX_EXCHANGE,
                DLQ_ROUTING_KEY,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::Topology)?;

        for channel in [
            NotificationChannel::Email,
            NotificationChannel::Sms,
            NotificationChannel::Push,
        ] {
            let queue_name = channel.queue_name();
            let routing_key = channel.routing_key();

            let mut args = FieldTable::default();
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(DLX_EXCHANGE.into()),
            );
            args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(DLQ_ROUTING_KEY.into()),
            );

            self.channel
                .queue_declare(
                    &queue_name,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    args,
                )
                .await
                .map_err(BrokerError::Topology)?;

            self.channel
                .queue_bind(
                    &queue_name,
                    EXCHANGE,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(BrokerError::Topology)?;
        }

        info!("declared notification topology");
        Ok(())
    }

    pub async fn set_prefetch(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(BrokerError::Topology)?;
        Ok(())
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Close channel then connection. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        if self.channel.status().connected() {
            self.channel
                .close(200, "graceful shutdown")
                .await
                .map_err(BrokerError::Connect)?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(200, "graceful shutdown")
                .await
                .map_err(BrokerError::Connect)?;
        }
        Ok(())
    }
}

/// Extract the broker-side `x-retry-count` header, if present.
pub fn header_retry_count(properties: &BasicProperties) -> Option<u32> {
    properties.headers().as_ref().and_then(|headers| {
        headers.inner().get(RETRY_COUNT_HEADER).and_then(|value| match value {
            AMQPValue::LongLongInt(n) => Some(*n as u32),
            AMQPValue::LongInt(n) => Some(*n as u32),
            AMQPValue::ShortInt(n) => Some(*n as u32),
            AMQPValue::ShortUInt(n) => Some(*n as u32),
            AMQPValue::LongUInt(n) => Some(*n),
            _ => None,
        })
    })
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Action {
        Ack(u64),
        DeadLetter(u64),
        Requeue(u64),
        Republish {
            routing_key: String,
            retry_count: u32,
            delay: Duration,
            original_delivery_tag: u64,
        },
    }

    /// Records every primitive invocation for assertions in tests.
    #[derive(Default)]
    pub struct FakeBroker {
        actions: Mutex<Vec<Action>>,
    }

    impl FakeBroker {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn actions(&self) -> Vec<Action> {
            self.actions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BrokerActions for FakeBroker {
        async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
            self.actions.lock().unwrap().push(Action::Ack(delivery_tag));
            Ok(())
        }

        async fn dead_letter(&self, delivery_tag: u64) -> Result<(), BrokerError> {
            self.actions
                .lock()
                .unwrap()
                .push(Action::DeadLetter(delivery_tag));
            Ok(())
        }

        async fn requeue(&self, delivery_tag: u64) -> Result<(), BrokerError> {
            self.actions.lock().unwrap().push(Action::Requeue(delivery_tag));
            Ok(())
        }

        async fn republish_with_delay(
            &self,
            routing_key: &str,
            _body: Vec<u8>,
            retry_count: u32,
            delay: Duration,
            original_delivery_tag: u64,
        ) -> Result<(), BrokerError> {
            self.actions.lock().unwrap().push(Action::Republish {
                routing_key: routing_key.to_string(),
                retry_count,
                delay,
                original_delivery_tag,
            });
            Ok(())
        }
    }
}
