use std::sync::Arc;

use anyhow::{anyhow, Context};
use futures_lite::StreamExt;
use lapin::options::BasicConsumeOptions;
use lapin::types::FieldTable;
use tracing::{info, warn};

use shared::Channel as NotificationChannel;

use notification_worker::broker::{header_retry_count, BrokerSession};
use notification_worker::config::Config;
use notification_worker::dispatch::ChannelDispatcher;
use notification_worker::idempotency::RedisIdempotencyStore;
use notification_worker::pipeline::{Pipeline, RawDelivery};

type WorkerPipeline = Pipeline<RedisIdempotencyStore, ChannelDispatcher>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("notification_worker=info")
        .json()
        .init();

    info!("starting notification-worker");

    let config = Config::from_env()?;

    let broker = BrokerSession::connect_with_retry(&config.rabbitmq_url).await?;
    info!("connected to broker");
    broker.declare_topology().await?;
    broker.set_prefetch(config.prefetch_count).await?;

    let store = Arc::new(RedisIdempotencyStore::connect(&config.redis_url).await?);
    info!("connected to idempotency store");

    let dispatcher = Arc::new(ChannelDispatcher {
        force_failure: config.force_failure,
    });
    let pipeline = WorkerPipeline::new(store, dispatcher, config.dispatch_timeout);

    let channel = broker.channel();
    let result = run(&channel, &pipeline, &config).await;

    broker.shutdown().await?;
    info!("notification-worker stopped");
    result
}

/// Drains the email/sms/push queues on one shared channel from a single
/// task. One delivery is processed at a time; the next `.next()` isn't
/// polled until the current delivery has been fully acked, retried, or
/// dead-lettered.
async fn run(
    channel: &lapin::Channel,
    pipeline: &WorkerPipeline,
    config: &Config,
) -> anyhow::Result<()> {
    let mut email = consume(channel, NotificationChannel::Email, config).await?;
    let mut sms = consume(channel, NotificationChannel::Sms, config).await?;
    let mut push = consume(channel, NotificationChannel::Push, config).await?;

    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received");
                return Ok(());
            }
            item = email.next() => {
                if !process_delivery(channel, pipeline, NotificationChannel::Email, item).await? {
                    return Err(anyhow!("email consumer stream ended"));
                }
            }
            item = sms.next() => {
                if !process_delivery(channel, pipeline, NotificationChannel::Sms, item).await? {
                    return Err(anyhow!("sms consumer stream ended"));
                }
            }
            item = push.next() => {
                if !process_delivery(channel, pipeline, NotificationChannel::Push, item).await? {
                    return Err(anyhow!("push consumer stream ended"));
                }
            }
        }
    }
}

async fn consume(
    channel: &lapin::Channel,
    notification_channel: NotificationChannel,
    config: &Config,
) -> anyhow::Result<lapin::Consumer> {
    let queue_name = notification_channel.queue_name();
    let consumer_tag = format!(
        "{}-{}-{}",
        config.consumer_tag_prefix,
        notification_channel.routing_key(),
        uuid::Uuid::new_v4()
    );

    let consumer = channel
        .basic_consume(
            &queue_name,
            &consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("failed to consume from {}", queue_name))?;

    info!(queue = %queue_name, consumer_tag = %consumer_tag, "consuming");
    Ok(consumer)
}

/// Returns `Ok(false)` when the consumer stream has ended, which the caller
/// treats as a connection loss and exits the process for a supervisor to
/// restart.
async fn process_delivery(
    channel: &lapin::Channel,
    pipeline: &WorkerPipeline,
    notification_channel: NotificationChannel,
    item: Option<Result<lapin::message::Delivery, lapin::Error>>,
) -> anyhow::Result<bool> {
    match item {
        Some(Ok(delivery)) => {
            let raw = RawDelivery {
                delivery_tag: delivery.delivery_tag,
                routing_key: notification_channel.routing_key().to_string(),
                body: delivery.data.clone(),
                header_retry_count: header_retry_count(&delivery.properties),
            };
            pipeline.process(channel, raw).await;
            Ok(true)
        }
        Some(Err(e)) => Err(e.into()),
        None => {
            warn!(channel = ?notification_channel, "consumer stream ended");
            Ok(false)
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
