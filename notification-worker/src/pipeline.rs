//! The processing pipeline.
//!
//! For each delivered message: parse, check idempotency, dispatch, then on
//! success mark+ack, on failure schedule retry or dead-letter. Generic over
//! the idempotency store and dispatcher so it is fully testable against
//! in-memory fakes (see `tests/pipeline.rs`).

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use shared::retry;
use shared::{EnvelopeError, NotificationMessage};

use crate::broker::BrokerActions;
use crate::dispatch::Dispatch;
use crate::idempotency::IdempotencyStore;

/// What the broker session hands the pipeline for one delivery, decoupled
/// from `lapin::message::Delivery` so the pipeline doesn't depend on lapin.
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub header_retry_count: Option<u32>,
}

/// Terminal disposition of one delivery, for logging and tests. Every
/// accepted delivery lands in exactly one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Dispatched,
    Duplicate,
    Requeued,
    RetryScheduled { attempt: u32, delay: Duration },
    DeadLettered(String),
}

pub struct Pipeline<S, D> {
    store: Arc<S>,
    dispatcher: Arc<D>,
    dispatch_timeout: Duration,
}

impl<S, D> Pipeline<S, D>
where
    S: IdempotencyStore,
    D: Dispatch,
{
    pub fn new(store: Arc<S>, dispatcher: Arc<D>, dispatch_timeout: Duration) -> Self {
        Self {
            store,
            dispatcher,
            dispatch_timeout,
        }
    }

    pub async fn process<B: BrokerActions>(&self, broker: &B, raw: RawDelivery) -> Outcome {
        let message = match NotificationMessage::parse(&raw.body, raw.header_retry_count) {
            Ok(message) => message,
            Err(err) => return self.dead_letter_unparseable(broker, raw.delivery_tag, err).await,
        };

        info!(
            message_id = %message.id,
            notification_type = ?message.channel,
            user_id = %message.user_id,
            attempt = message.retry_count,
            "received"
        );

        match self.store.seen(&message.user_id, &message.idempotency_key).await {
            Ok(true) => {
                info!(message_id = %message.id, "duplicate, skipping dispatch");
                self.ack_or_log(broker, raw.delivery_tag).await;
                Outcome::Duplicate
            }
            Ok(false) => self.dispatch_and_resolve(broker, &raw, &message).await,
            Err(err) => {
                warn!(message_id = %message.id, error = %err, "idempotency store unavailable, requeueing");
                if let Err(e) = broker.requeue(raw.delivery_tag).await {
                    error!(message_id = %message.id, error = %e, "requeue failed");
                }
                Outcome::Requeued
            }
        }
    }

    async fn dispatch_and_resolve<B: BrokerActions>(
        &self,
        broker: &B,
        raw: &RawDelivery,
        message: &NotificationMessage,
    ) -> Outcome {
        let dispatch_result = tokio::time::timeout(
            self.dispatch_timeout,
            self.dispatcher.dispatch(message.channel, &message.payload),
        )
        .await;

        match dispatch_result {
            Ok(Ok(())) => {
                if let Err(err) = self.store.mark(&message.user_id, &message.idempotency_key).await
                {
                    warn!(
                        message_id = %message.id,
                        error = %err,
                        "idempotency record write failed after successful dispatch; accepting duplicate-window risk"
                    );
                }
                self.ack_or_log(broker, raw.delivery_tag).await;
                info!(message_id = %message.id, "dispatched");
                Outcome::Dispatched
            }
            Ok(Err(dispatch_err)) => {
                self.handle_failure(broker, raw, message, dispatch_err.to_string())
                    .await
            }
            Err(_elapsed) => {
                self.handle_failure(broker, raw, message, "dispatch timed out".to_string())
                    .await
            }
        }
    }

    async fn handle_failure<B: BrokerActions>(
        &self,
        broker: &B,
        raw: &RawDelivery,
        message: &NotificationMessage,
        reason: String,
    ) -> Outcome {
        if retry::can_retry(message.retry_count) {
            let next_attempt = message.retry_count + 1;
            let delay = retry::delay(message.retry_count);
            let body = serde_json::to_vec(&message.to_body(next_attempt))
                .expect("NotificationMessage always serializes");

            if let Err(e) = broker
                .republish_with_delay(&raw.routing_key, body, next_attempt, delay, raw.delivery_tag)
                .await
            {
                error!(message_id = %message.id, error = %e, "republish for retry failed");
            }

            warn!(
                message_id = %message.id,
                reason,
                attempt = message.retry_count,
                next_attempt,
                delay_secs = delay.as_secs(),
                "retry scheduled"
            );
            Outcome::RetryScheduled {
                attempt: message.retry_count,
                delay,
            }
        } else {
            if let Err(e) = broker.dead_letter(raw.delivery_tag).await {
                error!(message_id = %message.id, error = %e, "dead-letter failed");
            }
            warn!(message_id = %message.id, reason, attempt = message.retry_count, "retries exhausted, dead-lettered");
            Outcome::DeadLettered(reason)
        }
    }

    async fn dead_letter_unparseable<B: BrokerActions>(
        &self,
        broker: &B,
        delivery_tag: u64,
        err: EnvelopeError,
    ) -> Outcome {
        warn!(error = %err, "unparseable delivery, dead-lettering without retry");
        if let Err(e) = broker.dead_letter(delivery_tag).await {
            error!(error = %e, "dead-letter failed for unparseable delivery");
        }
        Outcome::DeadLettered(err.to_string())
    }

    async fn ack_or_log<B: BrokerActions>(&self, broker: &B, delivery_tag: u64) {
        if let Err(e) = broker.ack(delivery_tag).await {
            error!(error = %e, "ack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::{Action, FakeBroker};
    use crate::dispatch::fake::ScriptedDispatcher;
    use crate::idempotency::fake::FakeIdempotencyStore;
    use shared::DispatchError;
    use std::sync::Arc;

    fn raw_delivery(body: serde_json::Value, header_retry_count: Option<u32>) -> RawDelivery {
        RawDelivery {
            delivery_tag: 1,
            routing_key: "email".to_string(),
            body: body.to_string().into_bytes(),
            header_retry_count,
        }
    }

    fn valid_body() -> serde_json::Value {
        serde_json::json!({
            "id": "a",
            "type": "email",
            "userId": "u1",
            "idempotencyKey": "k1",
            "payload": {"to": "x@y", "subject": "s", "body": "b"},
        })
    }

    #[tokio::test]
    async fn happy_path_dispatches_marks_and_acks() {
        let store = Arc::new(FakeIdempotencyStore::new());
        let dispatcher = Arc::new(ScriptedDispatcher::always_succeed());
        let pipeline = Pipeline::new(store.clone(), dispatcher, Duration::from_secs(1));
        let broker = FakeBroker::new();

        let outcome = pipeline.process(&broker, raw_delivery(valid_body(), None)).await;

        assert_eq!(outcome, Outcome::Dispatched);
        assert!(store.contains("u1", "k1"));
        assert_eq!(broker.actions(), vec![Action::Ack(1)]);
    }

    #[tokio::test]
    async fn duplicate_suppresses_dispatch() {
        let store = Arc::new(FakeIdempotencyStore::new().pre_populate("u1", "k1"));
        let dispatcher = Arc::new(ScriptedDispatcher::always_succeed());
        let pipeline = Pipeline::new(store, dispatcher.clone(), Duration::from_secs(1));
        let broker = FakeBroker::new();

        let outcome = pipeline.process(&broker, raw_delivery(valid_body(), None)).await;

        assert_eq!(outcome, Outcome::Duplicate);
        assert_eq!(dispatcher.call_count(), 0);
        assert_eq!(broker.actions(), vec![Action::Ack(1)]);
    }

    #[tokio::test]
    async fn transient_failure_schedules_retry() {
        let store = Arc::new(FakeIdempotencyStore::new());
        let dispatcher = Arc::new(ScriptedDispatcher::always_fail(DispatchError::TransientFailure(
            "boom".to_string(),
        )));
        let pipeline = Pipeline::new(store, dispatcher, Duration::from_secs(1));
        let broker = FakeBroker::new();

        let outcome = pipeline.process(&broker, raw_delivery(valid_body(), None)).await;

        assert_eq!(
            outcome,
            Outcome::RetryScheduled {
                attempt: 0,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            broker.actions(),
            vec![Action::Republish {
                routing_key: "email".to_string(),
                retry_count: 1,
                delay: Duration::from_secs(1),
                original_delivery_tag: 1,
            }]
        );
    }

    #[tokio::test]
    async fn retries_exhausted_dead_letters() {
        let store = Arc::new(FakeIdempotencyStore::new());
        let dispatcher = Arc::new(ScriptedDispatcher::always_fail(DispatchError::TransientFailure(
            "boom".to_string(),
        )));
        let pipeline = Pipeline::new(store.clone(), dispatcher, Duration::from_secs(1));
        let broker = FakeBroker::new();

        let mut body = valid_body();
        body["retryCount"] = serde_json::json!(5);

        let outcome = pipeline.process(&broker, raw_delivery(body, None)).await;

        assert!(matches!(outcome, Outcome::DeadLettered(_)));
        assert_eq!(broker.actions(), vec![Action::DeadLetter(1)]);
        assert!(!store.contains("u1", "k1"));
    }

    #[tokio::test]
    async fn unknown_type_dead_letters_without_retry() {
        let store = Arc::new(FakeIdempotencyStore::new());
        let dispatcher = Arc::new(ScriptedDispatcher::always_succeed());
        let pipeline = Pipeline::new(store, dispatcher.clone(), Duration::from_secs(1));
        let broker = FakeBroker::new();

        let mut body = valid_body();
        body["type"] = serde_json::json!("fax");

        let outcome = pipeline.process(&broker, raw_delivery(body, None)).await;

        assert!(matches!(outcome, Outcome::DeadLettered(_)));
        assert_eq!(dispatcher.call_count(), 0);
        assert_eq!(broker.actions(), vec![Action::DeadLetter(1)]);
    }

    #[tokio::test]
    async fn malformed_json_dead_letters_immediately() {
        let store = Arc::new(FakeIdempotencyStore::new());
        let dispatcher = Arc::new(ScriptedDispatcher::always_succeed());
        let pipeline = Pipeline::new(store, dispatcher.clone(), Duration::from_secs(1));
        let broker = FakeBroker::new();

        let raw = RawDelivery {
            delivery_tag: 7,
            routing_key: "email".to_string(),
            body: b"not-json".to_vec(),
            header_retry_count: None,
        };

        let outcome = pipeline.process(&broker, raw).await;

        assert!(matches!(outcome, Outcome::DeadLettered(_)));
        assert_eq!(dispatcher.call_count(), 0);
        assert_eq!(broker.actions(), vec![Action::DeadLetter(7)]);
    }

    #[tokio::test]
    async fn idempotency_store_read_failure_requeues_without_drop() {
        let store = Arc::new(FakeIdempotencyStore::failing_seen());
        let dispatcher = Arc::new(ScriptedDispatcher::always_succeed());
        let pipeline = Pipeline::new(store, dispatcher.clone(), Duration::from_secs(1));
        let broker = FakeBroker::new();

        let outcome = pipeline.process(&broker, raw_delivery(valid_body(), None)).await;

        assert_eq!(outcome, Outcome::Requeued);
        assert_eq!(dispatcher.call_count(), 0);
        assert_eq!(broker.actions(), vec![Action::Requeue(1)]);
    }

    #[tokio::test]
    async fn idempotency_store_write_failure_still_acks() {
        let store = Arc::new(FakeIdempotencyStore::failing_mark());
        let dispatcher = Arc::new(ScriptedDispatcher::always_succeed());
        let pipeline = Pipeline::new(store, dispatcher, Duration::from_secs(1));
        let broker = FakeBroker::new();

        let outcome = pipeline.process(&broker, raw_delivery(valid_body(), None)).await;

        assert_eq!(outcome, Outcome::Dispatched);
        assert_eq!(broker.actions(), vec![Action::Ack(1)]);
    }

    #[tokio::test]
    async fn header_retry_count_wins_over_body_for_retry_decision() {
        let store = Arc::new(FakeIdempotencyStore::new());
        let dispatcher = Arc::new(ScriptedDispatcher::always_fail(DispatchError::TransientFailure(
            "boom".to_string(),
        )));
        let pipeline = Pipeline::new(store, dispatcher, Duration::from_secs(1));
        let broker = FakeBroker::new();

        let mut body = valid_body();
        body["retryCount"] = serde_json::json!(0);

        let outcome = pipeline
            .process(&broker, raw_delivery(body, Some(5)))
            .await;

        // header says attempt 5 (the last allowed attempt) -> exhausted -> DLQ
        assert!(matches!(outcome, Outcome::DeadLettered(_)));
        assert_eq!(broker.actions(), vec![Action::DeadLetter(1)]);
    }
}
