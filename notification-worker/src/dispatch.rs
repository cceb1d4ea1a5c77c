//! Channel dispatchers.
//!
//! A closed set of three variants selected by `match` on `Channel`, no
//! plugin/registry model. None of these talk to a real SMTP/Twilio/FCM
//! provider; those transports are mocked, gated by `FORCE_FAILURE` for
//! deterministic retry/DLQ testing.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use shared::{Channel, DispatchError, DispatchResult};

/// Dispatch behind a trait so the processing pipeline can be driven by a
/// scripted fake in tests, which need controlled fail-then-succeed
/// sequences that a free function can't express.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, channel: Channel, payload: &Value) -> DispatchResult;
}

pub struct ChannelDispatcher {
    pub force_failure: bool,
}

#[async_trait]
impl Dispatch for ChannelDispatcher {
    async fn dispatch(&self, channel: Channel, payload: &Value) -> DispatchResult {
        dispatch(channel, payload, self.force_failure).await
    }
}

pub async fn dispatch(channel: Channel, payload: &Value, force_failure: bool) -> DispatchResult {
    if force_failure {
        return Err(DispatchError::TransientFailure(
            "FORCE_FAILURE enabled".to_string(),
        ));
    }

    match channel {
        Channel::Email => dispatch_email(payload),
        Channel::Sms => dispatch_sms(payload),
        Channel::Push => dispatch_push(payload),
    }
}

fn require_str<'a>(payload: &'a Value, field: &'static str) -> Result<&'a str, DispatchError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| DispatchError::InvalidPayload(field.to_string()))
}

fn dispatch_email(payload: &Value) -> DispatchResult {
    let to = require_str(payload, "to")?;
    let subject = require_str(payload, "subject")?;
    let body = require_str(payload, "body")?;

    info!(to, subject, body_len = body.len(), "email dispatched");
    Ok(())
}

fn dispatch_sms(payload: &Value) -> DispatchResult {
    let to = require_str(payload, "to")?;
    let message = require_str(payload, "message")?;

    info!(to, message_len = message.len(), "sms dispatched");
    Ok(())
}

fn dispatch_push(payload: &Value) -> DispatchResult {
    let device_token = require_str(payload, "deviceToken")?;
    let title = require_str(payload, "title")?;
    let body = require_str(payload, "body")?;
    let has_data = payload.get("data").is_some();

    info!(device_token, title, has_data, "push dispatched");
    Ok(())
}


#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted dispatcher: returns `script[call_count]`, clamping to the
    /// last entry once exhausted. Drives fail-then-succeed and always-fail
    /// retry scenarios in tests.
    pub struct ScriptedDispatcher {
        script: Vec<DispatchResult>,
        calls: AtomicUsize,
    }

    impl ScriptedDispatcher {
        pub fn new(script: Vec<DispatchResult>) -> Self {
            Self {
                script,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn always_fail(error: DispatchError) -> Self {
            Self::new(vec![Err(error)])
        }

        pub fn always_succeed() -> Self {
            Self::new(vec![Ok(())])
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Dispatch for ScriptedDispatcher {
        async fn dispatch(&self, _channel: Channel, _payload: &Value) -> DispatchResult {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            let idx = idx.min(self.script.len() - 1);
            self.script[idx].clone()
        }
    }

    /// Records the wall-clock instant of each call, for asserting the
    /// observed delay between attempts.
    pub struct TimestampedDispatcher {
        inner: ScriptedDispatcher,
        calls_at: Mutex<Vec<std::time::Instant>>,
    }

    impl TimestampedDispatcher {
        pub fn new(script: Vec<DispatchResult>) -> Self {
            Self {
                inner: ScriptedDispatcher::new(script),
                calls_at: Mutex::new(Vec::new()),
            }
        }

        pub fn call_timestamps(&self) -> Vec<std::time::Instant> {
            self.calls_at.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dispatch for TimestampedDispatcher {
        async fn dispatch(&self, channel: Channel, payload: &Value) -> DispatchResult {
            self.calls_at.lock().unwrap().push(std::time::Instant::now());
            self.inner.dispatch(channel, payload).await
        }
    }
}
