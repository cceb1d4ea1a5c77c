use serde::{Deserialize, Serialize};

use crate::errors::{EnvelopeError, EnvelopeResult};
use crate::retry::MAX_RETRIES;

/// Notification channel. Closed set, no plugin/registry model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
    Push,
}

impl Channel {
    /// The routing key / queue suffix this channel is bound to.
    pub fn routing_key(self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Push => "push",
        }
    }

    pub fn queue_name(self) -> String {
        format!("notifications.{}", self.routing_key())
    }
}

impl TryFrom<&str> for Channel {
    type Error = EnvelopeError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "email" => Ok(Channel::Email),
            "sms" => Ok(Channel::Sms),
            "push" => Ok(Channel::Push),
            other => Err(EnvelopeError::UnknownType(other.to_string())),
        }
    }
}

/// The wire body as the producer sends it, permissive on required
/// fields so that a missing field surfaces as a specific `EnvelopeError`
/// rather than a generic JSON decode error.
#[derive(Debug, Clone, Deserialize)]
pub struct RawNotification {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    #[serde(rename = "idempotencyKey")]
    pub idempotency_key: Option<String>,
    #[serde(default = "default_payload")]
    pub payload: serde_json::Value,
    #[serde(rename = "retryCount", default)]
    pub retry_count: u32,
}

fn default_payload() -> serde_json::Value {
    serde_json::Value::Null
}

/// Parsed, validated notification envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationMessage {
    pub id: String,
    pub channel: Channel,
    pub user_id: String,
    pub idempotency_key: String,
    pub payload: serde_json::Value,
    pub retry_count: u32,
}

impl NotificationMessage {
    /// Parse and validate a raw delivery body.
    ///
    /// `header_retry_count` is the broker-side `x-retry-count` header, if
    /// present; it takes priority over the body's `retryCount`.
    pub fn parse(body: &[u8], header_retry_count: Option<u32>) -> EnvelopeResult<Self> {
        let raw: RawNotification = serde_json::from_slice(body)?;
        Self::from_raw(raw, header_retry_count)
    }

    pub fn from_raw(raw: RawNotification, header_retry_count: Option<u32>) -> EnvelopeResult<Self> {
        let kind = raw.kind.ok_or(EnvelopeError::MissingField("type"))?;
        let channel = Channel::try_from(kind.as_str())?;

        let user_id = raw
            .user_id
            .filter(|s| !s.is_empty())
            .ok_or(EnvelopeError::MissingField("userId"))?;

        let idempotency_key = raw
            .idempotency_key
            .filter(|s| !s.is_empty())
            .ok_or(EnvelopeError::MissingField("idempotencyKey"))?;

        let retry_count = header_retry_count.unwrap_or(raw.retry_count);
        if retry_count > MAX_RETRIES {
            return Err(EnvelopeError::RetryCountExceeded {
                retry_count,
                max_retries: MAX_RETRIES,
            });
        }

        Ok(Self {
            id: raw.id.unwrap_or_default(),
            channel,
            user_id,
            idempotency_key,
            payload: raw.payload,
            retry_count,
        })
    }

    /// Serialize back to the wire body, carrying the given retry count.
    /// Used when republishing for retry.
    pub fn to_body(&self, retry_count: u32) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "type": self.channel.routing_key(),
            "userId": self.user_id,
            "idempotencyKey": self.idempotency_key,
            "payload": self.payload,
            "retryCount": retry_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_body() -> serde_json::Value {
        serde_json::json!({
            "id": "a",
            "type": "email",
            "userId": "u1",
            "idempotencyKey": "k1",
            "payload": {"to": "x@y", "subject": "s", "body": "b"},
        })
    }

    #[test]
    fn parses_valid_message_with_default_retry_count() {
        let body = valid_body().to_string();
        let msg = NotificationMessage::parse(body.as_bytes(), None).unwrap();
        assert_eq!(msg.channel, Channel::Email);
        assert_eq!(msg.user_id, "u1");
        assert_eq!(msg.idempotency_key, "k1");
        assert_eq!(msg.retry_count, 0);
    }

    #[test]
    fn header_retry_count_overrides_body() {
        let mut body = valid_body();
        body["retryCount"] = serde_json::json!(3);
        let msg = NotificationMessage::parse(body.to_string().as_bytes(), Some(1)).unwrap();
        assert_eq!(msg.retry_count, 1);
    }

    #[test]
    fn body_retry_count_used_when_no_header() {
        let mut body = valid_body();
        body["retryCount"] = serde_json::json!(2);
        let msg = NotificationMessage::parse(body.to_string().as_bytes(), None).unwrap();
        assert_eq!(msg.retry_count, 2);
    }

    #[test]
    fn rejects_unknown_type() {
        let mut body = valid_body();
        body["type"] = serde_json::json!("fax");
        let err = NotificationMessage::parse(body.to_string().as_bytes(), None).unwrap_err();
        assert!(matches!(err, EnvelopeError::UnknownType(t) if t == "fax"));
    }

    #[test]
    fn rejects_missing_type() {
        let mut body = valid_body();
        body.as_object_mut().unwrap().remove("type");
        let err = NotificationMessage::parse(body.to_string().as_bytes(), None).unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingField("type")));
    }

    #[test]
    fn rejects_missing_user_id() {
        let mut body = valid_body();
        body.as_object_mut().unwrap().remove("userId");
        let err = NotificationMessage::parse(body.to_string().as_bytes(), None).unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingField("userId")));
    }

    #[test]
    fn rejects_empty_idempotency_key() {
        let mut body = valid_body();
        body["idempotencyKey"] = serde_json::json!("");
        let err = NotificationMessage::parse(body.to_string().as_bytes(), None).unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingField("idempotencyKey")));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = NotificationMessage::parse(b"not-json", None).unwrap_err();
        assert!(matches!(err, EnvelopeError::MalformedJson(_)));
    }

    #[test]
    fn rejects_retry_count_exceeding_max() {
        let mut body = valid_body();
        body["retryCount"] = serde_json::json!(99);
        let err = NotificationMessage::parse(body.to_string().as_bytes(), None).unwrap_err();
        assert!(matches!(err, EnvelopeError::RetryCountExceeded { .. }));
    }
}
