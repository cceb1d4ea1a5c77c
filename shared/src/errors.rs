use thiserror::Error;

/// Outcome of a channel dispatcher invocation.
///
/// The pipeline treats every variant identically today (retry until
/// exhaustion, then DLQ) but the classification is part of the contract so a
/// future policy hook can skip retries on `PermanentFailure` without a
/// data-model change.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("payload missing required field(s): {0}")]
    InvalidPayload(String),

    #[error("transient failure: {0}")]
    TransientFailure(String),

    #[error("permanent failure: {0}")]
    PermanentFailure(String),
}

/// Failure to turn a raw broker delivery into a validated `NotificationMessage`.
///
/// Every variant is a DLQ-without-retry condition: a deterministic defect in
/// the message itself that redelivery cannot fix.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("malformed JSON body: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("unknown notification type: {0}")]
    UnknownType(String),

    #[error("retryCount {retry_count} exceeds MAX_RETRIES {max_retries}")]
    RetryCountExceeded { retry_count: u32, max_retries: u32 },
}

pub type DispatchResult = Result<(), DispatchError>;
pub type EnvelopeResult<T> = Result<T, EnvelopeError>;
