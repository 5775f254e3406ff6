use adflow_common::pgqueue;
use adflow_common::publisher::PublishError;
use adflow_common::store::StoreError;
use thiserror::Error;

/// Why a raw message could not be turned into an `AdRequestEvent`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationReason {
    #[error("body is not valid JSON: {0}")]
    MalformedJson(String),
    #[error("required field is missing")]
    Missing,
    #[error("expected {0}")]
    WrongType(&'static str),
    #[error("timestamp is {skew_seconds}s from receipt, over the {max_skew_seconds}s limit")]
    OutsideSkewWindow {
        skew_seconds: i64,
        max_skew_seconds: i64,
    },
}

/// A malformed message. Permanent: redelivering the same body cannot fix it.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid field {field}: {reason}")]
pub struct ValidationError {
    /// Path of the offending field, e.g. `bids[2].bid_amount`.
    pub field: String,
    pub reason: ValidationReason,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: ValidationReason) -> Self {
        Self {
            field: field.into(),
            reason,
        }
    }
}

/// Business-rule rejections raised while scoring an otherwise valid request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoringError {
    #[error("content category {0} is blocked for ad placement")]
    BlockedPlacement(String),
}

/// Failures while putting a selection result on record and handing it off.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl WriteError {
    pub fn is_transient(&self) -> bool {
        match self {
            WriteError::Store(error) => error.is_transient(),
            WriteError::Publish(error) => error.is_transient(),
        }
    }
}

/// Enumeration of errors related to initialization and consumption of the message queue.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a database error occurred when consuming the queue")]
    DatabaseError(#[from] pgqueue::DatabaseError),
}
