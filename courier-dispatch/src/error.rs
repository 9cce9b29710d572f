//! Typed error handling for dispatch operations.
//!
//! Everything the dispatcher can fail with maps onto an SMTP reply:
//! malformed envelope addresses surface as 501 with enhanced code 5.1.3,
//! policy rejections carry whatever reply they were configured or produced
//! with, and implementor failures fall back to a temporary 451.

use courier_common::{
    address::AddressError,
    status::{EnhancedCode, Status},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;

/// A policy rejection: an SMTP reply code, its enhanced code and the text
/// sent to the client. Produced by checks and configured on routing blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{status} {enhanced} {message}")]
pub struct Rejection {
    pub status: Status,
    pub enhanced: EnhancedCode,
    pub message: String,
}

impl Rejection {
    #[must_use]
    pub fn new(status: Status, enhanced: EnhancedCode, message: impl Into<String>) -> Self {
        Self {
            status,
            enhanced,
            message: message.into(),
        }
    }

    /// The usual "rejected by local policy" reply.
    #[must_use]
    pub fn policy(message: impl Into<String>) -> Self {
        Self::new(Status::MailboxUnavailable, EnhancedCode(5, 7, 1), message)
    }
}

/// Top-level dispatch error type.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The envelope sender could not be decomposed for domain matching.
    /// The empty sender is exempt and never produces this.
    #[error("invalid sender address {addr:?}: {source}")]
    InvalidSender { addr: String, source: AddressError },

    /// A recipient could not be decomposed for domain matching.
    #[error("invalid recipient address {addr:?}: {source}")]
    InvalidRecipient { addr: String, source: AddressError },

    /// A check or a matched routing block rejected the transaction.
    #[error(transparent)]
    Rejected(#[from] Rejection),

    /// The accumulated check score crossed the configured reject threshold.
    #[error("message rejected: check score {score} reached threshold {threshold}")]
    ScoreReject { score: i32, threshold: i32 },

    /// A check, modifier or delivery backend failed operationally.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DispatchError {
    /// The SMTP reply code this error surfaces as.
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Self::InvalidSender { .. } | Self::InvalidRecipient { .. } => Status::SyntaxError,
            Self::Rejected(rejection) => rejection.status,
            Self::ScoreReject { .. } => Status::MailboxUnavailable,
            Self::Internal(_) => Status::LocalError,
        }
    }

    /// The RFC 3463 enhanced code this error surfaces as.
    #[must_use]
    pub fn enhanced_code(&self) -> EnhancedCode {
        match self {
            Self::InvalidSender { .. } | Self::InvalidRecipient { .. } => EnhancedCode(5, 1, 3),
            Self::Rejected(rejection) => rejection.enhanced,
            Self::ScoreReject { .. } => EnhancedCode(5, 7, 1),
            Self::Internal(_) => EnhancedCode(4, 0, 0),
        }
    }

    /// Whether the error is a permanent failure.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        self.status().is_permanent()
    }
}
