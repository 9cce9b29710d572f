use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// SMTP reply codes the dispatch pipeline hands back to its callers.
///
/// Only the replies the pipeline itself produces are named; any other code
/// round-trips through [`Status::Other`]. The numeric code is the single
/// source of truth: classification, display and serialization all go through
/// [`Status::code`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum Status {
    /// 250: requested action completed.
    Ok,
    /// 421: service not available.
    ServiceNotAvailable,
    /// 451: local processing error, try again later.
    LocalError,
    /// 501: syntax error in parameters, e.g. a malformed address.
    SyntaxError,
    /// 550: mailbox unavailable or refused by policy.
    MailboxUnavailable,
    /// 552: storage allocation exceeded.
    StorageExceeded,
    /// 554: transaction failed.
    TransactionFailed,
    /// Any reply code without a dedicated variant.
    Other(u16),
}

impl Status {
    /// The three-digit reply code.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::Ok => 250,
            Self::ServiceNotAvailable => 421,
            Self::LocalError => 451,
            Self::SyntaxError => 501,
            Self::MailboxUnavailable => 550,
            Self::StorageExceeded => 552,
            Self::TransactionFailed => 554,
            Self::Other(code) => code,
        }
    }

    #[must_use]
    pub const fn from_code(code: u16) -> Self {
        match code {
            250 => Self::Ok,
            421 => Self::ServiceNotAvailable,
            451 => Self::LocalError,
            501 => Self::SyntaxError,
            550 => Self::MailboxUnavailable,
            552 => Self::StorageExceeded,
            554 => Self::TransactionFailed,
            code => Self::Other(code),
        }
    }

    /// Whether the reply is a permanent (5xx) failure.
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        self.code() / 100 == 5
    }

    /// Whether the reply is a temporary (4xx) failure.
    #[must_use]
    pub const fn is_temporary(self) -> bool {
        self.code() / 100 == 4
    }
}

impl From<u16> for Status {
    fn from(code: u16) -> Self {
        Self::from_code(code)
    }
}

impl From<Status> for u16 {
    fn from(status: Status) -> Self {
        status.code()
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", self.code())
    }
}

/// RFC 3463 enhanced status code, e.g. `5.1.3` for a bad address syntax.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct EnhancedCode(pub u16, pub u16, pub u16);

impl Display for EnhancedCode {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}.{}.{}", self.0, self.1, self.2)
    }
}
