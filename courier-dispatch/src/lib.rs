//! Message dispatcher for a mail transport system.
//!
//! Given an inbound transaction (envelope sender, recipients, body), the
//! dispatcher selects which delivery backends each recipient's copy goes to,
//! runs policy checks and envelope/body modifiers at global, per-sender and
//! per-recipient scope, and multiplexes body delivery across the chosen
//! backends with commit/abort semantics and LMTP-style streaming statuses.
//!
//! The dispatcher is library-level: it is driven by a mail source (an SMTP,
//! submission or LMTP listener) and consumes checks, modifiers and backends
//! through the capability traits in [`module`].

mod checks;
mod matcher;

pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod modify;
pub mod module;

pub use delivery::DispatchDelivery;
pub use dispatcher::{DispatchSettings, Dispatcher, DispatcherBuilder, RcptBlock, SourceBlock};
pub use error::{DispatchError, Rejection, Result};
pub use modify::ModifierSet;
pub use module::{
    Check, CheckOutcome, DeliverySession, DeliveryTarget, Modifier, ModifierState, MsgMeta,
    PartialDelivery, StatusCollector,
};
