//! SAGA-based money transfer orchestration.
//!
//! The core of a transfer service moving funds between two accounts owned by
//! an external Account Service. Forward execution runs
//! Validate → Debit → Credit with a durable checkpoint at every state
//! transition; any step failure after validation rolls back through
//! compensating actions executed in reverse order. Repeated submissions are
//! deduplicated end to end by a client-supplied idempotency key.

#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

pub mod pub_sub;
pub mod service;
pub mod types;

#[doc(hidden)]
pub use payflow_common::{
    account, amount, cache, database,
    error::{self, Error},
    event, transfer, util, Amount, Currency, Transfer, TransferReference, TransferRequest,
    TransferSnapshot, TransferStatus, TransferType,
};
pub use service::{RecoveryReport, TransferService, TransferServiceBuilder};
pub use types::ServiceConfig;
