//! Typestate markers for the transfer saga.

use payflow_common::Transfer;

/// Aggregate persisted `PENDING`, no step attempted yet.
///
/// Only `validate` is available.
pub(crate) struct Ready {
    pub transfer: Transfer,
}

/// Validation passed; the aggregate holds no side effects yet.
///
/// Only `debit` is available.
pub(crate) struct Validated {
    pub transfer: Transfer,
}

/// Debit succeeded and its transaction id is durable.
///
/// Only `credit` is available.
pub(crate) struct Debited {
    pub transfer: Transfer,
}

/// Credit succeeded and its transaction id is durable.
///
/// Only `finalize` is available.
pub(crate) struct Credited {
    pub transfer: Transfer,
}

/// What a forward step produced.
///
/// Business failures are not errors: the step drives the aggregate to a
/// terminal state and hands back the persisted result. `Err` is reserved for
/// infrastructure failures that prevented a checkpoint from persisting.
pub(crate) enum StepOutcome<Next> {
    /// Step succeeded, the saga may continue
    Advanced(Next),
    /// The saga ended here; the aggregate is in a persisted terminal state
    Terminal(Transfer),
}
