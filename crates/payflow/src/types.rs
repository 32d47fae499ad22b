//! Service configuration types.

use std::time::Duration;

/// Tunable knobs of the transfer orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    /// How long the idempotency cache retains a `key → reference` mapping
    pub idempotency_ttl: Duration,
    /// Deadline applied to every Account Service call
    pub port_deadline: Duration,
    /// Reference regenerations allowed on a uniqueness collision
    pub reference_retries: u32,
    /// Age beyond which a non-terminal transfer counts as stuck
    pub stuck_threshold: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            port_deadline: Duration::from_secs(30),
            reference_retries: 3,
            stuck_threshold: Duration::from_secs(15 * 60),
        }
    }
}
