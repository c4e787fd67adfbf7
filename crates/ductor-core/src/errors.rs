//! Domain error type shared across the orchestrator.

use thiserror::Error;

/// Errors surfaced by the ductor core.
///
/// Recoverable conditions (resume failure, SIGKILL) are handled inside the
/// flows and never reach callers as errors; everything here is terminal for
/// the current operation and becomes a single user-facing sentence.
#[derive(Debug, Error)]
pub enum DuctorError {
    /// Parameter/model validation failed before any subprocess was spawned.
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration is inconsistent (unknown provider, no providers).
    #[error("configuration error: {0}")]
    Config(String),

    /// A cron job definition or execution failed.
    #[error("cron error: {0}")]
    Cron(String),

    /// A webhook definition or dispatch failed.
    #[error("webhook error: {0}")]
    Webhook(String),
}
