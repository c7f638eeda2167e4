use thiserror::Error;

/// User input that failed a format or positivity check. The participant is
/// re-prompted at the same dialog step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub(crate) enum ValidationError {
    #[error("budget name must not be empty")]
    EmptyName,
    #[error("expense description must not be empty")]
    EmptyDescription,
    #[error("amount is not a number")]
    MalformedAmount,
    #[error("amount must be greater than zero")]
    NonPositiveAmount,
}

#[derive(Debug, Error)]
pub(crate) enum LedgerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("an active budget already exists for this participant")]
    Conflict,
    #[error("no active budget")]
    NotFound,
    #[error("ledger store failed: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Failures reported by the chat transport collaborator.
#[derive(Debug, Error)]
pub(crate) enum TransportError {
    /// Another consumer is pulling the same update stream.
    #[allow(dead_code)]
    #[error("duplicate consumer conflict")]
    Conflict,
    #[error("transport closed")]
    Closed,
    #[error("transport i/o failed")]
    Io(#[from] std::io::Error),
}
