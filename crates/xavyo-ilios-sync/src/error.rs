//! Error types for the Ilios sync engine.

use thiserror::Error;

use crate::ids::{AccountId, RemoteId};
use crate::models::ResourceKind;
use crate::plan::MutationOp;

/// Result type alias using `IliosError`.
pub type IliosResult<T> = Result<T, IliosError>;

/// Errors that can occur while syncing rosters from Ilios.
#[derive(Debug, Error)]
pub enum IliosError {
    /// Configuration validation error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport or authentication failure talking to the Ilios API.
    #[error("Ilios API unavailable: {0}")]
    RemoteUnavailable(String),

    /// A requested record does not exist in Ilios.
    #[error("Ilios {kind} {id} not found")]
    NotFound { kind: ResourceKind, id: RemoteId },

    /// Response body could not be decoded.
    #[error("Failed to parse Ilios response: {0}")]
    Parse(String),

    /// A remote user has no matching local account.
    #[error("No local account matches Ilios user {remote_id}")]
    UnmappedIdentity { remote_id: RemoteId },

    /// The roster collaborator rejected a single mutation.
    #[error("Failed to {op} account {account}: {message}")]
    MutationFailure {
        op: MutationOp,
        account: AccountId,
        message: String,
    },

    /// The roster collaborator failed to read state.
    #[error("Roster error: {0}")]
    Roster(String),
}

impl IliosError {
    /// Whether this error means the record does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this error ends the current sync target's run.
    ///
    /// Mutation failures and unmapped identities are recorded and skipped.
    #[must_use]
    pub fn is_fatal_for_target(&self) -> bool {
        !matches!(
            self,
            Self::MutationFailure { .. } | Self::UnmappedIdentity { .. }
        )
    }
}

impl From<reqwest::Error> for IliosError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Parse(e.to_string())
        } else {
            Self::RemoteUnavailable(e.to_string())
        }
    }
}

impl From<serde_json::Error> for IliosError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}
