//! Transport and bus lifecycle errors.

use shared_types::{ConfigurationError, EnvelopeError};
use thiserror::Error;

use crate::bus::BusState;
use crate::config::TransportKind;

/// Failure of a transport operation.
///
/// `Init` and `Enable` abort bus startup. `Io` is reported for one send and
/// never stops the bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection or state setup failed.
    #[error("{kind} transport failed to initialize: {reason}")]
    Init { kind: TransportKind, reason: String },

    /// Delivery could not be started.
    #[error("{kind} transport failed to enable: {reason}")]
    Enable { kind: TransportKind, reason: String },

    /// A single send failed.
    #[error("{kind} transport I/O error: {reason}")]
    Io { kind: TransportKind, reason: String },
}

impl TransportError {
    pub fn init(kind: TransportKind, reason: impl ToString) -> Self {
        Self::Init {
            kind,
            reason: reason.to_string(),
        }
    }

    pub fn enable(kind: TransportKind, reason: impl ToString) -> Self {
        Self::Enable {
            kind,
            reason: reason.to_string(),
        }
    }

    pub fn io(kind: TransportKind, reason: impl ToString) -> Self {
        Self::Io {
            kind,
            reason: reason.to_string(),
        }
    }

    /// The transport that failed.
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Init { kind, .. } | Self::Enable { kind, .. } | Self::Io { kind, .. } => *kind,
        }
    }
}

/// Errors from the bus facade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// A lifecycle call arrived in a state that does not allow it.
    #[error("Cannot {operation} while the bus is {state}")]
    InvalidState {
        state: BusState,
        operation: &'static str,
    },
}
