// src/error.rs

//! Crate-wide error type and `Result` alias
//!
//! Every failure the runtime reports falls into one of a small number of
//! categories. Resolution and state-change failures are recoverable: the
//! caller may retry once the graph or the in-flight operation changes.
//! Declaration errors are fatal for the install/update attempt that carried
//! the bad manifest, never for the runtime as a whole.

use crate::bundle::BundleId;
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A mandatory dependency could not be satisfied. The bundle stays
    /// INSTALLED; the reason names the missing packages or the blocking
    /// bundle so diagnostics can replay it verbatim.
    #[error("bundle {bundle} could not be resolved: {reason}")]
    Resolution { bundle: BundleId, reason: String },

    /// Two singleton generations with the same symbolic name cannot both be
    /// resolved.
    #[error("singleton {symbolic_name} blocked by {blocker}")]
    SingletonConflict {
        symbolic_name: String,
        blocker: String,
    },

    /// A lifecycle transition was attempted while another operation on the
    /// same bundle was in flight and the bounded wait expired.
    #[error("bundle {bundle} is busy: operation {operation} in progress")]
    StateChange { bundle: BundleId, operation: String },

    /// The transition is not legal from the bundle's current state.
    #[error("bundle {bundle} in state {state} cannot {action}")]
    IllegalState {
        bundle: BundleId,
        state: String,
        action: &'static str,
    },

    /// A user-supplied activator failed during start or stop. The bundle is
    /// rolled back to a well-defined state; the original error is preserved.
    #[error("activator error in bundle {bundle}: {source}")]
    Activation {
        bundle: BundleId,
        #[source]
        source: anyhow::Error,
    },

    /// Malformed or contradictory dependency declarations.
    #[error("invalid manifest: {0}")]
    Manifest(String),

    /// No bundle is installed under this id.
    #[error("no such bundle: {0}")]
    NoSuchBundle(BundleId),

    /// Invalid version or version-range syntax.
    #[error("invalid version: {0}")]
    Version(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
