//! Custom error types for the choreography core.
//!
//! `ChoreoError` is the single error type surfaced by the resource pool, the
//! module coordinator, the compound operations and the choreographer. Every
//! variant is fatal for the run: a half-executed wet-lab step cannot be safely
//! replayed, so nothing in this crate retries.
//!
//! ## Error Hierarchy
//!
//! - **`ResourceExhausted`**: the configured lane/role count needs more tips or
//!   wells than the deck provides. Raised during allocation, before any motion.
//! - **`AllocationConflict`**: a role was bound twice, or a reserved tip
//!   collides with an enumerated one.
//! - **`InvalidTipTransition`**: a tip was picked up, parked or consumed from a
//!   state that does not allow it (including picking up a consumed tip).
//! - **`InvalidModuleSequence`**: magnet or thermal state ordering violated.
//! - **`HardwareFault`**: the control surface rejected a call. The boundary
//!   error is wrapped unmodified.
//! - **`Config`**: configuration loading or validation failed.

use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the choreography error type.
pub type AppResult<T> = std::result::Result<T, ChoreoError>;

/// Every failure the choreography core reports.
#[derive(Error, Debug)]
pub enum ChoreoError {
    /// The deck holds fewer tips or wells than the lanes need
    #[error("Resource exhausted: {resource} needs {requested}, only {available} available")]
    ResourceExhausted {
        /// What ran out, e.g. "high-volume tips"
        resource: String,
        /// Number needed
        requested: usize,
        /// Number on the deck
        available: usize,
    },

    /// A resource would be bound twice
    #[error("Allocation conflict: {0}")]
    AllocationConflict(String),

    /// A tip was used against its lifecycle
    #[error("Cannot {action} tip {tip} while it is {state}")]
    InvalidTipTransition {
        /// Tip description
        tip: String,
        /// Attempted action
        action: &'static str,
        /// State the tip was in
        state: String,
    },

    /// A module step ran out of order
    #[error("Invalid module sequence: {0}")]
    InvalidModuleSequence(String),

    /// The control surface rejected a call
    #[error("Hardware fault: {0:#}")]
    HardwareFault(#[from] anyhow::Error),

    /// Configuration could not be loaded or validated
    #[error(transparent)]
    Config(#[from] ConfigError),
}
