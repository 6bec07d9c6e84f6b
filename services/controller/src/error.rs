//! Controller error type.

use runnerpool_reconcile::{ReconcileError, VmId};
use thiserror::Error;

use crate::hypervisor::HypervisorError;
use crate::registration::RegistrationError;
use crate::token::TokenError;

/// Result type for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Errors surfaced by the reconciliation loop and its setup.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("hypervisor error: {0}")]
    Hypervisor(#[from] HypervisorError),

    #[error("registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("token error: {0}")]
    Token(#[from] TokenError),

    /// Every id of the managed range is taken.
    #[error("no free vmid in range {min}..={max}")]
    AllocationExhausted { min: VmId, max: VmId },

    #[error("invalid vmid range {min}..={max}")]
    InvalidRange { min: VmId, max: VmId },
}

impl From<ReconcileError> for ControllerError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Exhausted { min, max } => Self::AllocationExhausted { min, max },
            ReconcileError::InvalidRange { min, max } => Self::InvalidRange { min, max },
        }
    }
}
