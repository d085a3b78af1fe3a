//! Lifecycle error type.

use thiserror::Error;

use super::StateStoreError;
use crate::allocator::AllocatorError;
use crate::payload::PayloadError;
use crate::pipeline::ProvisionError;
use crate::robot::RobotError;

/// Errors raised by [`super::ServerLifecycle`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LifecycleError {
    /// The declaration is unusable.
    #[error("invalid {field}: {message}")]
    InvalidDeclaration {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },
    /// The server number or name already belongs to a managed server.
    #[error("server {name} ({server_number}) is already managed")]
    AlreadyManaged {
        /// Resource name.
        name: String,
        /// Provider server number.
        server_number: u32,
    },
    /// An identity field changed; the resource must be destroyed and
    /// recreated.
    #[error("changing {field} requires replacing server {name}")]
    RequiresReplacement {
        /// Resource name.
        name: String,
        /// Immutable field that changed.
        field: &'static str,
    },
    /// The address pool is exhausted.
    #[error(transparent)]
    Allocation(#[from] AllocatorError),
    /// A Robot call outside the pipeline failed.
    #[error("{operation} failed: {source}")]
    Provider {
        /// Operation that failed.
        operation: &'static str,
        /// Underlying API error.
        source: RobotError,
    },
    /// The provisioning pipeline failed.
    #[error("provisioning failed at {}: {source}", .source.stage)]
    Provision {
        /// Pipeline failure.
        #[from]
        source: ProvisionError,
    },
    /// Persisting state failed.
    #[error(transparent)]
    Store(#[from] StateStoreError),
}

impl LifecycleError {
    pub(crate) const fn provider(operation: &'static str, source: RobotError) -> Self {
        Self::Provider { operation, source }
    }
}

impl From<PayloadError> for LifecycleError {
    fn from(err: PayloadError) -> Self {
        let PayloadError::InvalidValue { field, reason } = err;
        Self::InvalidDeclaration {
            field,
            message: reason,
        }
    }
}
