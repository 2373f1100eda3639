use thiserror::Error as ThisError;

use crate::gateway::compiler::CompileError;
use crate::gateway::reconciler::ReconcileError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Invalid input data or business rule violation
    #[error("{message}")]
    InvalidInput { message: String },

    /// Requested record not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// A provider set could not be compiled into a route
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Route reconciliation failed
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// Database operation failed
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found(resource: &str, id: impl ToString) -> Self {
        Error::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }
}

/// Type alias for crate operation results
pub type Result<T> = std::result::Result<T, Error>;
