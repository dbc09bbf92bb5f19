use thiserror::Error;
use uuid::Uuid;

use crate::address::AddressError;
use crate::operation::ParentSetError;
use crate::store::StoreError;

/// Error types for the percolation engine
#[derive(Error, Debug)]
pub enum PercolatorError {
    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Composition error: {0}")]
    Composition(String),

    #[error("Missing data: {0}")]
    MissingData(String),

    #[error("Collision: {0}")]
    Collision(String),

    #[error("State error: {0}")]
    State(String),

    #[error(transparent)]
    Parents(#[from] ParentSetError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Compute failed for operation {operation}: {cause}")]
    Compute {
        operation: Uuid,
        cause: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, PercolatorError>;
