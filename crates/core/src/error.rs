//! Domain error model.

use thiserror::Error;

/// Domain-level error.
///
/// Only deterministic input failures live here. Storage concerns live in
/// `strata-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A module or tenant name cannot be used to address a partition.
    #[error("invalid name: {0}")]
    InvalidName(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_name(msg: impl Into<String>) -> Self {
        Self::InvalidName(msg.into())
    }
}
