//! Unified error handling for the ripple crate
//!
//! Each layer owns its error type ([`StoreError`], [`DeliveryError`],
//! [`ConfigError`]). The [`Error`] enum wraps them for callers that cross
//! layer boundaries, such as the worker and the CLI.
//!
//! - [`RippleErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors

use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::delivery::DeliveryError;
pub use crate::storage::StoreError;

/// Common trait for all ripple error types
pub trait RippleErrorTrait: std::error::Error {
    /// Check if this error is recoverable (a later attempt may succeed)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// HTTP delivery to the primary API or a webhook
    Network,
    /// Shared store reads and writes
    Storage,
    /// Lease acquisition and release
    Coordination,
    /// Configuration and validation errors
    Config,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Coordination => "coordination",
            Self::Config => "config",
        }
    }
}

impl RippleErrorTrait for StoreError {
    fn is_recoverable(&self) -> bool {
        StoreError::is_recoverable(self)
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Storage
    }
}

impl RippleErrorTrait for DeliveryError {
    fn is_recoverable(&self) -> bool {
        DeliveryError::is_recoverable(self)
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Network
    }
}

impl RippleErrorTrait for ConfigError {
    fn is_recoverable(&self) -> bool {
        false
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Config
    }
}

/// Unified error type for the ripple crate
#[derive(Error, Debug)]
pub enum Error {
    /// Shared store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Lease could not be acquired or released because the store failed
    #[error("Lease error on '{key}': {source}")]
    Lease {
        key: String,
        #[source]
        source: StoreError,
    },

    /// Delivery errors
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl RippleErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Store(e) | Self::Lease { source: e, .. } => e.is_recoverable(),
            Self::Delivery(e) => e.is_recoverable(),
            Self::Config(_) => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Store(_) => ErrorCategory::Storage,
            Self::Lease { .. } => ErrorCategory::Coordination,
            Self::Delivery(_) => ErrorCategory::Network,
            Self::Config(_) => ErrorCategory::Config,
        }
    }
}

impl Error {
    pub fn lease(key: impl Into<String>, source: StoreError) -> Self {
        Self::Lease {
            key: key.into(),
            source,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
