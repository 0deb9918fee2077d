//! Error types for the request pipeline.
//!
//! This module provides structured error handling for pipeline operations.
//! Admission denials (circuit breaker trips, budget exhaustion, guard
//! rejections) and cache-hit short circuits are **not** represented here -
//! they are ordinary outcomes communicated through [`crate::context::PipelineContext::aborted`]
//! and [`crate::context::PipelineContext::abort_reason`]. [`ShieldError`] is
//! reserved for genuine stage failures: a stage panicked, a serializer
//! failed, or configuration was invalid at construction time.
//!
//! # Error Handling Example
//!
//! ```rust,no_run
//! use cost_shield::{ShieldError, ShieldResult};
//!
//! fn handle_error(err: ShieldError) {
//!     if err.is_retryable() {
//!         println!("Retryable error: {}", err);
//!     }
//!
//!     let user_msg = err.user_message();
//!     println!("Tell user: {}", user_msg);
//!
//!     match err.category() {
//!         cost_shield::error::ErrorCategory::Transient => {
//!             println!("Temporary issue, try again later");
//!         }
//!         cost_shield::error::ErrorCategory::Client => {
//!             println!("Fix the request and try again");
//!         }
//!         _ => {
//!             println!("System issue, contact support");
//!         }
//!     }
//! }
//! ```

use crate::logging::{log_error, log_warn};
use thiserror::Error;

// ============================================================================
// Error categorization types
// ============================================================================

/// High-level categorization of errors for routing and handling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Expected business logic outcomes (not typically errors).
    BusinessLogic,
    /// External collaborator failures (storage adapter, broadcast channel).
    External,
    /// Internal system errors (bugs, invariant violations).
    Internal,
    /// Client errors (invalid configuration, bad input).
    Client,
    /// Temporary failures that should be retried by the caller.
    Transient,
}

/// Severity level for logging and alerting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// System is unusable or data integrity is at risk.
    Critical,
    /// Action failed but the system is stable.
    Error,
    /// Unexpected but recoverable situation.
    Warning,
    /// Expected failure (e.g. admission denied), normal operation.
    Info,
}

// ============================================================================
// Pipeline error types
// ============================================================================

/// Convenient result type for pipeline operations.
pub type ShieldResult<T> = std::result::Result<T, ShieldError>;

/// Errors that can occur while constructing or running the pipeline.
///
/// None of these variants represent admission denials or cache hits - those
/// are communicated through the context, not the error channel. Use the
/// constructor methods, which log automatically.
///
/// ```rust
/// use cost_shield::ShieldError;
///
/// let err = ShieldError::configuration_error("breaker per-session limit must be >= 0");
/// ```
#[derive(Error, Debug)]
pub enum ShieldError {
    /// A stage configuration value was invalid at construction time.
    #[error("pipeline configuration error: {message}")]
    ConfigurationError {
        /// Description of the configuration problem.
        message: String,
    },

    /// A pipeline stage raised unexpectedly while executing.
    ///
    /// The runner converts this into `ctx.abort_reason = "<stage>: <message>"`
    /// rather than propagating it - callers normally never see this variant
    /// directly unless they invoke a stage outside the runner.
    #[error("stage '{stage}' failed: {message}")]
    StageFailed {
        /// Name of the stage that failed.
        stage: String,
        /// Details about the failure.
        message: String,
    },

    /// A storage adapter operation failed.
    ///
    /// Storage failures are swallowed by every component that calls into a
    /// [`crate::storage::StorageAdapter`]; this variant exists for
    /// `OnStorageError` hooks and for adapters that want to report why.
    #[error("storage error: {message}")]
    StorageError {
        /// Details about the storage failure.
        message: String,
    },

    /// Serializing or deserializing persisted state failed.
    #[error("serialization error: {message}")]
    SerializationError {
        /// Details about the serialization failure.
        message: String,
    },

    /// No pricing entry exists for a model and no fallback could be applied.
    ///
    /// In practice this should never surface - [`crate::pricing`] always
    /// falls back to a default rate - but the variant exists for adapters
    /// that want to enforce a stricter policy.
    #[error("no pricing information for model: {model}")]
    UnknownModel {
        /// The model identifier that had no pricing entry.
        model: String,
    },
}

impl ShieldError {
    /// Get the error category for routing and handling decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConfigurationError { .. } => ErrorCategory::Client,
            Self::StageFailed { .. } => ErrorCategory::Internal,
            Self::StorageError { .. } => ErrorCategory::External,
            Self::SerializationError { .. } => ErrorCategory::Internal,
            Self::UnknownModel { .. } => ErrorCategory::Client,
        }
    }

    /// Get the error severity for logging and alerting.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::ConfigurationError { .. } => ErrorSeverity::Error,
            Self::StageFailed { .. } => ErrorSeverity::Error,
            Self::StorageError { .. } => ErrorSeverity::Warning,
            Self::SerializationError { .. } => ErrorSeverity::Warning,
            Self::UnknownModel { .. } => ErrorSeverity::Warning,
        }
    }

    /// Whether this error is transient and should trigger a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageError { .. })
    }

    /// Convert to a user-friendly message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            Self::ConfigurationError { .. } => {
                "Pipeline configuration issue. Please check your settings".to_string()
            }
            Self::StageFailed { .. } => "Request processing failed. Please try again".to_string(),
            Self::StorageError { .. } => {
                "A background persistence operation failed".to_string()
            }
            Self::SerializationError { .. } => "Unable to read or write saved state".to_string(),
            Self::UnknownModel { .. } => "Unrecognized model for cost estimation".to_string(),
        }
    }

    // =========================================================================
    // Constructor methods with automatic logging
    // =========================================================================

    /// Create a configuration error (logs at ERROR level).
    pub fn configuration_error(message: impl Into<String>) -> Self {
        let message = message.into();
        log_error!(
            error_type = "configuration_error",
            message = %message,
            "pipeline configuration validation failed"
        );
        Self::ConfigurationError { message }
    }

    /// Create a stage failure error (logs at ERROR level).
    pub fn stage_failed(stage: impl Into<String>, message: impl Into<String>) -> Self {
        let stage = stage.into();
        let message = message.into();
        log_error!(
            error_type = "stage_failed",
            stage = %stage,
            message = %message,
            "pipeline stage failed"
        );
        Self::StageFailed { stage, message }
    }

    /// Create a storage error (logs at WARN level - storage failures never
    /// abort the pipeline, they are reported and swallowed).
    pub fn storage_error(message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(
            error_type = "storage_error",
            message = %message,
            "pipeline storage operation failed"
        );
        Self::StorageError { message }
    }

    /// Create a serialization error (logs at WARN level).
    pub fn serialization_error(message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(
            error_type = "serialization_error",
            message = %message,
            "pipeline serialization failed"
        );
        Self::SerializationError { message }
    }

    /// Create an unknown-model error (logs at WARN level).
    pub fn unknown_model(model: impl Into<String>) -> Self {
        let model = model.into();
        log_warn!(
            error_type = "unknown_model",
            model = %model,
            "no pricing entry for model"
        );
        Self::UnknownModel { model }
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    // UNIT UNDER TEST: ShieldError categorization and messaging
    // BUSINESS RESPONSIBILITY: every variant must report a stable category,
    //   severity, and retryability so callers can branch without matching
    //   on the enum directly.
    // TEST COVERAGE:
    //   - category() mapping for each variant
    //   - is_retryable() only true for storage errors
    //   - user_message() never echoes internal details verbatim

    #[test]
    fn configuration_error_is_client_category_and_not_retryable() {
        // Arrange
        let err = ShieldError::configuration_error("bad limit");

        // Act
        let category = err.category();
        let retryable = err.is_retryable();

        // Assert
        assert_eq!(category, ErrorCategory::Client);
        assert!(!retryable);
    }

    #[test]
    fn storage_error_is_retryable() {
        // Arrange
        let err = ShieldError::storage_error("disk full");

        // Act / Assert
        assert!(err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::External);
    }

    #[test]
    fn stage_failed_message_includes_stage_name() {
        // Arrange
        let err = ShieldError::stage_failed("cache", "lookup panicked");

        // Act
        let rendered = err.to_string();

        // Assert
        assert!(rendered.contains("cache"));
        assert!(rendered.contains("lookup panicked"));
    }

    #[test]
    fn user_message_never_exposes_raw_field_values() {
        // Arrange
        let err = ShieldError::unknown_model("mystery-model-9000");

        // Act
        let msg = err.user_message();

        // Assert
        assert!(!msg.contains("mystery-model-9000"));
    }
}
