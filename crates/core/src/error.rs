use serde::Serialize;
use thiserror::Error;

/// Fatal to a whole run: there is nothing to collect without a valid account list.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("no trusted accounts configured")]
    EmptyAccounts,
    #[error("trusted account #{index} has an empty accountName")]
    EmptyAccountName { index: usize },
    #[error("invalid account name '{0}' (letters, digits, '.', '_' and '-' only)")]
    InvalidAccountName(String),
    #[error("trusted account '{account_name}' has no accountId")]
    MissingAccountId { account_name: String },
    #[error("trusted account '{account_name}' has invalid accountId '{account_id}' (expected 12 digits)")]
    InvalidAccountId { account_name: String, account_id: String },
    #[error("duplicate trusted account {field} '{value}'")]
    DuplicateAccount { field: &'static str, value: String },
    #[error("invalid IAM role name '{0}'")]
    InvalidRoleName(String),
    #[error("storage bucket is not configured")]
    MissingBucket,
    #[error("schedule expression is empty")]
    EmptySchedule,
    #[error("read configuration '{name}': {message}")]
    Source { name: String, message: String },
    #[error("parse configuration blob: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("parse stack parameters: {0}")]
    Parameters(#[from] serde_yaml::Error),
}

#[derive(Error, Debug, Clone)]
#[error("assume role {role_arn}: {message}")]
pub struct AssumeRoleError {
    pub role_arn: String,
    pub message: String,
}

#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct EnumerationError {
    pub message: String,
    /// Throttling and transient service faults; access denial is not.
    pub retryable: bool,
}

impl EnumerationError {
    pub fn throttled(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: true }
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: false }
    }
}

#[derive(Error, Debug, Clone)]
#[error("write {key}: {message}")]
pub struct StorageError {
    pub key: String,
    pub message: String,
}

/// Per-account failure category recorded in the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    AssumeRoleError,
    EnumerationError,
    StorageError,
    TimeoutError,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::AssumeRoleError => "AssumeRoleError",
            FailureKind::EnumerationError => "EnumerationError",
            FailureKind::StorageError => "StorageError",
            FailureKind::TimeoutError => "TimeoutError",
        };
        f.write_str(s)
    }
}
