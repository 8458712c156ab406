//! Scheduled cross-account IAM inventory collection.
//!
//! A [`Collector`] reads the account list from a [`ConfigSource`], assumes the audit
//! role in each account, lists IAM users, roles, groups and customer-managed policies,
//! and writes one JSON object per account and run to a [`ResultStore`].

pub mod collector;
pub mod config;
pub mod error;
pub mod model;
pub mod params;
pub mod provider;
pub mod retry;
pub mod summary;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use collector::{Collector, CollectorSettings};
pub use config::{load_configuration, ConfigBlob};
pub use error::{AssumeRoleError, ConfigurationError, EnumerationError, FailureKind, StorageError};
pub use model::{
    AccountRoleBinding, CollectionResult, IamEntities, IamEntity, RunConfiguration, StorageDestination,
    TemporaryCredentials, TrustedAccount,
};
pub use params::Parameters;
pub use provider::{ConfigSource, IamEnumerator, ResultStore, RoleAssumer};
pub use retry::RetryPolicy;
pub use summary::{AccountOutcome, AccountState, RunStatus, RunSummary};
