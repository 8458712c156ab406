use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigurationError;
use crate::model::{AccountRoleBinding, RunConfiguration, StorageDestination, TrustedAccount, DEFAULT_KEY_PREFIX};
use crate::provider::ConfigSource;

static ACCOUNT_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]{12}$").expect("static regex"));
// Account names become object key segments.
static ACCOUNT_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$").expect("static regex"));
static ROLE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_+=,.@-]{1,64}$").expect("static regex"));

fn default_key_prefix() -> String { DEFAULT_KEY_PREFIX.to_string() }

/// The collector's configuration as stored under a well-known parameter name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigBlob {
    pub audit_role_name: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    pub accounts: Vec<TrustedAccount>,
}

impl ConfigBlob {
    pub fn parse(raw: &str) -> Result<Self, ConfigurationError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigurationError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn into_run_configuration(self) -> Result<RunConfiguration, ConfigurationError> {
        validate_accounts(&self.accounts, &self.audit_role_name)?;
        if self.bucket.trim().is_empty() {
            return Err(ConfigurationError::MissingBucket);
        }
        let bindings = self
            .accounts
            .iter()
            .map(|a| AccountRoleBinding::bind(a, &self.audit_role_name))
            .collect();
        Ok(RunConfiguration {
            bindings,
            destination: StorageDestination { bucket: self.bucket, key_prefix: self.key_prefix },
        })
    }
}

pub fn validate_role_name(name: &str) -> Result<(), ConfigurationError> {
    if ROLE_NAME.is_match(name) { Ok(()) } else { Err(ConfigurationError::InvalidRoleName(name.to_string())) }
}

/// Checks an account list: non-empty, well-formed ids, valid role names, no duplicates.
pub fn validate_accounts(accounts: &[TrustedAccount], audit_role_name: &str) -> Result<(), ConfigurationError> {
    if accounts.is_empty() {
        return Err(ConfigurationError::EmptyAccounts);
    }
    validate_role_name(audit_role_name)?;

    let mut names = HashSet::new();
    let mut ids = HashSet::new();
    for (index, account) in accounts.iter().enumerate() {
        if account.account_name.trim().is_empty() {
            return Err(ConfigurationError::EmptyAccountName { index });
        }
        if !ACCOUNT_NAME.is_match(&account.account_name) {
            return Err(ConfigurationError::InvalidAccountName(account.account_name.clone()));
        }
        if account.account_id.trim().is_empty() {
            return Err(ConfigurationError::MissingAccountId { account_name: account.account_name.clone() });
        }
        if !ACCOUNT_ID.is_match(&account.account_id) {
            return Err(ConfigurationError::InvalidAccountId {
                account_name: account.account_name.clone(),
                account_id: account.account_id.clone(),
            });
        }
        if let Some(role) = &account.role_name {
            validate_role_name(role)?;
        }
        if !names.insert(account.account_name.as_str()) {
            return Err(ConfigurationError::DuplicateAccount { field: "accountName", value: account.account_name.clone() });
        }
        if !ids.insert(account.account_id.as_str()) {
            return Err(ConfigurationError::DuplicateAccount { field: "accountId", value: account.account_id.clone() });
        }
    }
    Ok(())
}

/// Reads and validates the run configuration. No caching: every run calls this.
pub async fn load_configuration(source: &dyn ConfigSource) -> Result<RunConfiguration, ConfigurationError> {
    let raw = source.fetch().await?;
    let run = ConfigBlob::parse(&raw)?.into_run_configuration()?;
    debug!(source = source.name(), accounts = run.bindings.len(), bucket = %run.destination.bucket, "configuration loaded");
    Ok(run)
}
