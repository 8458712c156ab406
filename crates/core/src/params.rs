use serde::{Deserialize, Serialize};

use crate::config::{validate_accounts, ConfigBlob};
use crate::error::ConfigurationError;
use crate::model::{AccountRoleBinding, TrustedAccount, DEFAULT_KEY_PREFIX};

/// Last weekday of every month, 00:00 UTC, in the EventBridge cron dialect.
pub const DEFAULT_SCHEDULE: &str = "cron(0 0 LW * ? *)";

fn default_schedule() -> String { DEFAULT_SCHEDULE.to_string() }
fn default_function_name() -> String { "iam-collector".to_string() }
fn default_timeout() -> u32 { 600 }
fn default_memory() -> u32 { 256 }
fn default_retention() -> u32 { 90 }

/// Deployment inputs for both stacks, loaded from `collector.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameters {
    /// Account that runs the collector and is trusted by every audit role.
    pub audit_account_id: String,
    pub trusted_accounts: Vec<TrustedAccount>,
    pub audit_role_name: String,
    pub bucket_prefix: String,
    pub ssm_parameter_prefix: String,
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default)]
    pub lambda: LambdaParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LambdaParameters {
    #[serde(default = "default_function_name")]
    pub function_name: String,
    /// S3 location of the zipped `bootstrap` binary.
    #[serde(default)]
    pub code_bucket: String,
    #[serde(default)]
    pub code_key: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u32,
    #[serde(default = "default_memory")]
    pub memory_mb: u32,
    #[serde(default = "default_retention")]
    pub log_retention_days: u32,
}

impl Default for LambdaParameters {
    fn default() -> Self {
        Self {
            function_name: default_function_name(),
            code_bucket: String::new(),
            code_key: String::new(),
            timeout_secs: default_timeout(),
            memory_mb: default_memory(),
            log_retention_days: default_retention(),
        }
    }
}

impl Parameters {
    pub fn from_yaml_slice(bytes: &[u8]) -> Result<Self, ConfigurationError> {
        let params: Parameters = serde_yaml::from_slice(bytes)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_accounts(&self.trusted_accounts, &self.audit_role_name)?;
        let auditor = TrustedAccount::new("auditAccountId", self.audit_account_id.clone());
        validate_accounts(std::slice::from_ref(&auditor), &self.audit_role_name)?;
        if self.schedule.trim().is_empty() {
            return Err(ConfigurationError::EmptySchedule);
        }
        Ok(())
    }

    pub fn bucket_name(&self, account: &str, region: &str) -> String {
        format!("{}-{}-{}", self.bucket_prefix, account, region)
    }

    pub fn parameter_name(&self) -> String {
        format!("{}/accounts", self.ssm_parameter_prefix.trim_end_matches('/'))
    }

    pub fn bindings(&self) -> Vec<AccountRoleBinding> {
        self.trusted_accounts.iter().map(|a| AccountRoleBinding::bind(a, &self.audit_role_name)).collect()
    }

    /// Every distinct role name the collector may assume, shared name first.
    pub fn role_names(&self) -> Vec<String> {
        let mut names = vec![self.audit_role_name.clone()];
        for a in &self.trusted_accounts {
            if let Some(r) = &a.role_name {
                if !names.contains(r) {
                    names.push(r.clone());
                }
            }
        }
        names
    }

    pub fn config_blob(&self, bucket: impl Into<String>) -> ConfigBlob {
        ConfigBlob {
            audit_role_name: self.audit_role_name.clone(),
            bucket: bucket.into(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            accounts: self.trusted_accounts.clone(),
        }
    }
}
