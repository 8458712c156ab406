use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Timestamp layout used in object keys; one directory per run.
pub const RUN_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

pub const DEFAULT_KEY_PREFIX: &str = "iam_collector";

/// One monitored account, as written in stack parameters and the config blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedAccount {
    pub account_name: String,
    // Defaulted so a missing id surfaces as a validation error naming the account.
    #[serde(default)]
    pub account_id: String,
    /// Overrides the shared audit role name for this account only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_name: Option<String>,
}

impl TrustedAccount {
    pub fn new(account_name: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self { account_name: account_name.into(), account_id: account_id.into(), role_name: None }
    }

    pub fn with_role_name(mut self, role_name: impl Into<String>) -> Self {
        self.role_name = Some(role_name.into());
        self
    }

    pub fn effective_role_name<'a>(&'a self, audit_role_name: &'a str) -> &'a str {
        self.role_name.as_deref().unwrap_or(audit_role_name)
    }
}

pub fn role_arn(account_id: &str, role_name: &str) -> String {
    format!("arn:aws:iam::{account_id}:role/{role_name}")
}

/// Account paired with the role the collector assumes in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountRoleBinding {
    pub account_name: String,
    pub account_id: String,
    pub role_arn: String,
}

impl AccountRoleBinding {
    pub fn bind(account: &TrustedAccount, audit_role_name: &str) -> Self {
        Self {
            account_name: account.account_name.clone(),
            account_id: account.account_id.clone(),
            role_arn: role_arn(&account.account_id, account.effective_role_name(audit_role_name)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageDestination {
    pub bucket: String,
    pub key_prefix: String,
}

impl StorageDestination {
    pub fn object_key(&self, account_name: &str, run_timestamp: DateTime<Utc>) -> String {
        let prefix = self.key_prefix.trim_end_matches('/');
        let stamp = run_timestamp.format(RUN_TIMESTAMP_FORMAT);
        if prefix.is_empty() {
            format!("{stamp}/{account_name}.json")
        } else {
            format!("{prefix}/{stamp}/{account_name}.json")
        }
    }
}

/// Everything one run needs, read fresh at run start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfiguration {
    pub bindings: Vec<AccountRoleBinding>,
    pub destination: StorageDestination,
}

/// Short-lived credentials returned by an assume-role call.
#[derive(Debug)]
pub struct TemporaryCredentials {
    pub access_key_id: String,
    pub secret_access_key: SecretString,
    pub session_token: SecretString,
    pub expiration: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IamEntity {
    pub name: String,
    pub arn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl IamEntity {
    pub fn new(name: impl Into<String>, arn: impl Into<String>) -> Self {
        Self { name: name.into(), arn: arn.into(), path: None }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IamEntities {
    pub users: Vec<IamEntity>,
    pub roles: Vec<IamEntity>,
    pub groups: Vec<IamEntity>,
    /// Customer-managed policies only.
    pub policies: Vec<IamEntity>,
}

impl IamEntities {
    pub fn total(&self) -> usize {
        self.users.len() + self.roles.len() + self.groups.len() + self.policies.len()
    }
}

/// Persisted output of one account's enumeration within one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionResult {
    pub account_name: String,
    pub account_id: String,
    pub run_timestamp: DateTime<Utc>,
    pub entities: IamEntities,
}

impl CollectionResult {
    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }
}
