//! In-memory collector seams for tests.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::SecretString;

use crate::error::{AssumeRoleError, ConfigurationError, EnumerationError, StorageError};
use crate::model::{IamEntities, IamEntity, StorageDestination, TemporaryCredentials};
use crate::provider::{ConfigSource, IamEnumerator, ResultStore, RoleAssumer};

pub struct StaticConfigSource {
    raw: String,
}

impl StaticConfigSource {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    fn name(&self) -> &str { "static" }

    async fn fetch(&self) -> Result<String, ConfigurationError> {
        Ok(self.raw.clone())
    }
}

/// Issues credentials whose access key id embeds the account id, so the fake enumerator can tell accounts apart.
#[derive(Default)]
pub struct FakeAssumer {
    denied: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl FakeAssumer {
    pub fn deny(&self, account_id: &str) {
        self.denied.lock().insert(account_id.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

fn account_of(role_arn: &str) -> &str {
    role_arn.split(':').nth(4).unwrap_or_default()
}

#[async_trait]
impl RoleAssumer for FakeAssumer {
    async fn assume_role(&self, role_arn: &str, _session_name: &str) -> Result<TemporaryCredentials, AssumeRoleError> {
        self.calls.lock().push(role_arn.to_string());
        let account_id = account_of(role_arn);
        if self.denied.lock().contains(account_id) {
            return Err(AssumeRoleError { role_arn: role_arn.to_string(), message: "AccessDenied".into() });
        }
        Ok(TemporaryCredentials {
            access_key_id: format!("ASIA{account_id}"),
            secret_access_key: SecretString::new("secret".into()),
            session_token: SecretString::new("token".into()),
            expiration: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Throttle this many calls, then succeed.
    Throttle(u32),
    Deny,
    Hang,
    Panic,
}

#[derive(Default)]
pub struct FakeEnumerator {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl FakeEnumerator {
    pub fn script(&self, account_id: &str, script: Script) {
        self.scripts.lock().insert(account_id.to_string(), script);
    }

    pub fn calls_for(&self, account_id: &str) -> u32 {
        self.calls.lock().get(account_id).copied().unwrap_or(0)
    }

    pub fn entities_for(account_id: &str) -> IamEntities {
        let arn = |kind: &str, name: &str| format!("arn:aws:iam::{account_id}:{kind}/{name}");
        IamEntities {
            users: vec![IamEntity::new("alice", arn("user", "alice")).with_path("/")],
            roles: vec![IamEntity::new("CrossAccountAuditRole", arn("role", "CrossAccountAuditRole")).with_path("/")],
            groups: vec![IamEntity::new("admins", arn("group", "admins")).with_path("/")],
            policies: vec![IamEntity::new("ReadOnly", arn("policy", "ReadOnly"))],
        }
    }
}

#[async_trait]
impl IamEnumerator for FakeEnumerator {
    async fn enumerate(&self, credentials: &TemporaryCredentials) -> Result<IamEntities, EnumerationError> {
        let account_id = credentials.access_key_id.trim_start_matches("ASIA").to_string();
        let call = {
            let mut calls = self.calls.lock();
            let n = calls.entry(account_id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let script = self.scripts.lock().get(&account_id).copied();
        match script {
            Some(Script::Throttle(n)) if call <= n => Err(EnumerationError::throttled("Throttling: Rate exceeded")),
            Some(Script::Deny) => Err(EnumerationError::denied("AccessDenied: iam:ListUsers")),
            Some(Script::Hang) => std::future::pending().await,
            Some(Script::Panic) => panic!("enumerator crashed for {account_id}"),
            _ => Ok(Self::entities_for(&account_id)),
        }
    }
}

/// Append-only object map keyed by object key.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    failing: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn fail_keys_containing(&self, fragment: &str) {
        self.failing.lock().push(fragment.to_string());
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(key).cloned()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn put_object(&self, _destination: &StorageDestination, key: &str, body: Vec<u8>) -> Result<(), StorageError> {
        if self.failing.lock().iter().any(|f| key.contains(f.as_str())) {
            return Err(StorageError { key: key.to_string(), message: "InternalError".into() });
        }
        let mut objects = self.objects.lock();
        if objects.contains_key(key) {
            return Err(StorageError { key: key.to_string(), message: "object already exists".into() });
        }
        objects.insert(key.to_string(), body);
        Ok(())
    }
}
