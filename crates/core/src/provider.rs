use async_trait::async_trait;

use crate::error::{AssumeRoleError, ConfigurationError, EnumerationError, StorageError};
use crate::model::{IamEntities, StorageDestination, TemporaryCredentials};

/// Where the configuration blob lives (an SSM parameter in production).
#[async_trait]
pub trait ConfigSource: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self) -> Result<String, ConfigurationError>;
}

#[async_trait]
pub trait RoleAssumer: Send + Sync {
    async fn assume_role(&self, role_arn: &str, session_name: &str) -> Result<TemporaryCredentials, AssumeRoleError>;
}

/// Lists users, roles, groups and customer-managed policies, following every page.
#[async_trait]
pub trait IamEnumerator: Send + Sync {
    async fn enumerate(&self, credentials: &TemporaryCredentials) -> Result<IamEntities, EnumerationError>;
}

/// Append-only object storage. Implementations must refuse to overwrite an existing key.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn put_object(&self, destination: &StorageDestination, key: &str, body: Vec<u8>) -> Result<(), StorageError>;
}
