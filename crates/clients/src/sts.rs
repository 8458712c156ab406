use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sts::error::DisplayErrorContext;
use aws_sdk_sts::Client;
use chrono::{TimeZone, Utc};
use iam_collector_core::{AssumeRoleError, RoleAssumer, TemporaryCredentials};
use secrecy::SecretString;

pub struct StsRoleAssumer {
    client: Client,
}

impl StsRoleAssumer {
    pub fn new(sdk: &SdkConfig) -> Self {
        Self { client: Client::new(sdk) }
    }
}

#[async_trait]
impl RoleAssumer for StsRoleAssumer {
    async fn assume_role(&self, role_arn: &str, session_name: &str) -> Result<TemporaryCredentials, AssumeRoleError> {
        let fail = |message: String| AssumeRoleError { role_arn: role_arn.to_string(), message };
        let out = self
            .client
            .assume_role()
            .role_arn(role_arn)
            .role_session_name(session_name)
            .send()
            .await
            .map_err(|e| fail(DisplayErrorContext(&e).to_string()))?;
        let creds = out.credentials().ok_or_else(|| fail("response carried no credentials".to_string()))?;
        Ok(TemporaryCredentials {
            access_key_id: creds.access_key_id().to_string(),
            secret_access_key: SecretString::new(creds.secret_access_key().to_string()),
            session_token: SecretString::new(creds.session_token().to_string()),
            expiration: Utc.timestamp_opt(creds.expiration().secs(), 0).single(),
        })
    }
}
