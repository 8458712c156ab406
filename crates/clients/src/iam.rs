use std::future::Future;
use std::time::SystemTime;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_credential_types::Credentials;
use aws_sdk_iam::config::retry::RetryConfig;
use aws_sdk_iam::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_iam::types::PolicyScopeType;
use aws_sdk_iam::Client;
use iam_collector_core::{EnumerationError, IamEntities, IamEntity, IamEnumerator, TemporaryCredentials};
use secrecy::ExposeSecret;
use tracing::debug;

const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "RequestThrottled",
    "TooManyRequestsException",
    "ServiceUnavailable",
    "ServiceFailure",
    "InternalFailure",
];

pub fn is_retryable_code(code: Option<&str>) -> bool {
    code.is_some_and(|c| THROTTLING_CODES.contains(&c))
}

fn classify<E, R>(op: &str, err: SdkError<E, R>) -> EnumerationError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let retryable = match &err {
        SdkError::ServiceError(se) => is_retryable_code(se.err().code()),
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => true,
        _ => false,
    };
    EnumerationError { message: format!("{op}: {}", DisplayErrorContext(&err)), retryable }
}

fn next_marker(truncated: bool, marker: Option<&str>) -> Option<String> {
    if truncated { marker.map(str::to_string) } else { None }
}

/// Follows `Marker` until the listing is no longer truncated.
async fn paginate<F, Fut>(mut fetch: F) -> Result<Vec<IamEntity>, EnumerationError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<(Vec<IamEntity>, Option<String>), EnumerationError>>,
{
    let mut all = Vec::new();
    let mut marker = None;
    loop {
        let (page, next) = fetch(marker.take()).await?;
        all.extend(page);
        match next {
            Some(m) => marker = Some(m),
            None => return Ok(all),
        }
    }
}

/// Lists IAM entities with a client built from the assumed role's credentials.
pub struct IamApiEnumerator {
    base: SdkConfig,
}

impl IamApiEnumerator {
    pub fn new(sdk: &SdkConfig) -> Self {
        Self { base: sdk.clone() }
    }

    fn client_for(&self, creds: &TemporaryCredentials) -> Client {
        let provider = Credentials::new(
            creds.access_key_id.clone(),
            creds.secret_access_key.expose_secret().clone(),
            Some(creds.session_token.expose_secret().clone()),
            creds.expiration.map(SystemTime::from),
            "iam-collector-assume-role",
        );
        // The collector owns retries; SDK-level retries would multiply attempts.
        let conf = aws_sdk_iam::config::Builder::from(&self.base)
            .credentials_provider(provider)
            .retry_config(RetryConfig::disabled())
            .build();
        Client::from_conf(conf)
    }
}

#[async_trait]
impl IamEnumerator for IamApiEnumerator {
    async fn enumerate(&self, credentials: &TemporaryCredentials) -> Result<IamEntities, EnumerationError> {
        let client = &self.client_for(credentials);

        let users = paginate(|marker| async move {
            let page = client.list_users().set_marker(marker).send().await.map_err(|e| classify("ListUsers", e))?;
            let items = page
                .users()
                .iter()
                .map(|u| IamEntity::new(u.user_name(), u.arn()).with_path(u.path()))
                .collect();
            Ok((items, next_marker(page.is_truncated(), page.marker())))
        })
        .await?;

        let roles = paginate(|marker| async move {
            let page = client.list_roles().set_marker(marker).send().await.map_err(|e| classify("ListRoles", e))?;
            let items = page
                .roles()
                .iter()
                .map(|r| IamEntity::new(r.role_name(), r.arn()).with_path(r.path()))
                .collect();
            Ok((items, next_marker(page.is_truncated(), page.marker())))
        })
        .await?;

        let groups = paginate(|marker| async move {
            let page = client.list_groups().set_marker(marker).send().await.map_err(|e| classify("ListGroups", e))?;
            let items = page
                .groups()
                .iter()
                .map(|g| IamEntity::new(g.group_name(), g.arn()).with_path(g.path()))
                .collect();
            Ok((items, next_marker(page.is_truncated(), page.marker())))
        })
        .await?;

        let policies = paginate(|marker| async move {
            let page = client
                .list_policies()
                .scope(PolicyScopeType::Local)
                .set_marker(marker)
                .send()
                .await
                .map_err(|e| classify("ListPolicies", e))?;
            let items = page
                .policies()
                .iter()
                .map(|p| IamEntity {
                    name: p.policy_name().unwrap_or_default().to_string(),
                    arn: p.arn().unwrap_or_default().to_string(),
                    path: p.path().map(str::to_string),
                })
                .collect();
            Ok((items, next_marker(page.is_truncated(), page.marker())))
        })
        .await?;

        let entities = IamEntities { users, roles, groups, policies };
        debug!(total = entities.total(), "listed IAM entities");
        Ok(entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_codes_are_retryable() {
        assert!(is_retryable_code(Some("Throttling")));
        assert!(is_retryable_code(Some("ServiceFailure")));
        assert!(!is_retryable_code(Some("AccessDenied")));
        assert!(!is_retryable_code(Some("NoSuchEntity")));
        assert!(!is_retryable_code(None));
    }

    #[test]
    fn marker_only_follows_truncated_pages() {
        assert_eq!(next_marker(true, Some("m1")), Some("m1".to_string()));
        assert_eq!(next_marker(false, Some("m1")), None);
        assert_eq!(next_marker(true, None), None);
    }

    #[tokio::test]
    async fn paginate_collects_every_page() {
        let pages = paginate(|marker| async move {
            let n: u32 = marker.as_deref().map(|m| m.parse().unwrap()).unwrap_or(0);
            let item = IamEntity::new(format!("u{n}"), format!("arn:aws:iam::111111111111:user/u{n}"));
            let next = (n < 2).then(|| (n + 1).to_string());
            Ok((vec![item], next))
        })
        .await
        .unwrap();
        let names: Vec<_> = pages.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["u0", "u1", "u2"]);
    }

    #[tokio::test]
    async fn paginate_stops_on_error() {
        let err = paginate(|_| async { Err(EnumerationError::denied("AccessDenied")) }).await.unwrap_err();
        assert!(!err.retryable);
    }
}
