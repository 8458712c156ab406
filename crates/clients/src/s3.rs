use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use iam_collector_core::{ResultStore, StorageDestination, StorageError};
use tracing::debug;

pub struct S3ResultStore {
    client: Client,
}

impl S3ResultStore {
    pub fn new(sdk: &SdkConfig) -> Self {
        Self { client: Client::new(sdk) }
    }
}

#[async_trait]
impl ResultStore for S3ResultStore {
    async fn put_object(&self, destination: &StorageDestination, key: &str, body: Vec<u8>) -> Result<(), StorageError> {
        let len = body.len();
        self.client
            .put_object()
            .bucket(&destination.bucket)
            .key(key)
            .content_type("application/json")
            // Conditional create: an existing key is never replaced.
            .if_none_match("*")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                let message = if e.code() == Some("PreconditionFailed") {
                    "object already exists".to_string()
                } else {
                    DisplayErrorContext(&e).to_string()
                };
                StorageError { key: format!("s3://{}/{key}", destination.bucket), message }
            })?;
        debug!(bucket = %destination.bucket, key, bytes = len, "object written");
        Ok(())
    }
}
