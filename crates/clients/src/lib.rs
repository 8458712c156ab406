//! AWS-backed implementations of the collector seams.

use std::sync::Arc;

use aws_config::{BehaviorVersion, SdkConfig};
use iam_collector_core::{Collector, CollectorSettings, ResultStore};

mod iam;
mod local;
mod s3;
mod ssm;
mod sts;

pub use iam::{is_retryable_code, IamApiEnumerator};
pub use local::LocalDirStore;
pub use s3::S3ResultStore;
pub use ssm::SsmConfigSource;
pub use sts::StsRoleAssumer;

/// Shared SDK configuration from the default credential and region chain.
pub async fn load_sdk_config() -> SdkConfig {
    aws_config::load_defaults(BehaviorVersion::latest()).await
}

/// A collector that reads its configuration from SSM and writes results to S3.
pub fn collector(sdk: &SdkConfig, parameter_name: impl Into<String>, settings: CollectorSettings) -> Collector {
    collector_with_store(sdk, parameter_name, settings, Arc::new(S3ResultStore::new(sdk)))
}

pub fn collector_with_store(
    sdk: &SdkConfig,
    parameter_name: impl Into<String>,
    settings: CollectorSettings,
    store: Arc<dyn ResultStore>,
) -> Collector {
    Collector::new(
        Arc::new(SsmConfigSource::new(sdk, parameter_name)),
        Arc::new(StsRoleAssumer::new(sdk)),
        Arc::new(IamApiEnumerator::new(sdk)),
        store,
        settings,
    )
}
