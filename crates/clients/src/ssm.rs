use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_ssm::error::DisplayErrorContext;
use aws_sdk_ssm::Client;
use iam_collector_core::{ConfigSource, ConfigurationError};

/// Reads the configuration blob from a String parameter.
pub struct SsmConfigSource {
    client: Client,
    parameter_name: String,
}

impl SsmConfigSource {
    pub fn new(sdk: &SdkConfig, parameter_name: impl Into<String>) -> Self {
        Self { client: Client::new(sdk), parameter_name: parameter_name.into() }
    }
}

#[async_trait]
impl ConfigSource for SsmConfigSource {
    fn name(&self) -> &str {
        &self.parameter_name
    }

    async fn fetch(&self) -> Result<String, ConfigurationError> {
        let source_error = |message: String| ConfigurationError::Source { name: self.parameter_name.clone(), message };
        let out = self
            .client
            .get_parameter()
            .name(&self.parameter_name)
            .send()
            .await
            .map_err(|e| source_error(DisplayErrorContext(&e).to_string()))?;
        out.parameter()
            .and_then(|p| p.value())
            .map(str::to_string)
            .ok_or_else(|| source_error("parameter has no value".to_string()))
    }
}
