//! Connection settings and the generator trait the dispatcher drives

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::client::types::{ApiVersion, GenerationRequest, GenerationResult};
use crate::error::{AppError, Result};

/// Connection settings for one Azure OpenAI deployment
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub key: String,
    pub endpoint: String,
    pub deployment: String,
    #[serde(default)]
    pub api_version: ApiVersion,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("key", &"***")
            .field("endpoint", &self.endpoint)
            .field("deployment", &self.deployment)
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl ClientConfig {
    /// Check the connection fields and return the parsed endpoint
    pub fn validate(&self) -> Result<Url> {
        if self.key.trim().is_empty() {
            return Err(AppError::Configuration("API key is required".to_string()));
        }
        if self.deployment.trim().is_empty() {
            return Err(AppError::Configuration(
                "Deployment name is required".to_string(),
            ));
        }

        let endpoint = Url::parse(self.endpoint.trim()).map_err(|e| {
            AppError::Configuration(format!("Invalid endpoint '{}': {}", self.endpoint, e))
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(AppError::Configuration(format!(
                "Endpoint must be an http(s) URL, got '{}'",
                self.endpoint
            )));
        }

        Ok(endpoint)
    }
}

/// Something that turns a [`GenerationRequest`] into images
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Checks that can fail before anything is sent.
    ///
    /// A failure here completes the job without consuming rate budget.
    fn check(&self, request: &GenerationRequest) -> Result<()> {
        request.validate()
    }

    /// Perform one provider call
    async fn generate(&self, request: &GenerationRequest) -> GenerationResult;
}
