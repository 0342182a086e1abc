//! Azure OpenAI DALL-E 3 client implementation

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::client::traits::{ClientConfig, ImageGenerator};
use crate::client::types::{GeneratedImage, GenerationRequest, GenerationResult};
use crate::error::{AppError, RemoteErrorKind, Result};
use crate::response::base64;

/// Image generation client bound to one Azure OpenAI deployment
pub struct AzureImageClient {
    name: String,
    client: Client,
    config: ClientConfig,
    generations_url: Url,
}

/// Body of an images/generations call
#[derive(Debug, Serialize)]
struct ApiGenerateRequest {
    prompt: String,
    n: u32,
    size: &'static str,
    quality: &'static str,
    style: &'static str,
}

#[derive(Debug, Deserialize)]
struct ApiGenerateResponse {
    #[serde(default)]
    data: Vec<ApiImageData>,
}

#[derive(Debug, Deserialize)]
struct ApiImageData {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    b64_json: Option<String>,
    #[serde(default)]
    revised_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    inner_error: Option<ApiInnerError>,
}

#[derive(Debug, Deserialize)]
struct ApiInnerError {
    #[serde(default)]
    code: Option<String>,
}

impl AzureImageClient {
    /// Create a client from validated connection settings
    pub fn new(config: ClientConfig, timeout: Duration) -> Result<Self> {
        let endpoint = config.validate()?;
        let generations_url = generations_url(&endpoint, &config)?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            name: format!("azure:{}", config.deployment),
            client,
            config,
            generations_url,
        })
    }

    /// Full URL of the generations call, including the api-version query
    pub fn generations_url(&self) -> &Url {
        &self.generations_url
    }

    /// Download one generated image from the provider's blob storage
    async fn fetch_image(&self, url: &str) -> Result<(Vec<u8>, Option<String>)> {
        debug!(deployment = %self.config.deployment, "Getting generated image");

        let response = self.client.get(url).send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::RemoteService {
                kind: RemoteErrorKind::Transient,
                status: Some(status.as_u16()),
                message: "Failed to get image".to_string(),
                retry_after_secs: None,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let bytes = response.bytes().await.map_err(transport_error)?;

        Ok((bytes.to_vec(), content_type))
    }

    async fn resolve_image(&self, item: ApiImageData) -> Result<GeneratedImage> {
        let (data, content_type) = match (item.b64_json, item.url) {
            (Some(b64), _) => (base64::decode(&b64)?, Some("image/png".to_string())),
            (None, Some(url)) => self.fetch_image(&url).await?,
            (None, None) => {
                return Err(AppError::remote(
                    RemoteErrorKind::InvalidResponse,
                    "Image entry carries neither url nor b64_json",
                ))
            }
        };

        Ok(GeneratedImage {
            data,
            content_type,
            revised_prompt: item.revised_prompt,
        })
    }
}

#[async_trait]
impl ImageGenerator for AzureImageClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerationRequest) -> GenerationResult {
        let body = ApiGenerateRequest {
            prompt: request.effective_prompt(),
            n: request.num,
            size: request.size.as_str(),
            quality: request.quality.as_str(),
            style: request.style.as_str(),
        };

        info!(
            deployment = %self.config.deployment,
            size = body.size,
            quality = body.quality,
            style = body.style,
            "Sending dalle request"
        );

        let response = self
            .client
            .post(self.generations_url.clone())
            .header("api-key", &self.config.key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_header = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let text = response.text().await.unwrap_or_default();
            let err = remote_error(status, &text, retry_header);
            warn!(deployment = %self.config.deployment, error = %err, "Failed request");
            return Err(err);
        }

        let api_response: ApiGenerateResponse = response.json().await.map_err(|e| {
            AppError::remote(
                RemoteErrorKind::InvalidResponse,
                format!("Failed to parse response: {}", e),
            )
        })?;

        if api_response.data.is_empty() {
            return Err(AppError::remote(
                RemoteErrorKind::InvalidResponse,
                "Response contained no images",
            ));
        }

        let mut images = Vec::with_capacity(api_response.data.len());
        for item in api_response.data {
            images.push(self.resolve_image(item).await?);
        }

        debug!(count = images.len(), "Generation finished");
        Ok(images)
    }
}

fn generations_url(endpoint: &Url, config: &ClientConfig) -> Result<Url> {
    let mut url = endpoint.clone();
    url.path_segments_mut()
        .map_err(|_| {
            AppError::Configuration(format!("Endpoint '{}' cannot be a base URL", endpoint))
        })?
        .pop_if_empty()
        .extend([
            "openai",
            "deployments",
            config.deployment.trim(),
            "images",
            "generations",
        ]);
    url.set_query(None);
    url.query_pairs_mut()
        .append_pair("api-version", config.api_version.as_str());
    Ok(url)
}

fn transport_error(e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(format!("Request to the provider timed out: {}", e))
    } else if e.is_connect() || e.is_request() || e.is_body() {
        AppError::remote(
            RemoteErrorKind::Transient,
            format!("Connection error when calling the provider: {}", e),
        )
    } else {
        AppError::HttpClient(e)
    }
}

/// Seconds to wait, as announced in a 429 message
fn parse_retry_after(message: &str) -> Option<u64> {
    static RETRY_RE: OnceLock<Regex> = OnceLock::new();
    let re = RETRY_RE.get_or_init(|| {
        Regex::new(r"retry after (\d+) second").expect("retry-after pattern is valid")
    });
    re.captures(message)?.get(1)?.as_str().parse().ok()
}

/// Translate a non-success provider response into an error
fn remote_error(status: StatusCode, body: &str, retry_header: Option<u64>) -> AppError {
    let parsed = serde_json::from_str::<ApiErrorEnvelope>(body).ok().map(|e| e.error);

    let message = parsed
        .as_ref()
        .and_then(|e| e.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| {
            let reason = status.canonical_reason().unwrap_or("Unknown");
            if body.is_empty() {
                reason.to_string()
            } else {
                format!("{}: {}", reason, body)
            }
        });

    let codes: Vec<&str> = parsed
        .as_ref()
        .map(|e| {
            e.code
                .iter()
                .chain(e.inner_error.as_ref().and_then(|i| i.code.as_ref()))
                .map(String::as_str)
                .collect()
        })
        .unwrap_or_default();
    let content_policy = codes.iter().any(|c| {
        matches!(
            *c,
            "content_policy_violation" | "contentFilter" | "ResponsibleAIPolicyViolation"
        )
    });

    let kind = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteErrorKind::Authentication,
        StatusCode::TOO_MANY_REQUESTS => RemoteErrorKind::QuotaExceeded,
        _ if content_policy => RemoteErrorKind::ContentPolicy,
        s if s.is_client_error() => RemoteErrorKind::InvalidParameter,
        _ => RemoteErrorKind::Transient,
    };

    let retry_after_secs = if kind == RemoteErrorKind::QuotaExceeded {
        parse_retry_after(&message).or(retry_header)
    } else {
        None
    };

    AppError::RemoteService {
        kind,
        status: Some(status.as_u16()),
        message,
        retry_after_secs,
    }
}
