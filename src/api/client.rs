use std::time::Duration;

use log::debug;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ValidationBody};
use crate::checkpoints::RemoteMetadata;

/// Long enough to survive a checkpoint switch, which blocks the backend's
/// HTTP handler for the whole load.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1000);

/// Subset of the backend's options object the orchestrator cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct WebUiOptions {
    pub sd_model_checkpoint: Option<String>,
}

#[derive(Debug, Serialize)]
struct SetOptionsRequest<'a> {
    sd_model_checkpoint: &'a str,
}

/// HTTP client for the backend's `/sdapi/v1` surface. Constructed once per
/// session, when the endpoint announcement arrives.
#[derive(Debug)]
pub struct WebUiClient {
    base_url: String,
    http: reqwest::Client,
}

impl WebUiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/sdapi/v1/{}", self.base_url, path)
    }

    /// Checkpoints the backend currently knows about.
    pub async fn sd_models(&self) -> Result<Vec<RemoteMetadata>, ApiError> {
        let response = self.http.get(self.url("sd-models")).send().await?;
        let models: Vec<RemoteMetadata> = Self::check(response).await?.json().await?;
        debug!("backend reports {} checkpoints", models.len());
        Ok(models)
    }

    /// Ask the backend to rescan its checkpoint directories.
    pub async fn refresh_checkpoints(&self) -> Result<(), ApiError> {
        let response = self
            .http
            .post(self.url("refresh-checkpoints"))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// The backend's current options, including the active checkpoint title.
    pub async fn options(&self) -> Result<WebUiOptions, ApiError> {
        let response = self.http.get(self.url("options")).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Set the active checkpoint by its backend-assigned title. The call
    /// blocks until the backend has finished loading the weights.
    pub async fn set_checkpoint(&self, title: &str) -> Result<(), ApiError> {
        debug!("requesting checkpoint switch to {title:?}");
        let response = self
            .http
            .post(self.url("options"))
            .json(&SetOptionsRequest {
                sd_model_checkpoint: title,
            })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn check(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            let body: ValidationBody = response.json().await?;
            return Err(ApiError::Validation(body.message()));
        }
        Err(ApiError::UnexpectedStatus(status))
    }
}
