use reqwest::StatusCode;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request to backend failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("backend returned unexpected status {0}")]
    UnexpectedStatus(StatusCode),

    #[error("backend rejected the request: {0}")]
    Validation(String),
}

/// Body of a 422 response from the backend's FastAPI layer.
#[derive(Debug, Deserialize)]
pub struct ValidationBody {
    #[serde(default)]
    pub detail: Vec<ValidationDetail>,
}

#[derive(Debug, Deserialize)]
pub struct ValidationDetail {
    #[serde(default)]
    pub loc: Vec<serde_json::Value>,
    pub msg: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ValidationBody {
    /// Flatten the detail entries into one displayable message.
    pub fn message(&self) -> String {
        if self.detail.is_empty() {
            return "unprocessable request".to_string();
        }
        self.detail
            .iter()
            .map(|d| d.msg.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}
