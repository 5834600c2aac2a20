//! HTTP client for the backend's `/sdapi/v1` surface.

mod client;
mod error;

use std::sync::{Arc, RwLock};

pub use client::{WebUiClient, WebUiOptions};
pub use error::{ApiError, ValidationBody, ValidationDetail};

/// Slot for the session's API client. Installed when the backend becomes
/// active, cleared when a new session starts.
pub type SharedClient = Arc<RwLock<Option<Arc<WebUiClient>>>>;
