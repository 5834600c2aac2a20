use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::checkpoints::{CheckpointKind, CheckpointLocation};
use crate::parser::EndpointPhrasing;

/// Command-line flags understood by the backend launch script.
///
/// The argument vector is always built from this enumeration so that the
/// set of flags the controller passes is inspectable and testable, never
/// assembled ad hoc at the spawn site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum LaunchFlag {
    /// `--no-half`: full-precision weights. Always on; half precision is
    /// the source of the known `LayerNormKernelImpl` hardware failure.
    DisableHalfPrecision,
    /// `--api`: expose the JSON API. Always on, the orchestrator is
    /// useless without it.
    EnableApi,
    /// `--api-log`: log API requests to the output stream. Always on.
    EnableApiLogging,
    /// `--nowebui`: skip the browser UI and serve the API only.
    NoWebUi,
    /// `--disable-model-loading-ram-optimization`: opt out of the
    /// backend's RAM-optimized loader.
    DisableRamOptimization,
}

impl LaunchFlag {
    pub fn as_arg(self) -> &'static str {
        match self {
            LaunchFlag::DisableHalfPrecision => "--no-half",
            LaunchFlag::EnableApi => "--api",
            LaunchFlag::EnableApiLogging => "--api-log",
            LaunchFlag::NoWebUi => "--nowebui",
            LaunchFlag::DisableRamOptimization => {
                "--disable-model-loading-ram-optimization"
            }
        }
    }
}

/// Launch configuration for the backend process and checkpoint storage.
///
/// Constructed by the application's composition root and passed into the
/// [`Orchestrator`](crate::Orchestrator); nothing in this crate reads a
/// global config store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchConfig {
    /// Launch the browser web UI alongside the API. When unset the
    /// backend runs API-only (`--nowebui`) and announces its endpoint
    /// with the uvicorn phrasing instead of the web-UI one.
    #[serde(default)]
    pub launch_web_ui: bool,
    /// Pass `--disable-model-loading-ram-optimization` to the backend.
    #[serde(default)]
    pub disable_ram_optimization: bool,
    /// Directory holding diffusers-layout checkpoints (one directory per
    /// checkpoint).
    #[serde(default)]
    pub diffusers_dir: Option<PathBuf>,
    /// Directory holding single-file `.safetensors` checkpoints.
    #[serde(default)]
    pub safetensors_dir: Option<PathBuf>,
}

impl LaunchConfig {
    /// The flags enabled by the current configuration, in the order they
    /// are passed to the script.
    pub fn enabled_flags(&self) -> Vec<LaunchFlag> {
        let mut flags = vec![
            LaunchFlag::DisableHalfPrecision,
            LaunchFlag::EnableApi,
            LaunchFlag::EnableApiLogging,
        ];
        if !self.launch_web_ui {
            flags.push(LaunchFlag::NoWebUi);
        }
        if self.disable_ram_optimization {
            flags.push(LaunchFlag::DisableRamOptimization);
        }
        flags
    }

    /// Argument vector for the backend launch script.
    pub fn launch_args(&self) -> Vec<String> {
        self.enabled_flags()
            .into_iter()
            .map(|f| f.as_arg().to_string())
            .collect()
    }

    /// Which endpoint-announcement phrasing to try first when scanning
    /// the output stream.
    pub fn endpoint_phrasing(&self) -> EndpointPhrasing {
        if self.launch_web_ui {
            EndpointPhrasing::WebUi
        } else {
            EndpointPhrasing::ApiOnly
        }
    }

    /// The configured checkpoint storage locations, one per kind.
    pub fn checkpoint_locations(&self) -> Vec<CheckpointLocation> {
        let mut locations = Vec::new();
        if let Some(dir) = &self.diffusers_dir {
            locations.push(CheckpointLocation {
                dir: dir.clone(),
                kind: CheckpointKind::Diffusers,
            });
        }
        if let Some(dir) = &self.safetensors_dir {
            locations.push(CheckpointLocation {
                dir: dir.clone(),
                kind: CheckpointKind::Safetensors,
            });
        }
        locations
    }
}
