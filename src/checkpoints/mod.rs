//! Checkpoint catalog: local filesystem scanning, remote metadata from the
//! backend, and the reconciler that merges the two views.

mod catalog;
mod reconciler;
mod watcher;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use catalog::CheckpointCatalog;
pub use reconciler::{CatalogReconciler, ReconcileError};
pub use watcher::DirectoryWatcher;

/// On-disk representation of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "camelCase")]
pub enum CheckpointKind {
    /// A directory in the diffusers layout.
    Diffusers,
    /// A single `.safetensors` weights file.
    Safetensors,
}

/// Checkpoint metadata as reported by the backend's models endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMetadata {
    /// Display title, the key the backend expects when switching.
    pub title: String,
    pub model_name: String,
    pub hash: Option<String>,
    pub sha256: Option<String>,
    /// Absolute path from the backend's point of view.
    pub filename: String,
    pub config: Option<String>,
}

/// One checkpoint known locally, possibly enriched with backend metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    /// File or directory basename, the local identity of the checkpoint.
    pub name: String,
    pub local_path: PathBuf,
    pub kind: CheckpointKind,
    /// Backend metadata, absent until the backend has scanned this file.
    pub remote: Option<RemoteMetadata>,
}

impl CheckpointRecord {
    /// A record the backend has not (yet) assigned a title to cannot be
    /// switched to.
    pub fn is_unassigned(&self) -> bool {
        self.remote.is_none()
    }

    /// The backend-assigned title, if any.
    pub fn title(&self) -> Option<&str> {
        self.remote.as_ref().map(|r| r.title.as_str())
    }
}

/// A directory scanned for checkpoints of one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointLocation {
    pub dir: PathBuf,
    pub kind: CheckpointKind,
}
