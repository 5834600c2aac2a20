use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::api::{ApiError, WebUiClient};
use crate::checkpoints::{
    CheckpointCatalog, CheckpointKind, CheckpointLocation, CheckpointRecord,
};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("backend is not active")]
    ServiceNotActive,
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Keeps the [`CheckpointCatalog`] consistent with both the filesystem and
/// the backend.
///
/// The local scan is authoritative for which checkpoints exist; the backend
/// contributes titles and hashes. Either side can be refreshed on its own.
pub struct CatalogReconciler {
    catalog: Arc<Mutex<CheckpointCatalog>>,
    locations: Vec<CheckpointLocation>,
}

impl CatalogReconciler {
    pub fn new(catalog: Arc<Mutex<CheckpointCatalog>>, locations: Vec<CheckpointLocation>) -> Self {
        Self { catalog, locations }
    }

    pub fn catalog(&self) -> &Arc<Mutex<CheckpointCatalog>> {
        &self.catalog
    }

    /// Diff each configured location against the catalog: new entries are
    /// inserted, vanished ones removed. Idempotent; a location whose
    /// directory cannot be read is skipped without touching its records.
    pub fn rescan_local(&self) {
        let mut catalog = self.catalog.lock().unwrap();
        for location in &self.locations {
            let present = match scan_location(location) {
                Ok(present) => present,
                Err(e) => {
                    warn!(
                        "skipping checkpoint location {}: {}",
                        location.dir.display(),
                        e
                    );
                    continue;
                }
            };

            for path in catalog.paths_under(&location.dir) {
                if !present.contains(&path) {
                    catalog.remove_path(&path);
                }
            }
            for path in present {
                catalog.insert_local(path, location.kind);
            }
        }
        debug!("local rescan complete, {} checkpoints known", catalog.len());
    }

    /// Tell the backend to rescan its directories, then pull its model list
    /// and attach the metadata to local records. The recently-removed set
    /// is left alone; it belongs to the UI layer.
    pub async fn refresh_from_remote(&self, client: &WebUiClient) -> Result<(), ReconcileError> {
        client.refresh_checkpoints().await?;
        let remote = client.sd_models().await?;
        self.catalog.lock().unwrap().attach_remote(remote);
        Ok(())
    }

    /// The record matching the backend's currently active checkpoint title,
    /// or none when the title matches nothing local. Queried live every
    /// time; the backend can switch models for reasons of its own.
    pub async fn current_remote_checkpoint(
        &self,
        client: &WebUiClient,
    ) -> Result<Option<CheckpointRecord>, ReconcileError> {
        let options = client.options().await?;
        let Some(title) = options.sd_model_checkpoint else {
            return Ok(None);
        };
        Ok(self.catalog.lock().unwrap().find_by_title(&title).cloned())
    }
}

fn scan_location(location: &CheckpointLocation) -> std::io::Result<HashSet<PathBuf>> {
    let mut present = HashSet::new();
    for entry in std::fs::read_dir(&location.dir)? {
        let entry = entry?;
        let path = entry.path();
        let keep = match location.kind {
            CheckpointKind::Diffusers => entry.file_type()?.is_dir(),
            CheckpointKind::Safetensors => {
                entry.file_type()?.is_file()
                    && path
                        .extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"))
            }
        };
        if keep {
            present.insert(path);
        }
    }
    Ok(present)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn reconciler(locations: Vec<CheckpointLocation>) -> CatalogReconciler {
        CatalogReconciler::new(Arc::new(Mutex::new(CheckpointCatalog::new())), locations)
    }

    async fn mock_backend(models: serde_json::Value, current: Option<&str>) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sdapi/v1/refresh-checkpoints"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sdapi/v1/sd-models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(models))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sdapi/v1/options"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sd_model_checkpoint": current
            })))
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn rescan_picks_up_safetensors_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.safetensors"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let r = reconciler(vec![CheckpointLocation {
            dir: dir.path().to_path_buf(),
            kind: CheckpointKind::Safetensors,
        }]);
        r.rescan_local();

        let catalog = r.catalog().lock().unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get(&dir.path().join("a.safetensors")).is_some());
    }

    #[test]
    fn rescan_picks_up_diffusers_directories_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("model-a")).unwrap();
        std::fs::write(dir.path().join("stray.safetensors"), b"x").unwrap();

        let r = reconciler(vec![CheckpointLocation {
            dir: dir.path().to_path_buf(),
            kind: CheckpointKind::Diffusers,
        }]);
        r.rescan_local();

        let catalog = r.catalog().lock().unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get(&dir.path().join("model-a")).is_some());
    }

    #[test]
    fn rescan_is_idempotent_and_tracks_removal() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.safetensors");
        std::fs::write(&file, b"x").unwrap();

        let r = reconciler(vec![CheckpointLocation {
            dir: dir.path().to_path_buf(),
            kind: CheckpointKind::Safetensors,
        }]);
        r.rescan_local();
        r.rescan_local();
        assert_eq!(r.catalog().lock().unwrap().len(), 1);

        std::fs::remove_file(&file).unwrap();
        r.rescan_local();
        let mut catalog = r.catalog().lock().unwrap();
        assert!(catalog.is_empty());
        assert_eq!(catalog.take_recently_removed(), vec![file]);
    }

    #[tokio::test]
    async fn removal_survives_a_remote_refresh_until_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.safetensors");
        std::fs::write(&file, b"x").unwrap();

        let r = reconciler(vec![CheckpointLocation {
            dir: dir.path().to_path_buf(),
            kind: CheckpointKind::Safetensors,
        }]);
        r.rescan_local();
        std::fs::remove_file(&file).unwrap();
        r.rescan_local();

        let server = mock_backend(serde_json::json!([]), None).await;
        let client = WebUiClient::new(server.uri()).unwrap();
        r.refresh_from_remote(&client).await.unwrap();

        let mut catalog = r.catalog().lock().unwrap();
        assert_eq!(catalog.take_recently_removed(), vec![file]);
        assert!(catalog.take_recently_removed().is_empty());
    }

    #[tokio::test]
    async fn current_checkpoint_resolves_through_the_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.safetensors");
        std::fs::write(&file, b"x").unwrap();

        let r = reconciler(vec![CheckpointLocation {
            dir: dir.path().to_path_buf(),
            kind: CheckpointKind::Safetensors,
        }]);
        r.rescan_local();

        let server = mock_backend(
            serde_json::json!([{
                "title": "a.safetensors [ab12]",
                "model_name": "a",
                "hash": "ab12",
                "sha256": null,
                "filename": "/backend/models/a.safetensors",
                "config": null
            }]),
            Some("a.safetensors [ab12]"),
        )
        .await;
        let client = WebUiClient::new(server.uri()).unwrap();
        r.refresh_from_remote(&client).await.unwrap();

        let current = r.current_remote_checkpoint(&client).await.unwrap();
        assert_eq!(current.unwrap().local_path, file);
    }

    #[tokio::test]
    async fn unknown_remote_title_resolves_to_none() {
        let r = reconciler(Vec::new());
        let server = mock_backend(serde_json::json!([]), Some("ghost [0000]")).await;
        let client = WebUiClient::new(server.uri()).unwrap();
        assert!(r
            .current_remote_checkpoint(&client)
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn missing_location_is_skipped_without_dropping_records() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.safetensors");
        std::fs::write(&file, b"x").unwrap();

        let location = CheckpointLocation {
            dir: dir.path().to_path_buf(),
            kind: CheckpointKind::Safetensors,
        };
        let r = reconciler(vec![location]);
        r.rescan_local();
        assert_eq!(r.catalog().lock().unwrap().len(), 1);

        // Directory vanishes wholesale (unmounted drive, renamed folder):
        // the catalog keeps what it knew.
        let path = dir.keep();
        std::fs::remove_dir_all(&path).unwrap();
        r.rescan_local();
        assert_eq!(r.catalog().lock().unwrap().len(), 1);
    }
}
