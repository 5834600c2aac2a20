use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use log::debug;

use crate::checkpoints::{CheckpointKind, CheckpointRecord, RemoteMetadata};

/// In-memory catalog keyed by local path.
///
/// Local scans own the key set; remote metadata is attached to existing
/// records and never creates entries on its own. Removed paths are
/// remembered so the UI layer can surface the removal; the set is consumed
/// once and then cleared.
#[derive(Debug, Default)]
pub struct CheckpointCatalog {
    records: HashMap<PathBuf, CheckpointRecord>,
    recently_removed: HashSet<PathBuf>,
}

impl CheckpointCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<&CheckpointRecord> {
        self.records.get(path)
    }

    pub fn records(&self) -> impl Iterator<Item = &CheckpointRecord> {
        self.records.values()
    }

    /// Paths of records that live under the given directory.
    pub fn paths_under(&self, dir: &Path) -> Vec<PathBuf> {
        self.records
            .keys()
            .filter(|path| path.starts_with(dir))
            .cloned()
            .collect()
    }

    /// Register a checkpoint discovered on disk. Re-inserting an existing
    /// path keeps its attached remote metadata.
    pub fn insert_local(&mut self, path: PathBuf, kind: CheckpointKind) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.recently_removed.remove(&path);
        self.records
            .entry(path.clone())
            .or_insert_with(|| CheckpointRecord {
                name,
                local_path: path,
                kind,
                remote: None,
            });
    }

    /// Drop a checkpoint that disappeared from disk, remembering it for the
    /// next remote refresh.
    pub fn remove_path(&mut self, path: &Path) -> Option<CheckpointRecord> {
        let removed = self.records.remove(path);
        if removed.is_some() {
            debug!("checkpoint removed from catalog: {}", path.display());
            self.recently_removed.insert(path.to_path_buf());
        }
        removed
    }

    /// Paths removed since the last call, clearing the set.
    pub fn take_recently_removed(&mut self) -> Vec<PathBuf> {
        self.recently_removed.drain().collect()
    }

    /// Attach backend metadata to local records by matching the basename of
    /// the backend-reported filename. Matching is case-sensitive; the local
    /// scan and the backend see the same filesystem.
    pub fn attach_remote(&mut self, remote: Vec<RemoteMetadata>) {
        // Remote entries nothing local matches are ignored: the backend may
        // be configured with extra model directories this catalog does not
        // track.
        let by_basename: HashMap<String, RemoteMetadata> = remote
            .into_iter()
            .filter_map(|meta| {
                let name = Path::new(&meta.filename)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned());
                name.map(|name| (name, meta))
            })
            .collect();

        // The same basename may exist under more than one configured
        // location; every such record gets the metadata.
        for record in self.records.values_mut() {
            record.remote = by_basename.get(&record.name).cloned();
        }
    }

    /// Find the record the backend knows under the given title.
    pub fn find_by_title(&self, title: &str) -> Option<&CheckpointRecord> {
        self.records
            .values()
            .find(|record| record.title() == Some(title))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(title: &str, filename: &str) -> RemoteMetadata {
        RemoteMetadata {
            title: title.into(),
            model_name: title.trim_end_matches(".safetensors").into(),
            hash: None,
            sha256: None,
            filename: filename.into(),
            config: None,
        }
    }

    #[test]
    fn reinsert_keeps_attached_metadata() {
        let mut catalog = CheckpointCatalog::new();
        let path = PathBuf::from("/models/a.safetensors");
        catalog.insert_local(path.clone(), CheckpointKind::Safetensors);
        catalog.attach_remote(vec![remote("a.safetensors [ab12]", "/backend/a.safetensors")]);
        assert!(!catalog.get(&path).unwrap().is_unassigned());

        catalog.insert_local(path.clone(), CheckpointKind::Safetensors);
        assert!(!catalog.get(&path).unwrap().is_unassigned());
    }

    #[test]
    fn attach_matches_by_basename_only() {
        let mut catalog = CheckpointCatalog::new();
        catalog.insert_local(
            PathBuf::from("/local/models/a.safetensors"),
            CheckpointKind::Safetensors,
        );
        catalog.attach_remote(vec![remote(
            "a.safetensors [ab12]",
            "/entirely/different/prefix/a.safetensors",
        )]);
        let record = catalog
            .get(Path::new("/local/models/a.safetensors"))
            .unwrap();
        assert_eq!(record.title(), Some("a.safetensors [ab12]"));
    }

    #[test]
    fn attach_is_case_sensitive() {
        let mut catalog = CheckpointCatalog::new();
        catalog.insert_local(
            PathBuf::from("/models/Model.safetensors"),
            CheckpointKind::Safetensors,
        );
        catalog.attach_remote(vec![remote("m", "/models/model.safetensors")]);
        assert!(catalog
            .get(Path::new("/models/Model.safetensors"))
            .unwrap()
            .is_unassigned());
    }

    #[test]
    fn attach_clears_metadata_the_backend_no_longer_reports() {
        let mut catalog = CheckpointCatalog::new();
        let path = PathBuf::from("/models/a.safetensors");
        catalog.insert_local(path.clone(), CheckpointKind::Safetensors);
        catalog.attach_remote(vec![remote("a [x]", "/models/a.safetensors")]);
        catalog.attach_remote(Vec::new());
        assert!(catalog.get(&path).unwrap().is_unassigned());
    }

    #[test]
    fn same_basename_in_two_locations_gets_metadata_in_both() {
        let mut catalog = CheckpointCatalog::new();
        catalog.insert_local(
            PathBuf::from("/models/main/a.safetensors"),
            CheckpointKind::Safetensors,
        );
        catalog.insert_local(
            PathBuf::from("/models/extra/a.safetensors"),
            CheckpointKind::Safetensors,
        );
        catalog.attach_remote(vec![remote("a.safetensors [ab12]", "/models/a.safetensors")]);

        for record in catalog.records() {
            assert_eq!(record.title(), Some("a.safetensors [ab12]"));
        }
    }

    #[test]
    fn title_lookup_finds_the_assigned_record() {
        let mut catalog = CheckpointCatalog::new();
        catalog.insert_local(
            PathBuf::from("/models/a.safetensors"),
            CheckpointKind::Safetensors,
        );
        catalog.attach_remote(vec![remote("a.safetensors [ab12]", "/models/a.safetensors")]);

        let found = catalog.find_by_title("a.safetensors [ab12]").unwrap();
        assert_eq!(found.local_path, PathBuf::from("/models/a.safetensors"));
        assert!(catalog.find_by_title("other [ff00]").is_none());
    }

    #[test]
    fn removed_paths_are_remembered_once() {
        let mut catalog = CheckpointCatalog::new();
        let path = PathBuf::from("/models/a.safetensors");
        catalog.insert_local(path.clone(), CheckpointKind::Safetensors);
        catalog.remove_path(&path);
        assert!(catalog.is_empty());
        assert_eq!(catalog.take_recently_removed(), vec![path]);
        assert!(catalog.take_recently_removed().is_empty());
    }

    #[test]
    fn reappearing_path_is_not_reported_removed() {
        let mut catalog = CheckpointCatalog::new();
        let path = PathBuf::from("/models/a.safetensors");
        catalog.insert_local(path.clone(), CheckpointKind::Safetensors);
        catalog.remove_path(&path);
        catalog.insert_local(path, CheckpointKind::Safetensors);
        assert!(catalog.take_recently_removed().is_empty());
    }
}
