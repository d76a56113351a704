//! Per-slot artifact directories.
//!
//! Layout under the artifacts root:
//!
//! ```text
//! <root>/instance_<id>/<subdir>/<file_name>
//! ```
//!
//! Directory names derive from the slot id only, so reclaim and sweep find
//! the same paths across restarts.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::config::PoolConfig;
use crate::slot::SlotId;

const SLOT_DIR_PREFIX: &str = "instance_";

#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
    subdir: String,
    file_name: String,
    excluded: HashSet<String>,
}

impl ArtifactLayout {
    pub fn new(
        root: impl Into<PathBuf>,
        subdir: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            subdir: subdir.into(),
            file_name: file_name.into(),
            excluded: HashSet::new(),
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(
            &config.artifacts_root,
            &config.artifact_subdir,
            &config.artifact_file_name,
        )
        .with_excluded(config.excluded_entries.iter().cloned())
    }

    pub fn with_excluded(mut self, entries: impl IntoIterator<Item = String>) -> Self {
        self.excluded.extend(entries);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slot_dir(&self, id: SlotId) -> PathBuf {
        self.root.join(format!("{SLOT_DIR_PREFIX}{id}"))
    }

    /// Directory handed to the worker.
    pub fn data_dir(&self, id: SlotId) -> PathBuf {
        self.slot_dir(id).join(&self.subdir)
    }

    /// Replace whatever the slot directory held with a fresh artifact.
    pub fn write(&self, id: SlotId, bytes: &[u8]) -> io::Result<PathBuf> {
        self.remove(id)?;
        let data_dir = self.data_dir(id);
        std::fs::create_dir_all(&data_dir)?;
        std::fs::write(data_dir.join(&self.file_name), bytes)?;
        Ok(data_dir)
    }

    /// Remove the slot directory. `Ok(false)` if it was already absent.
    pub fn remove(&self, id: SlotId) -> io::Result<bool> {
        match std::fs::remove_dir_all(self.slot_dir(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn exists(&self, id: SlotId) -> bool {
        self.slot_dir(id).exists()
    }

    /// Age of the slot directory from its modification time, `None` if absent.
    pub fn age(&self, id: SlotId) -> Option<Duration> {
        entry_age(&self.slot_dir(id))
    }

    /// Delete root entries that are neither slot directories of `known` slots
    /// nor excluded, once older than `max_age`. Returns removed paths.
    pub fn remove_strays(
        &self,
        max_age: Duration,
        known: impl IntoIterator<Item = SlotId>,
    ) -> io::Result<Vec<PathBuf>> {
        let known: HashSet<String> = known
            .into_iter()
            .map(|id| format!("{SLOT_DIR_PREFIX}{id}"))
            .collect();

        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut removed = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if known.contains(&name) || self.excluded.contains(&name) || name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            if entry_age(&path).is_none_or(|age| age <= max_age) {
                continue;
            }
            let result = if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed.push(path),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove stray artifact entry");
                }
            }
        }
        Ok(removed)
    }
}

fn entry_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(root: &Path) -> ArtifactLayout {
        ArtifactLayout::new(root, "objectbox", "data.mdb")
            .with_excluded(["objectbox-admin.sh".to_string(), "nginx".to_string()])
    }

    #[test]
    fn paths_are_deterministic() {
        let layout = layout(Path::new("/srv/objectbox"));
        assert_eq!(
            layout.data_dir(SlotId::new(3)),
            PathBuf::from("/srv/objectbox/instance_3/objectbox")
        );
    }

    #[test]
    fn write_replaces_stale_content() {
        let root = tempfile::tempdir().unwrap();
        let layout = layout(root.path());
        let id = SlotId::new(1);

        let stale = layout.slot_dir(id).join("leftover.lock");
        std::fs::create_dir_all(layout.slot_dir(id)).unwrap();
        std::fs::write(&stale, b"x").unwrap();

        let data_dir = layout.write(id, b"fresh").unwrap();
        assert_eq!(std::fs::read(data_dir.join("data.mdb")).unwrap(), b"fresh");
        assert!(!stale.exists());
    }

    #[test]
    fn remove_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let layout = layout(root.path());
        let id = SlotId::new(2);
        layout.write(id, b"x").unwrap();

        assert!(layout.remove(id).unwrap());
        assert!(!layout.remove(id).unwrap());
        assert!(!layout.exists(id));
        assert!(layout.age(id).is_none());
    }

    #[test]
    fn remove_strays_keeps_slots_and_excluded_entries() {
        let root = tempfile::tempdir().unwrap();
        let layout = layout(root.path());
        layout.write(SlotId::new(1), b"x").unwrap();
        std::fs::write(root.path().join("objectbox-admin.sh"), b"#!/bin/sh").unwrap();
        std::fs::create_dir(root.path().join("nginx")).unwrap();
        std::fs::create_dir(root.path().join("tmp_upload_abc")).unwrap();
        std::fs::write(root.path().join("stray.mdb"), b"x").unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let removed = layout
            .remove_strays(Duration::ZERO, [SlotId::new(1)])
            .unwrap();

        assert_eq!(removed.len(), 2);
        assert!(layout.exists(SlotId::new(1)));
        assert!(root.path().join("objectbox-admin.sh").exists());
        assert!(root.path().join("nginx").exists());
        assert!(!root.path().join("tmp_upload_abc").exists());
    }

    #[test]
    fn remove_strays_respects_max_age() {
        let root = tempfile::tempdir().unwrap();
        let layout = layout(root.path());
        std::fs::create_dir(root.path().join("fresh")).unwrap();

        let removed = layout
            .remove_strays(Duration::from_secs(3600), Vec::new())
            .unwrap();
        assert!(removed.is_empty());
        assert!(root.path().join("fresh").exists());
    }

    #[test]
    fn remove_strays_tolerates_missing_root() {
        let layout = layout(Path::new("/nonexistent/boxpool-artifacts"));
        assert!(layout.remove_strays(Duration::ZERO, Vec::new()).unwrap().is_empty());
    }
}
