//! Directory-backed data source: one file per item.

use localsync_core::{DataSource, LocalSyncError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Hex digits of the content hash used as item revision.
const REVISION_LEN: usize = 16;

/// Items stored as files in one directory.
///
/// The file name is the item id. Hidden files are not items.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
    open: bool,
}

impl DirectorySource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            open: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn item_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
            return Err(LocalSyncError::Validation {
                field: "item id".to_string(),
                message: format!("'{}' cannot be used as file name", id),
            });
        }
        Ok(self.dir.join(id))
    }

    fn check_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(LocalSyncError::Other(format!(
                "data source {} is not open",
                self.dir.display()
            )))
        }
    }
}

/// Short content hash.
pub fn revision(data: &[u8]) -> String {
    blake3::hash(data).to_hex().as_str()[..REVISION_LEN].to_string()
}

impl DataSource for DirectorySource {
    fn open(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| LocalSyncError::io_with_path(e, &self.dir))?;
        self.open = true;
        debug!("Opened data source {}", self.dir.display());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn enumerate(&self) -> Result<BTreeMap<String, String>> {
        self.check_open()?;
        let mut items = BTreeMap::new();
        let entries = std::fs::read_dir(&self.dir).map_err(|e| LocalSyncError::io_with_path(e, &self.dir))?;
        for entry in entries {
            let entry = entry.map_err(|e| LocalSyncError::io_with_path(e, &self.dir))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !path.is_file() {
                continue;
            }
            let data = std::fs::read(&path).map_err(|e| LocalSyncError::io_with_path(e, &path))?;
            items.insert(name, revision(&data));
        }
        Ok(items)
    }

    fn read(&self, id: &str) -> Result<Vec<u8>> {
        self.check_open()?;
        let path = self.item_path(id)?;
        std::fs::read(&path).map_err(|e| LocalSyncError::io_with_path(e, path))
    }

    fn write(&mut self, id: Option<&str>, item: &[u8]) -> Result<(String, String)> {
        self.check_open()?;
        let id = match id {
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().simple().to_string(),
        };
        let path = self.item_path(&id)?;
        std::fs::write(&path, item).map_err(|e| LocalSyncError::io_with_path(e, path))?;
        Ok((id, revision(item)))
    }

    fn remove(&mut self, id: &str) -> Result<()> {
        self.check_open()?;
        let path = self.item_path(id)?;
        std::fs::remove_file(&path).map_err(|e| LocalSyncError::io_with_path(e, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_source() -> (TempDir, DirectorySource) {
        let dir = TempDir::new().unwrap();
        let mut source = DirectorySource::new(dir.path().join("addressbook"));
        source.open().unwrap();
        (dir, source)
    }

    #[test]
    fn test_open_creates_directory() {
        let (_dir, source) = open_source();
        assert!(source.dir().is_dir());
        assert!(source.enumerate().unwrap().is_empty());
    }

    #[test]
    fn test_write_read_remove() {
        let (_dir, mut source) = open_source();
        let (id, rev) = source.write(None, b"BEGIN:VCARD\nEND:VCARD\n").unwrap();
        assert_eq!(rev.len(), REVISION_LEN);
        assert_eq!(source.read(&id).unwrap(), b"BEGIN:VCARD\nEND:VCARD\n");
        assert_eq!(source.enumerate().unwrap().get(&id), Some(&rev));

        source.remove(&id).unwrap();
        assert!(source.enumerate().unwrap().is_empty());
        assert!(source.read(&id).is_err());
    }

    #[test]
    fn test_revision_follows_content() {
        let (_dir, mut source) = open_source();
        let (_, first) = source.write(Some("john"), b"John").unwrap();
        let (_, second) = source.write(Some("john"), b"John Doe").unwrap();
        assert_ne!(first, second);
        assert_eq!(source.enumerate().unwrap().len(), 1);
    }

    #[test]
    fn test_hidden_files_are_not_items() {
        let (_dir, source) = open_source();
        std::fs::write(source.dir().join(".lock"), b"").unwrap();
        assert!(source.enumerate().unwrap().is_empty());
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let (_dir, mut source) = open_source();
        assert!(source.write(Some("../escape"), b"x").is_err());
        assert!(source.write(Some(".hidden"), b"x").is_err());
    }

    #[test]
    fn test_closed_source_refuses_access() {
        let (_dir, mut source) = open_source();
        source.close().unwrap();
        assert!(source.enumerate().is_err());
    }
}
