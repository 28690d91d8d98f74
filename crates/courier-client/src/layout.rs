//! Per-user folder layout
//!
//! ```text
//! <data_dir>/users/<username>/
//!     Received/   inbound files as they arrive from the relay
//!     Decrypt/    decrypted copies of received files
//!     Encrypt/    encrypted copies staged for submission
//! ```
//!
//! Folders are created on demand, never up front.

use courier_core::{Error, PeerId, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Folder {
    Received,
    Decrypt,
    Encrypt,
}

impl Folder {
    pub const ALL: [Folder; 3] = [Folder::Received, Folder::Decrypt, Folder::Encrypt];

    pub fn dir_name(self) -> &'static str {
        match self {
            Folder::Received => "Received",
            Folder::Decrypt => "Decrypt",
            Folder::Encrypt => "Encrypt",
        }
    }
}

/// A stored file as listed by [`UserDirs::list`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct UserDirs {
    root: PathBuf,
}

impl UserDirs {
    pub fn new(data_dir: &Path, username: &PeerId) -> Self {
        Self {
            root: data_dir.join("users").join(username.as_str()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn folder(&self, folder: Folder) -> PathBuf {
        self.root.join(folder.dir_name())
    }

    pub fn received(&self) -> PathBuf {
        self.folder(Folder::Received)
    }

    pub fn decrypt(&self) -> PathBuf {
        self.folder(Folder::Decrypt)
    }

    pub fn encrypt(&self) -> PathBuf {
        self.folder(Folder::Encrypt)
    }

    /// Create `folder` if missing and return its path
    pub async fn ensure(&self, folder: Folder) -> Result<PathBuf> {
        let path = self.folder(folder);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| Error::filesystem(format!("create {}", path.display()), e))?;
        Ok(path)
    }

    /// Regular files in `folder`, sorted by name. A folder that does not
    /// exist yet is simply empty.
    pub async fn list(&self, folder: Folder) -> Result<Vec<StoredFile>> {
        let path = self.folder(folder);
        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::filesystem(format!("read {}", path.display()), e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::filesystem(format!("read {}", path.display()), e))?
        {
            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };
            files.push(StoredFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_layout_paths_and_on_demand_creation() {
        let dir = TempDir::new().unwrap();
        let user = PeerId::parse("alice").unwrap();
        let dirs = UserDirs::new(dir.path(), &user);

        assert_eq!(dirs.received(), dir.path().join("users/alice/Received"));
        assert!(!dirs.received().exists());

        let created = dirs.ensure(Folder::Decrypt).await.unwrap();
        assert!(created.is_dir());
        assert!(!dirs.encrypt().exists());
    }

    #[tokio::test]
    async fn test_list_files() {
        let dir = TempDir::new().unwrap();
        let dirs = UserDirs::new(dir.path(), &PeerId::parse("bob").unwrap());

        assert!(dirs.list(Folder::Received).await.unwrap().is_empty());

        let received = dirs.ensure(Folder::Received).await.unwrap();
        std::fs::write(received.join("b.txt"), b"12345").unwrap();
        std::fs::write(received.join("a.txt"), b"1").unwrap();
        std::fs::create_dir(received.join("subdir")).unwrap();

        let files = dirs.list(Folder::Received).await.unwrap();
        assert_eq!(
            files,
            vec![
                StoredFile { name: "a.txt".to_string(), size: 1 },
                StoredFile { name: "b.txt".to_string(), size: 5 },
            ]
        );
    }
}
