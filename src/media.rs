//! Photo storage.
//!
//! Files are addressed by bare names (`before_<uuid>.jpg`) relative to the
//! storage root; tickets store those names.

use std::{
    io,
    path::{Path, PathBuf},
    time::SystemTime,
};

use async_trait::async_trait;
use derive_more::{Display, From};
use time::OffsetDateTime;
use tokio::fs;
use uuid::Uuid;

use crate::config;

#[derive(Debug, Display, derive_more::Error, From)]
pub enum Error {
    #[display("media i/o: {_0}")]
    Io(io::Error),

    #[display("unsupported file type `{_0}`")]
    #[from(ignore)]
    UnsupportedExtension(#[error(not(source))] String),

    #[display("file is {size} bytes, limit is {max}")]
    #[from(ignore)]
    TooLarge { size: usize, max: usize },

    #[display("invalid media name `{_0}`")]
    #[from(ignore)]
    InvalidName(#[error(not(source))] String),
}

impl Error {
    /// Whether the caller supplied something unacceptable, as opposed to a
    /// storage failure.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub name: String,
    pub size: u64,
    pub modified: OffsetDateTime,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Stores `bytes` under a fresh name and returns that name.
    async fn save(
        &self,
        bytes: &[u8],
        extension: &str,
        prefix: &str,
    ) -> Result<String, Error>;

    /// Removing a file that is already gone succeeds.
    async fn delete(&self, name: &str) -> Result<(), Error>;

    async fn exists(&self, name: &str) -> Result<bool, Error>;

    async fn size(&self, name: &str) -> Result<u64, Error>;

    async fn read(&self, name: &str) -> Result<Vec<u8>, Error>;

    async fn list(&self) -> Result<Vec<Entry>, Error>;

    /// Whether the backing location can currently be used.
    async fn is_available(&self) -> bool;
}

/// Lowercased extension with its leading dot, if the name has one.
pub fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
}

pub fn content_type(name: &str) -> &'static str {
    match extension_of(name).as_deref() {
        Some(".jpg" | ".jpeg") => "image/jpeg",
        Some(".png") => "image/png",
        Some(".webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Storage rooted at a local directory.
pub struct Dir {
    root: PathBuf,
    max_file_size: usize,
    allowed_extensions: Vec<String>,
}

impl Dir {
    pub async fn open(config: &config::Media) -> Result<Self, Error> {
        fs::create_dir_all(&config.dir).await?;
        Ok(Self {
            root: config.dir.clone(),
            max_file_size: config.max_file_size,
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|ext| ext.to_ascii_lowercase())
                .collect(),
        })
    }

    fn path(&self, name: &str) -> Result<PathBuf, Error> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\'])
            && name != "..";
        if valid {
            Ok(self.root.join(name))
        } else {
            Err(Error::InvalidName(name.to_string()))
        }
    }
}

fn to_offset(time: SystemTime) -> OffsetDateTime {
    OffsetDateTime::from(time)
}

#[async_trait]
impl Storage for Dir {
    async fn save(
        &self,
        bytes: &[u8],
        extension: &str,
        prefix: &str,
    ) -> Result<String, Error> {
        let extension = extension.to_ascii_lowercase();
        if !self.allowed_extensions.contains(&extension) {
            return Err(Error::UnsupportedExtension(extension));
        }
        if bytes.len() > self.max_file_size {
            return Err(Error::TooLarge {
                size: bytes.len(),
                max: self.max_file_size,
            });
        }

        let name = format!("{prefix}{}{extension}", Uuid::new_v4());
        fs::write(self.path(&name)?, bytes).await?;
        tracing::debug!(%name, size = bytes.len(), "media file stored");
        Ok(name)
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        match fs::remove_file(self.path(name)?).await {
            Ok(()) => {
                tracing::debug!(%name, "media file deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool, Error> {
        Ok(fs::try_exists(self.path(name)?).await?)
    }

    async fn size(&self, name: &str) -> Result<u64, Error> {
        Ok(fs::metadata(self.path(name)?).await?.len())
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>, Error> {
        Ok(fs::read(self.path(name)?).await?)
    }

    async fn list(&self) -> Result<Vec<Entry>, Error> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            entries.push(Entry {
                name,
                size: metadata.len(),
                modified: to_offset(metadata.modified()?),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn is_available(&self) -> bool {
        fs::metadata(&self.root).await.is_ok_and(|m| m.is_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn dir(root: &Path) -> Dir {
        Dir::open(&config::Media {
            dir: root.to_path_buf(),
            max_file_size: 8,
            ..config::Media::default()
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn saves_and_deletes_files() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = dir(tmp.path()).await;

        let name = storage.save(b"jpeg", ".JPG", "before_").await.unwrap();
        assert!(name.starts_with("before_"));
        assert!(name.ends_with(".jpg"));
        assert!(storage.exists(&name).await.unwrap());
        assert_eq!(storage.size(&name).await.unwrap(), 4);
        assert_eq!(storage.read(&name).await.unwrap(), b"jpeg");

        storage.delete(&name).await.unwrap();
        assert!(!storage.exists(&name).await.unwrap());
        // Already gone.
        storage.delete(&name).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_unsupported_and_oversized_files() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = dir(tmp.path()).await;

        let err = storage.save(b"x", ".exe", "").await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedExtension(_)));
        assert!(err.is_rejection());

        let err = storage.save(b"123456789", ".png", "").await.unwrap_err();
        assert!(matches!(err, Error::TooLarge { size: 9, max: 8 }));
        assert!(storage.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn refuses_path_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = dir(tmp.path()).await;

        for name in ["../secret", "..", "a/b.jpg", ".hidden", ""] {
            assert!(matches!(
                storage.read(name).await,
                Err(Error::InvalidName(_)),
            ));
        }
    }

    #[tokio::test]
    async fn lists_only_files() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = dir(tmp.path()).await;
        std::fs::create_dir(tmp.path().join("nested")).unwrap();
        let name = storage.save(b"png", ".png", "after_").await.unwrap();

        let entries = storage.list().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, name);
        assert_eq!(entries[0].size, 3);
    }

    #[tokio::test]
    async fn reports_missing_root_as_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("media");
        let storage = dir(&root).await;
        assert!(storage.is_available().await);

        std::fs::remove_dir(&root).unwrap();
        assert!(!storage.is_available().await);
    }

    #[test]
    fn detects_extension_and_content_type() {
        assert_eq!(extension_of("photo.JPeG").as_deref(), Some(".jpeg"));
        assert_eq!(extension_of("photo"), None);
        assert_eq!(content_type("a.webp"), "image/webp");
        assert_eq!(content_type("a.bin"), "application/octet-stream");
    }
}
