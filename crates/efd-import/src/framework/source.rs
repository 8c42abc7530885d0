//! Readable byte streams addressed by the job's opaque file path

use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeekExt};

use crate::error::{ImportError, ImportResult};
use crate::storage::Storage;

pub type SourceStream = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Open `location` positioned at byte `offset`
    async fn open(&self, location: &str, offset: u64) -> ImportResult<SourceStream>;
}

#[async_trait]
impl SourceReader for Storage {
    async fn open(&self, location: &str, offset: u64) -> ImportResult<SourceStream> {
        self.read_from(location, offset).await
    }
}

/// Files under a local directory, for development and tests
pub struct LocalFileSource {
    root: PathBuf,
}

impl LocalFileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SourceReader for LocalFileSource {
    async fn open(&self, location: &str, offset: u64) -> ImportResult<SourceStream> {
        let path = self.root.join(location.trim_start_matches('/'));
        let mut file = tokio::fs::File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ImportError::Source(format!("{} does not exist", path.display()))
            } else {
                ImportError::Transport(format!("opening {}: {}", path.display(), err))
            }
        })?;

        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }

        Ok(Box::pin(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_local_source_seeks_to_offset() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ledger.txt"), b"|0000|abc|\n|C100|x|\n").unwrap();

        let source = LocalFileSource::new(dir.path());
        let mut stream = source.open("ledger.txt", 11).await.unwrap();
        let mut rest = String::new();
        stream.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "|C100|x|\n");
    }

    #[tokio::test]
    async fn test_local_source_offset_past_end_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ledger.txt"), b"|0000|\n").unwrap();

        let source = LocalFileSource::new(dir.path());
        let mut stream = source.open("/ledger.txt", 500).await.unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_local_source_missing_file_is_not_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let source = LocalFileSource::new(dir.path());
        let err = source.open("missing.txt", 0).await.err().unwrap();
        assert!(matches!(err, ImportError::Source(_)));
        assert!(!err.is_recoverable());
    }
}
