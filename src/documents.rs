use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use ulid::Ulid;

use crate::limits::*;

/// A binary attachment supplied with a booking request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("document too large: {0} bytes")]
    TooLarge(usize),
    #[error("document is empty")]
    Empty,
    #[error("document storage failed: {0}")]
    Io(#[from] io::Error),
}

/// External storage for booking attachments. Returns an opaque storage path.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn store(&self, upload: &Upload) -> Result<String, DocumentError>;
    async fn remove(&self, path: &str) -> Result<(), DocumentError>;
}

/// Keeps attachments as files under a single directory, named by ULID.
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: PathBuf) -> io::Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Keep a short alphanumeric extension from the client's file name, nothing else.
    fn extension(file_name: &str) -> Option<String> {
        let (_, ext) = file_name.rsplit_once('.')?;
        let ext: String = ext
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(8)
            .collect::<String>()
            .to_ascii_lowercase();
        (!ext.is_empty()).then_some(ext)
    }

    fn resolve(&self, path: &str) -> Option<PathBuf> {
        // Only bare file names produced by `store` are accepted.
        let valid = !path.is_empty()
            && path
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.')
            && !path.starts_with('.');
        valid.then(|| self.root.join(path))
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn store(&self, upload: &Upload) -> Result<String, DocumentError> {
        if upload.bytes.is_empty() {
            return Err(DocumentError::Empty);
        }
        if upload.bytes.len() > MAX_DOCUMENT_BYTES {
            return Err(DocumentError::TooLarge(upload.bytes.len()));
        }
        let name = match Self::extension(&upload.file_name) {
            Some(ext) => format!("{}.{ext}", Ulid::new()),
            None => Ulid::new().to_string(),
        };
        tokio::fs::write(self.root.join(&name), &upload.bytes).await?;
        tracing::debug!("stored document {name} ({} bytes)", upload.bytes.len());
        Ok(name)
    }

    async fn remove(&self, path: &str) -> Result<(), DocumentError> {
        let Some(full) = self.resolve(path) else {
            return Err(DocumentError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a stored document path: {path}"),
            )));
        };
        match tokio::fs::remove_file(full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
