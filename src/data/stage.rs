use std::{
    io,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use ring::digest;
use tokio::io::AsyncWriteExt;

use crate::error::Error;

/// A file on local disk owned by a single upload. The file is deleted when the artifact is dropped,
/// so every exit path of the upload releases it.
#[derive(Debug)]
pub struct StagedArtifact {
    path: PathBuf,
    size_bytes: u64,
    sha256_hash: Option<String>,
}

impl StagedArtifact {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            size_bytes: 0,
            sha256_hash: None,
        }
    }

    /// Reserves the sibling path `{path}.{suffix}` for a file derived from this artifact.
    ///
    /// The returned artifact owns the path whether or not anything gets written to it, so partial
    /// output of a failed process is cleaned up as well.
    pub fn derive(&self, suffix: &str) -> StagedArtifact {
        let mut path = self.path.clone().into_os_string();
        path.push(".");
        path.push(suffix);
        StagedArtifact::new(PathBuf::from(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn sha256_hash(&self) -> Option<&str> {
        self.sha256_hash.as_deref()
    }

    /// Opens a new reader positioned at the start of the file.
    pub async fn open(&self) -> Result<tokio::fs::File, io::Error> {
        tokio::fs::File::open(&self.path).await
    }

    /// Refreshes the recorded size from disk, used after an external process wrote the file.
    pub async fn refresh_size(&mut self) -> Result<u64, io::Error> {
        self.size_bytes = tokio::fs::metadata(&self.path).await?.len();
        Ok(self.size_bytes)
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        // unlink only, no file content is touched; the file is gone once drop returns
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::debug!("Removed staged file {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::error!(
                "Failed to remove staged file {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// Buffers inbound uploads to uniquely named files in the staging directory.
#[derive(Clone, Debug)]
pub struct Stager {
    dir: PathBuf,
}

impl Stager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Writes the stream to a new staged file, failing with [`Error::PayloadTooLargeError`] as soon
    /// as more than `max_bytes` have been received.
    pub async fn stage<S>(&self, mut stream: S, max_bytes: u64) -> Result<StagedArtifact, Error>
    where
        S: Stream<Item = Result<Bytes, io::Error>> + Unpin + Send,
    {
        let (file, temp_path) = tempfile::Builder::new()
            .prefix("tubely-upload-")
            .suffix(".mp4")
            .tempfile_in(&self.dir)
            .map_err(|e| Error::StagingError(format!("Failed to create staging file: {e}")))?
            .into_parts();
        let path = temp_path
            .keep()
            .map_err(|e| Error::StagingError(format!("Failed to keep staging file: {e}")))?;
        let mut artifact = StagedArtifact::new(path);
        let mut file = tokio::fs::File::from_std(file);

        let mut hasher = digest::Context::new(&digest::SHA256);
        let mut size_bytes: u64 = 0;
        while let Some(chunk) = stream
            .try_next()
            .await
            .map_err(|e| Error::StagingError(format!("Failed to read upload: {e}")))?
        {
            size_bytes += chunk.len() as u64;
            if size_bytes > max_bytes {
                log::warn!(
                    "Rejecting upload staged at {} after receiving {} bytes, exceeding limit {}",
                    artifact.path.display(),
                    size_bytes,
                    max_bytes
                );
                return Err(Error::PayloadTooLargeError(max_bytes));
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(|e| {
                Error::StagingError(format!(
                    "Failed writing to {}: {e}",
                    artifact.path.display()
                ))
            })?;
        }

        file.flush().await.map_err(|e| {
            Error::StagingError(format!(
                "Failed to flush {}: {e}",
                artifact.path.display()
            ))
        })?;
        file.sync_all().await.map_err(|e| {
            Error::StagingError(format!(
                "Failed to sync {}: {e}",
                artifact.path.display()
            ))
        })?;

        artifact.size_bytes = size_bytes;
        artifact.sha256_hash = Some(data_encoding::HEXUPPER.encode(hasher.finish().as_ref()));
        Ok(artifact)
    }
}
