use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;

/// Receives byte counts as a transfer advances.
pub trait ProgressSink: Send + Sync {
    fn transferred(&self, bytes_done: u64, bytes_total: u64);
}

/// Moves uploaded video bytes into durable storage.
///
/// `storage_key` is chosen by the caller before the transfer starts so a cancelled or
/// failed transfer can be discarded even though no reference was ever returned.
#[async_trait]
pub trait TransferBackend: Send + Sync {
    async fn upload_file(
        &self,
        storage_key: &str,
        bytes: &[u8],
        progress: &dyn ProgressSink,
    ) -> Result<String>;

    async fn discard(&self, storage_key: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FsTransferBackend {
    root: PathBuf,
    chunk_bytes: usize,
}

impl FsTransferBackend {
    pub fn new(root: impl Into<PathBuf>, chunk_bytes: usize) -> Self {
        Self {
            root: root.into(),
            chunk_bytes: chunk_bytes.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn final_path(&self, storage_key: &str) -> PathBuf {
        self.root.join(storage_key)
    }

    fn partial_path(&self, storage_key: &str) -> PathBuf {
        self.root.join(format!("{storage_key}.part"))
    }
}

#[async_trait]
impl TransferBackend for FsTransferBackend {
    async fn upload_file(
        &self,
        storage_key: &str,
        bytes: &[u8],
        progress: &dyn ProgressSink,
    ) -> Result<String> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create blob dir '{}'", self.root.display()))?;

        let partial = self.partial_path(storage_key);
        let mut file = fs::File::create(&partial)
            .await
            .with_context(|| format!("failed to create '{}'", partial.display()))?;

        let total = bytes.len() as u64;
        let mut done = 0u64;
        for chunk in bytes.chunks(self.chunk_bytes) {
            file.write_all(chunk)
                .await
                .with_context(|| format!("failed writing '{}'", partial.display()))?;
            done += chunk.len() as u64;
            progress.transferred(done, total);
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let target = self.final_path(storage_key);
        fs::rename(&partial, &target)
            .await
            .with_context(|| format!("failed to finalize '{}'", target.display()))?;
        debug!(path = %target.display(), bytes = total, "transfer stored");
        Ok(target.to_string_lossy().into_owned())
    }

    async fn discard(&self, storage_key: &str) -> Result<()> {
        for path in [self.partial_path(storage_key), self.final_path(storage_key)] {
            match fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "discarded transfer data"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to remove '{}'", path.display()))
                }
            }
        }
        Ok(())
    }
}
