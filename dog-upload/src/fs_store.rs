use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::{
    ByteStream, Promotion, SessionToken, StagingHandle, StagingStore, UploadConfig, UploadError,
    UploadResult,
};

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Local filesystem store.
///
/// Layout under `root`:
/// - `staging/<token>.part` - one file per session, never exposed
/// - `public/<name>` - promoted artifacts
pub struct LocalFsStore {
    staging_dir: PathBuf,
    public_dir: PathBuf,
}

impl LocalFsStore {
    /// Create the store, making sure both directories exist
    pub async fn open<P: AsRef<Path>>(root: P) -> UploadResult<Self> {
        let root = root.as_ref();
        let store = Self {
            staging_dir: root.join("staging"),
            public_dir: root.join("public"),
        };
        fs::create_dir_all(&store.staging_dir).await?;
        fs::create_dir_all(&store.public_dir).await?;
        Ok(store)
    }

    /// Open the store rooted at `config.storage_root`
    pub async fn from_config(config: &UploadConfig) -> UploadResult<Self> {
        Self::open(&config.storage_root).await
    }

    /// Directory holding promoted artifacts
    pub fn public_dir(&self) -> &Path {
        &self.public_dir
    }

    /// Directory holding staging artifacts
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    fn public_path(&self, name: &str) -> UploadResult<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(UploadError::storage(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid public name: {name:?}"),
            )));
        }
        Ok(self.public_dir.join(name))
    }
}

#[async_trait]
impl StagingStore for LocalFsStore {
    fn staging_handle(&self, token: &SessionToken) -> StagingHandle {
        StagingHandle {
            token: token.clone(),
            location: self
                .staging_dir
                .join(format!("{}.part", token.as_str()))
                .to_string_lossy()
                .into_owned(),
        }
    }

    async fn append(&self, staging: &StagingHandle, offset: u64, data: &[u8]) -> UploadResult<u64> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&staging.location)
            .await?;

        let current = file.metadata().await?.len();
        if current < offset {
            return Err(UploadError::storage(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                format!(
                    "staging artifact {} holds {} bytes, expected {}",
                    staging.location, current, offset
                ),
            )));
        }
        if current > offset {
            tracing::warn!(
                "Truncating torn write in {} from {} to {} bytes",
                staging.location,
                current,
                offset
            );
            file.set_len(offset).await?;
        }

        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_data().await?;

        Ok(offset + data.len() as u64)
    }

    async fn discard(&self, staging: &StagingHandle) -> UploadResult<()> {
        match fs::remove_file(&staging.location).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn staging_len(&self, staging: &StagingHandle) -> UploadResult<Option<u64>> {
        match fs::metadata(&staging.location).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn public_exists(&self, name: &str) -> UploadResult<bool> {
        let path = self.public_path(name)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn promote(&self, staging: &StagingHandle, name: &str) -> UploadResult<Promotion> {
        let target = self.public_path(name)?;
        fs::create_dir_all(&self.public_dir).await?;

        // A hard link never replaces an existing entry, so a concurrent
        // writer to the same public name is detected instead of clobbered.
        let mut staging_left = false;
        match fs::hard_link(&staging.location, &target).await {
            Ok(()) => {
                if let Err(e) = fs::remove_file(&staging.location).await {
                    tracing::warn!("Promoted {} but could not unlink staging: {}", name, e);
                    staging_left = true;
                }
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(Promotion::NameTaken),
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(e.into()),
            Err(e) => {
                tracing::debug!("hard_link unavailable for {} ({}), falling back to rename", name, e);
                if fs::try_exists(&target).await? {
                    return Ok(Promotion::NameTaken);
                }
                fs::rename(&staging.location, &target).await?;
            }
        }

        let byte_count = fs::metadata(&target).await?.len();
        Ok(Promotion::Promoted {
            byte_count,
            staging_left,
        })
    }

    async fn open_public(&self, name: &str) -> UploadResult<ByteStream> {
        let path = self.public_path(name)?;
        let mut file = fs::File::open(&path).await?;

        let stream = async_stream::stream! {
            let mut buf = vec![0u8; READ_BUFFER_BYTES];
            loop {
                match file.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => yield Ok(bytes::Bytes::copy_from_slice(&buf[..n])),
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
