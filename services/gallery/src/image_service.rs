//! Image store: lists, serves, streams in and deletes named images.
//!
//! Image bytes live under a local upload root. Metadata lives behind an
//! [`ImageRepository`]. No state is cached between calls.

use crate::config::ImagesConfig;
use crate::repository::{Image, ImageRepository, NewImage, RepositoryError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt, TryStreamExt};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Errors surfaced by the image store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("Invalid image name: {0:?}")]
    InvalidName(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Upload stream error: {0}")]
    Upload(String),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Lazy reference to image bytes on disk.
///
/// Building one never touches the filesystem; a missing file is only
/// discovered by [`FileResource::exists`] or [`FileResource::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileResource {
    path: PathBuf,
}

impl FileResource {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Human-readable location, e.g. `file [upload-dir/alpha.jpg]`
    pub fn description(&self) -> String {
        format!("file [{}]", self.path.display())
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Open the file for reading
    pub async fn open(&self) -> Result<tokio::fs::File, StoreError> {
        tokio::fs::File::open(&self.path).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                StoreError::NotFound(self.path.display().to_string())
            } else {
                StoreError::io(&self.path, e)
            }
        })
    }
}

/// One uploaded file within a create request
#[async_trait]
pub trait FilePart: Send + Sync {
    /// Client-supplied file name
    fn filename(&self) -> &str;

    /// Write the part's bytes to `dest`, replacing any existing file
    async fn transfer_to(&self, dest: &Path) -> Result<(), StoreError>;
}

#[async_trait]
impl<P: FilePart + ?Sized> FilePart for Box<P> {
    fn filename(&self) -> &str {
        (**self).filename()
    }

    async fn transfer_to(&self, dest: &Path) -> Result<(), StoreError> {
        (**self).transfer_to(dest).await
    }
}

/// Upload part already streamed to a temporary file under the upload root.
///
/// The transfer is a rename into place. A spooled file that is never
/// transferred is removed on drop.
#[derive(Debug)]
pub struct SpooledPart {
    filename: String,
    spool_path: PathBuf,
    size: u64,
}

impl SpooledPart {
    pub fn size(&self) -> u64 {
        self.size
    }
}

#[async_trait]
impl FilePart for SpooledPart {
    fn filename(&self) -> &str {
        &self.filename
    }

    async fn transfer_to(&self, dest: &Path) -> Result<(), StoreError> {
        tokio::fs::rename(&self.spool_path, dest)
            .await
            .map_err(|e| StoreError::io(dest, e))?;

        metrics::counter!("gallery.uploads.bytes").increment(self.size);
        Ok(())
    }
}

impl Drop for SpooledPart {
    fn drop(&mut self) {
        // Already renamed away on success.
        let _ = std::fs::remove_file(&self.spool_path);
    }
}

/// Image store service
pub struct ImageService {
    repository: Arc<dyn ImageRepository>,
    upload_root: PathBuf,
    upload_concurrency: usize,
    link_metadata: bool,
}

impl ImageService {
    pub fn new(repository: Arc<dyn ImageRepository>, config: &ImagesConfig) -> Self {
        info!(
            upload_root = %config.upload_root.display(),
            link_metadata = config.link_metadata,
            "Image service initialized"
        );

        Self {
            repository,
            upload_root: config.upload_root.clone(),
            upload_concurrency: config.upload_concurrency.max(1),
            link_metadata: config.link_metadata,
        }
    }

    pub fn repository(&self) -> &Arc<dyn ImageRepository> {
        &self.repository
    }

    /// Every image known to the repository, in repository order
    pub fn find_all_images(&self) -> BoxStream<'static, Result<Image, StoreError>> {
        self.repository.find_all().map_err(StoreError::from).boxed()
    }

    /// Reference to the bytes stored for `name`, whether or not they exist
    pub async fn find_one_image(&self, name: &str) -> Result<FileResource, StoreError> {
        Ok(FileResource {
            path: self.resolve(name)?,
        })
    }

    /// Stream `chunks` into a temporary file under the upload root.
    ///
    /// The name is validated before anything is written. On failure the
    /// partial file is removed.
    #[instrument(skip(self, chunks))]
    pub async fn spool<S>(&self, filename: &str, chunks: S) -> Result<SpooledPart, StoreError>
    where
        S: Stream<Item = Result<Bytes, StoreError>>,
    {
        self.resolve(filename)?;

        let mut part = SpooledPart {
            filename: filename.to_string(),
            spool_path: self
                .upload_root
                .join(format!(".upload-{}.part", Uuid::new_v4())),
            size: 0,
        };

        let path = part.spool_path.clone();
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;

        futures::pin_mut!(chunks);
        while let Some(chunk) = chunks.try_next().await? {
            file.write_all(&chunk)
                .await
                .map_err(|e| StoreError::io(&path, e))?;
            part.size += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| StoreError::io(&path, e))?;

        debug!(filename = %filename, size = part.size, "Upload spooled");
        Ok(part)
    }

    /// Transfer every part to the upload root.
    ///
    /// Resolves once all transfers have finished. The first failure fails the
    /// whole call; files already written stay on disk.
    #[instrument(skip(self, parts))]
    pub async fn create_image<S, P>(&self, parts: S) -> Result<(), StoreError>
    where
        S: Stream<Item = Result<P, StoreError>> + Send,
        P: FilePart,
    {
        let result = parts
            .try_for_each_concurrent(self.upload_concurrency, |part| async move {
                let dest = self.resolve(part.filename())?;

                debug!(filename = %part.filename(), dest = %dest.display(), "Transferring upload");
                part.transfer_to(&dest).await?;

                if self.link_metadata {
                    let image = self
                        .repository
                        .save(NewImage {
                            name: part.filename().to_string(),
                        })
                        .await?;
                    debug!(image_id = %image.id, name = %image.name, "Linked upload to image record");
                }

                metrics::counter!("gallery.uploads.completed").increment(1);
                Ok(())
            })
            .await;

        if result.is_err() {
            metrics::counter!("gallery.uploads.failed").increment(1);
        }
        result
    }

    /// Remove the image record named `name`. The file on disk is left in place.
    #[instrument(skip(self))]
    pub async fn delete_image(&self, name: &str) -> Result<(), StoreError> {
        let image = self
            .repository
            .find_by_name(name)
            .await?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        self.repository.delete(image).await?;

        info!(name = %name, "Image record deleted");
        Ok(())
    }

    /// Path for `name` under the upload root; rejects anything but a plain file name
    fn resolve(&self, name: &str) -> Result<PathBuf, StoreError> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(file)), None) => Ok(self.upload_root.join(file)),
            _ => Err(StoreError::InvalidName(name.to_string())),
        }
    }
}
