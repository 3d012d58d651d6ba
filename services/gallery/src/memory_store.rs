//! In-process repositories used when no database is configured.

use crate::repository::{Comment, CommentRepository, Image, ImageRepository, NewImage, RepositoryError};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use uuid::Uuid;

/// Image repository held in memory
#[derive(Default)]
pub struct InMemoryImageRepository {
    images: RwLock<Vec<Image>>,
}

impl InMemoryImageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the repository with existing records
    pub fn with_images(images: impl IntoIterator<Item = Image>) -> Self {
        Self {
            images: RwLock::new(images.into_iter().collect()),
        }
    }
}

#[async_trait]
impl ImageRepository for InMemoryImageRepository {
    fn find_all(&self) -> BoxStream<'static, Result<Image, RepositoryError>> {
        let snapshot = self.images.read().clone();
        stream::iter(snapshot.into_iter().map(Ok)).boxed()
    }

    async fn save(&self, image: NewImage) -> Result<Image, RepositoryError> {
        let saved = Image::new(Uuid::new_v4().to_string(), image.name);
        self.images.write().push(saved.clone());
        Ok(saved)
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Image>, RepositoryError> {
        let images = self.images.read();
        let mut matches = images.iter().filter(|i| i.name == name);

        match (matches.next(), matches.next()) {
            (Some(_), Some(_)) => Err(RepositoryError::Ambiguous(name.to_string())),
            (first, _) => Ok(first.cloned()),
        }
    }

    async fn delete(&self, image: Image) -> Result<(), RepositoryError> {
        self.images.write().retain(|i| i.id != image.id);
        Ok(())
    }
}

/// Comment repository held in memory
#[derive(Default)]
pub struct InMemoryCommentRepository {
    comments: RwLock<Vec<Comment>>,
}

impl InMemoryCommentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored comment
    pub fn comments(&self) -> Vec<Comment> {
        self.comments.read().clone()
    }
}

#[async_trait]
impl CommentRepository for InMemoryCommentRepository {
    async fn save(&self, mut comment: Comment) -> Result<Comment, RepositoryError> {
        if comment.id.is_none() {
            comment.id = Some(Uuid::new_v4().to_string());
        }
        self.comments.write().push(comment.clone());
        Ok(comment)
    }

    async fn delete_all(&self) -> Result<u64, RepositoryError> {
        let mut comments = self.comments.write();
        let count = comments.len() as u64;
        comments.clear();
        Ok(count)
    }
}
