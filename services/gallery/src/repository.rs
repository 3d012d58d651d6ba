//! Repository ports for image and comment metadata, with PostgreSQL adapters.

use crate::config::DatabaseConfig;
use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Errors surfaced by repository adapters
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("More than one image is named {0}")]
    Ambiguous(String),

    #[error("Repository unavailable: {0}")]
    Unavailable(String),
}

/// A stored image record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Image {
    pub id: String,
    pub name: String,
}

impl Image {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Image record that has not been assigned an id yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImage {
    pub name: String,
}

/// A comment on an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    #[serde(default)]
    pub id: Option<String>,
    pub image_id: String,
    #[serde(alias = "comment")]
    pub body: String,
}

/// Persistence port for image metadata
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageRepository: Send + Sync {
    /// Every stored image, produced lazily
    fn find_all(&self) -> BoxStream<'static, Result<Image, RepositoryError>>;

    /// Persist a new image and return it with its assigned id
    async fn save(&self, image: NewImage) -> Result<Image, RepositoryError>;

    /// Look up the image with the given name
    async fn find_by_name(&self, name: &str) -> Result<Option<Image>, RepositoryError>;

    /// Remove an image record
    async fn delete(&self, image: Image) -> Result<(), RepositoryError>;

    /// Whether the backing store is reachable
    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

/// Write-side persistence port for comments
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommentRepository: Send + Sync {
    /// Persist a comment and return it with its assigned id
    async fn save(&self, comment: Comment) -> Result<Comment, RepositoryError>;

    /// Remove every comment, returning how many were removed
    async fn delete_all(&self) -> Result<u64, RepositoryError>;
}

/// Connect the shared PostgreSQL pool
pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connect_timeout())
        .idle_timeout(Some(config.idle_timeout()))
        .connect(&config.url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    info!("Connected to PostgreSQL database");

    Ok(pool)
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    info!("Running database migrations");

    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run migrations")?;

    info!("Database migrations completed");
    Ok(())
}

/// PostgreSQL-backed image repository
#[derive(Clone)]
pub struct PgImageRepository {
    pool: PgPool,
}

impl PgImageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ImageRepository for PgImageRepository {
    fn find_all(&self) -> BoxStream<'static, Result<Image, RepositoryError>> {
        let pool = self.pool.clone();

        // Nothing is queried until the stream is first polled.
        stream::once(async move {
            sqlx::query_as::<_, Image>("SELECT id, name FROM images ORDER BY created_at")
                .fetch_all(&pool)
                .await
        })
        .map_ok(|rows| stream::iter(rows.into_iter().map(Ok::<_, sqlx::Error>)))
        .try_flatten()
        .map_err(RepositoryError::from)
        .boxed()
    }

    #[instrument(skip(self), fields(name = %image.name))]
    async fn save(&self, image: NewImage) -> Result<Image, RepositoryError> {
        let id = Uuid::new_v4().to_string();

        let saved = sqlx::query_as::<_, Image>(
            r#"
            INSERT INTO images (id, name, created_at)
            VALUES ($1, $2, NOW())
            RETURNING id, name
            "#,
        )
        .bind(&id)
        .bind(&image.name)
        .fetch_one(&self.pool)
        .await?;

        debug!(image_id = %saved.id, "Image record saved");
        Ok(saved)
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Image>, RepositoryError> {
        let mut rows = sqlx::query_as::<_, Image>(
            "SELECT id, name FROM images WHERE name = $1 LIMIT 2",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        if rows.len() > 1 {
            return Err(RepositoryError::Ambiguous(name.to_string()));
        }

        Ok(rows.pop())
    }

    #[instrument(skip(self), fields(image_id = %image.id))]
    async fn delete(&self, image: Image) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM images WHERE id = $1")
            .bind(&image.id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// PostgreSQL-backed comment repository
#[derive(Clone)]
pub struct PgCommentRepository {
    pool: PgPool,
}

impl PgCommentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CommentRepository for PgCommentRepository {
    #[instrument(skip(self, comment), fields(image_id = %comment.image_id))]
    async fn save(&self, comment: Comment) -> Result<Comment, RepositoryError> {
        let id = comment
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let saved = sqlx::query_as::<_, Comment>(
            r#"
            INSERT INTO comments (id, image_id, body, created_at)
            VALUES ($1, $2, $3, NOW())
            RETURNING id, image_id, body
            "#,
        )
        .bind(&id)
        .bind(&comment.image_id)
        .bind(&comment.body)
        .fetch_one(&self.pool)
        .await?;

        Ok(saved)
    }

    async fn delete_all(&self) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM comments")
            .execute(&self.pool)
            .await?;

        info!(deleted_count = result.rows_affected(), "Deleted all comments");
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comment_wire_format() {
        let json = r#"{"id": "c1", "imageId": "r1", "comment": "nice shot"}"#;
        let comment: Comment = serde_json::from_str(json).unwrap();

        assert_eq!(comment.id.as_deref(), Some("c1"));
        assert_eq!(comment.image_id, "r1");
        assert_eq!(comment.body, "nice shot");

        let encoded = serde_json::to_value(&comment).unwrap();
        assert_eq!(encoded["imageId"], "r1");
        assert_eq!(encoded["body"], "nice shot");
    }

    #[test]
    fn test_comment_without_id() {
        let comment: Comment =
            serde_json::from_str(r#"{"imageId": "r2", "body": "hello"}"#).unwrap();
        assert!(comment.id.is_none());
    }

    #[test]
    fn test_image_fields() {
        let image = Image::new("id", "filename.jpg");
        assert_eq!(image.id, "id");
        assert_eq!(image.name, "filename.jpg");
    }

    #[tokio::test]
    async fn test_pg_find_all_is_lazy_and_surfaces_connection_errors() {
        let pool = PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(200))
            .connect_lazy("postgres://gallery@127.0.0.1:1/gallery")
            .unwrap();
        let repository = PgImageRepository::new(pool);

        // Building the stream runs no query.
        let mut images = repository.find_all();

        let first = images.next().await;
        assert!(matches!(first, Some(Err(RepositoryError::Database(_)))));
    }
}
