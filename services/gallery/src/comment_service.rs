use crate::messaging::{ConsumerError, IncomingMessage, MessageHandler};
use crate::metrics_sink::MetricsSink;
use crate::repository::{Comment, CommentRepository};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, instrument};

/// Counter incremented once per persisted comment
pub const COMMENTS_CONSUMED: &str = "comments.consumed";
/// Label carrying the commented image's id
pub const IMAGE_ID_TAG: &str = "imageId";

/// How a single ingestion attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Saved and counted
    Counted { image_id: String },
    /// Save failed; logged only
    Dropped,
}

/// Persists inbound comments and counts them per image
pub struct CommentService {
    repository: Arc<dyn CommentRepository>,
    metrics: Arc<dyn MetricsSink>,
}

impl CommentService {
    pub fn new(repository: Arc<dyn CommentRepository>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            repository,
            metrics,
        }
    }

    /// Save `comment`, then increment the per-image counter.
    ///
    /// A failed save is logged and emits nothing. The referenced image is not
    /// checked for existence.
    #[instrument(skip(self, comment), fields(image_id = %comment.image_id))]
    pub async fn ingest(&self, comment: Comment) -> IngestOutcome {
        match self.repository.save(comment).await {
            Ok(saved) => {
                self.metrics
                    .increment_counter(COMMENTS_CONSUMED, IMAGE_ID_TAG, &saved.image_id);
                debug!(comment_id = ?saved.id, "Comment saved");
                IngestOutcome::Counted {
                    image_id: saved.image_id,
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to save comment");
                IngestOutcome::Dropped
            }
        }
    }
}

#[async_trait]
impl MessageHandler for CommentService {
    async fn handle(&self, message: &IncomingMessage) -> Result<(), ConsumerError> {
        let comment: Comment = message.decode_json()?;
        self.ingest(comment).await;
        Ok(())
    }
}
