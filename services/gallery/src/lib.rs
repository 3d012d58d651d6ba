//! Gallery Service
//!
//! Image store and comment ingestion behind one network service.
//!
//! ## Features
//!
//! - **Image Store**: list, stream in, serve and delete named images. Bytes live
//!   under a local upload root, metadata in PostgreSQL (or in memory)
//! - **Comment Ingestion**: consumes comments published to Kafka, persists them
//!   and counts them per image (`comments.consumed{imageId}`)
//! - **Image API**: axum routes for listing, raw download, multipart upload and
//!   deletion, plus health and readiness endpoints
//!
//! ## Architecture
//!
//! ```text
//!  HTTP                        upload-dir/            PostgreSQL
//! ┌──────────────┐           ┌──────────────┐       ┌──────────────┐
//! │ Image API    │──────────▶│ Image        │──────▶│ images       │
//! └──────────────┘           │ Service      │       │ comments     │
//!                            └──────────────┘       └──────────────┘
//!  Kafka                                                   ▲
//! ┌──────────────┐           ┌──────────────┐              │
//! │ comments.new │──────────▶│ Comment      │──────────────┘
//! └──────────────┘           │ Service      │──────▶ comments.consumed
//!                            └──────────────┘
//! ```

pub mod api;
pub mod comment_service;
pub mod config;
pub mod health;
pub mod image_service;
pub mod memory_store;
pub mod messaging;
pub mod metrics_sink;
pub mod repository;
pub mod startup;

pub use api::AppState;
pub use comment_service::{CommentService, IngestOutcome};
pub use config::Config;
pub use health::{HealthProbe, HealthStatus, HttpProbe, ProbeReport};
pub use image_service::{FilePart, FileResource, ImageService, SpooledPart, StoreError};
pub use memory_store::{InMemoryCommentRepository, InMemoryImageRepository};
pub use messaging::{Dispatcher, IncomingMessage, KafkaMessageSource, MessageHandler, Subscription};
pub use metrics_sink::{MetricsSink, RecorderMetricsSink};
pub use repository::{
    Comment, CommentRepository, Image, ImageRepository, NewImage, PgCommentRepository,
    PgImageRepository, RepositoryError,
};
