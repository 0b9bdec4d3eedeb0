// Core modules of the crate
pub mod common;
pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod interfaces;

// Common public re-exports
pub use common::errors::{ErrorKind, Result, StorageError};
pub use common::config::{AccessPolicy, StorageSettings, DEFAULT_CONFIG_PREFIX};
pub use domain::entities::stored_file::{FileMetadata, StoredFile};
pub use domain::entities::attached_file::AttachedFile;
pub use domain::repositories::file_storage::FileStorage;
pub use domain::repositories::payload::{FileIntent, FileUpload, Payload};
pub use application::services::registry::DepotRegistry;
pub use application::services::attachment_field::{AttachmentField, AttachmentFilter};
pub use application::transactions::attachment_tracker::{
    AttachmentDelta, AttachmentTracker, UnitOfWorkHooks,
};
pub use infrastructure::repositories::local_storage::LocalFileStorage;
pub use infrastructure::repositories::memory_storage::MemoryFileStorage;
#[cfg(feature = "s3")]
pub use infrastructure::repositories::s3_storage::S3Storage;
#[cfg(feature = "gcs")]
pub use infrastructure::repositories::gcs_storage::GcsStorage;
#[cfg(feature = "gridfs")]
pub use infrastructure::repositories::gridfs_storage::GridFsStorage;
pub use interfaces::middleware::serve::{serve_depot, DepotServing};
