pub mod local_storage;
pub mod memory_storage;

#[cfg(feature = "s3")]
pub mod s3_storage;

#[cfg(feature = "gcs")]
pub mod gcs_storage;

#[cfg(feature = "gridfs")]
pub mod gridfs_storage;
