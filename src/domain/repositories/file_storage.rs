use async_trait::async_trait;
use once_cell::sync::Lazy;
use uuid::Uuid;

use crate::common::errors::{Result, StorageError};
use crate::domain::entities::stored_file::StoredFile;
use crate::domain::repositories::payload::Payload;

/// Contract every storage backend satisfies.
///
/// The crate treats backends as interchangeable: anything implementing this
/// trait can be registered as a store, served over HTTP and referenced by
/// attachments. Operations accept ids as strings; a `StoredFile` exposes its
/// own id through [`StoredFile::file_id`] for call sites holding a handle.
#[async_trait]
pub trait FileStorage: Send + Sync + 'static {
    /// Short backend identifier used in logs and diagnostics.
    fn backend(&self) -> &'static str;

    /// Saves a new file and returns its fresh, never-before-used id.
    ///
    /// Filename and content type are derived deterministically from the
    /// explicit arguments and the payload; see
    /// [`UploadIntake`](crate::domain::repositories::payload::UploadIntake).
    async fn create(
        &self,
        payload: Payload,
        filename: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<String>;

    /// Opens the file given by its unique id.
    ///
    /// Fails with `NotFound` for absent ids and `InvalidId` for malformed
    /// ones; the two are distinct so callers can tell configuration
    /// mistakes from missing files.
    async fn get(&self, file_id: &str) -> Result<StoredFile>;

    /// Replaces the content and metadata of an existing file, keeping its
    /// id. The id must already exist; replace cannot be used to force a
    /// chosen id into existence.
    async fn replace(
        &self,
        file_id: &str,
        payload: Payload,
        filename: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<String>;

    /// Deletes the file. Idempotent: deleting an absent id succeeds.
    async fn delete(&self, file_id: &str) -> Result<()>;

    /// Tells whether the id currently resolves to a stored file.
    async fn exists(&self, file_id: &str) -> Result<bool>;

    /// Lists the ids stored under this store's namespace. Backends that
    /// cannot enumerate keep the default implementation.
    async fn list(&self) -> Result<Vec<String>> {
        Err(StorageError::configuration(format!(
            "the {} backend does not support listing",
            self.backend()
        )))
    }
}

static NODE_ID: Lazy<[u8; 6]> = Lazy::new(rand::random);

/// Generates a fresh file id: a time-based UUID mixing the timestamp with a
/// per-process node id, rendered in canonical hyphenated form.
pub fn new_file_id() -> String {
    Uuid::now_v1(&NODE_ID).hyphenated().to_string()
}

/// Validates a UUID file id.
///
/// Only hexadecimal digits and hyphens are accepted, which also guarantees
/// an id can never escape the store namespace (no separators, no dot
/// segments). Malformed input fails with `InvalidId`.
pub fn check_file_id(file_id: &str) -> Result<()> {
    let well_formed = file_id.len() <= 36
        && !file_id.is_empty()
        && file_id
            .bytes()
            .all(|b| b.is_ascii_hexdigit() || b == b'-');
    if !well_formed {
        return Err(StorageError::invalid_id(file_id));
    }
    Uuid::parse_str(file_id)
        .map(|_| ())
        .map_err(|_| StorageError::invalid_id(file_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ids_are_canonical_and_unique() {
        let a = new_file_id();
        let b = new_file_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
        assert!(check_file_id(&a).is_ok());
        assert!(check_file_id(&b).is_ok());
    }

    #[test]
    fn test_malformed_ids_rejected() {
        for bad in [
            "",
            "not-an-id",
            "../../../etc/passwd",
            "fake_file_id",
            "1234",
            "urn:uuid:1f1a9a5e-0000-1000-8000-000000000000",
            "{1f1a9a5e-0000-1000-8000-000000000000}",
        ] {
            let err = check_file_id(bad).unwrap_err();
            assert_eq!(err.kind, crate::ErrorKind::InvalidId, "id: {}", bad);
        }
    }

    #[test]
    fn test_valid_id_accepted() {
        assert!(check_file_id("1f1a9a5e-0000-1000-8000-000000000000").is_ok());
    }
}
