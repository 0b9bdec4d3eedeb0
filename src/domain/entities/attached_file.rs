use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::application::services::registry::DepotRegistry;
use crate::common::clock::timestamp_format;
use crate::common::errors::{Result, StorageError};
use crate::domain::entities::stored_file::StoredFile;
use crate::domain::repositories::file_storage::FileStorage;

/**
 * The row-side record binding a database entity to stored blobs.
 *
 * An AttachedFile keeps the name of the owning depot, the id and metadata of
 * the main file, and the list of every file path owned by the value (the
 * main file plus derived artifacts added by filters). It serializes to a
 * single JSON object whose unknown keys survive a round-trip.
 *
 * Once the value has been saved into a row it is frozen: every mutator then
 * fails with a `FrozenMutation` error. Never share one AttachedFile between
 * two rows; the transaction tracker schedules deletes per value and cannot
 * know about other rows referencing the same path.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachedFile {
    depot_name: String,
    files: Vec<String>,
    file_id: String,
    path: String,
    filename: String,
    content_type: String,
    #[serde(with = "timestamp_format")]
    uploaded_at: DateTime<Utc>,
    #[serde(
        rename = "_public_url",
        skip_serializing_if = "Option::is_none",
        default
    )]
    public_url: Option<String>,
    /// Unknown keys found while decoding, preserved on re-encode.
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
    #[serde(skip)]
    frozen: bool,
    #[serde(skip)]
    has_original_content: bool,
}

impl AttachedFile {
    /// Builds the record for a freshly created file. The value starts
    /// thawed so that filters can annotate it; freeze it before handing it
    /// to a row.
    pub fn new(
        depot_name: impl Into<String>,
        file_id: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        uploaded_at: DateTime<Utc>,
        public_url: Option<String>,
    ) -> Self {
        let depot_name = depot_name.into();
        let file_id = file_id.into();
        let path = format!("{}/{}", depot_name, file_id);
        Self {
            depot_name,
            files: vec![path.clone()],
            file_id,
            path,
            filename: filename.into(),
            content_type: content_type.into(),
            uploaded_at,
            public_url,
            extra: BTreeMap::new(),
            frozen: false,
            has_original_content: true,
        }
    }

    pub fn depot_name(&self) -> &str {
        &self.depot_name
    }

    /// Every `depot/file_id` path owned by this value.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn uploaded_at(&self) -> DateTime<Utc> {
        self.uploaded_at
    }

    pub fn public_url(&self) -> Option<&str> {
        self.public_url.as_deref()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// True only for values built from fresh content in this process.
    /// Decoded values report false, which keeps filters from re-running.
    pub fn has_original_content(&self) -> bool {
        self.has_original_content
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub(crate) fn thaw(&mut self) {
        self.frozen = false;
    }

    fn check_mutable(&self) -> Result<()> {
        if self.frozen {
            return Err(StorageError::frozen_mutation());
        }
        Ok(())
    }

    /// Registers a derived artifact owned by this value.
    pub fn push_file(&mut self, depot_name: &str, file_id: &str) -> Result<()> {
        self.check_mutable()?;
        self.files.push(format!("{}/{}", depot_name, file_id));
        Ok(())
    }

    /// Sets an extension attribute.
    pub fn set_extra(&mut self, key: impl Into<String>, value: serde_json::Value) -> Result<()> {
        self.check_mutable()?;
        self.extra.insert(key.into(), value);
        Ok(())
    }

    pub fn extra(&self, key: &str) -> Option<&serde_json::Value> {
        self.extra.get(key)
    }

    pub fn set_public_url(&mut self, url: Option<String>) -> Result<()> {
        self.check_mutable()?;
        self.public_url = url;
        Ok(())
    }

    /// Serializes to the single JSON string stored in the row.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            StorageError::configuration("could not encode attached file").with_source(e)
        })
    }

    /// Rebuilds a value from its row representation. The result is frozen
    /// and carries no original content.
    pub fn decode(raw: &str) -> Result<Self> {
        let mut value: AttachedFile = serde_json::from_str(raw).map_err(|e| {
            StorageError::configuration("could not decode attached file").with_source(e)
        })?;
        value.frozen = true;
        value.has_original_content = false;
        Ok(value)
    }

    /// Resolves the driver this value's files live in.
    pub fn depot(&self) -> Result<Arc<dyn FileStorage>> {
        DepotRegistry::get(Some(&self.depot_name))
    }

    /// Fetches the stored file backing this value.
    pub async fn file(&self) -> Result<StoredFile> {
        self.depot()?.get(&self.file_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::clock;

    fn sample_valid() -> AttachedFile {
        AttachedFile::new(
            "default",
            "1f1a9a5e-0000-1000-8000-000000000000",
            "photo.png",
            "image/png",
            clock::parse_timestamp("2024-01-01 00:00:00").unwrap(),
            None,
        )
    }

    #[test]
    fn test_path_and_files_derived() {
        let value = sample_valid();
        assert_eq!(
            value.path(),
            "default/1f1a9a5e-0000-1000-8000-000000000000"
        );
        assert_eq!(value.files(), [value.path().to_string()]);
        assert!(!value.is_frozen());
        assert!(value.has_original_content());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut value = sample_valid();
        value
            .set_extra("thumbnail_id", serde_json::json!("thumb-1"))
            .unwrap();
        value.freeze();

        let encoded = value.encode().unwrap();
        let decoded = AttachedFile::decode(&encoded).unwrap();

        assert!(decoded.is_frozen());
        assert!(!decoded.has_original_content());
        assert_eq!(decoded.depot_name(), value.depot_name());
        assert_eq!(decoded.file_id(), value.file_id());
        assert_eq!(decoded.path(), value.path());
        assert_eq!(decoded.filename(), value.filename());
        assert_eq!(decoded.content_type(), value.content_type());
        assert_eq!(decoded.uploaded_at(), value.uploaded_at());
        assert_eq!(decoded.extra("thumbnail_id"), value.extra("thumbnail_id"));

        // a second round-trip is lossless
        assert_eq!(
            AttachedFile::decode(&decoded.encode().unwrap()).unwrap(),
            decoded
        );
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let raw = r#"{
            "depot_name": "default",
            "files": ["default/abc"],
            "file_id": "abc",
            "path": "default/abc",
            "filename": "f.txt",
            "content_type": "text/plain",
            "uploaded_at": "2024-01-01 00:00:00",
            "legacy_marker": {"nested": true}
        }"#;
        let decoded = AttachedFile::decode(raw).unwrap();
        assert_eq!(
            decoded.extra("legacy_marker"),
            Some(&serde_json::json!({"nested": true}))
        );
        let encoded = decoded.encode().unwrap();
        assert!(encoded.contains("legacy_marker"));
    }

    #[test]
    fn test_frozen_value_rejects_mutation() {
        let mut value = sample_valid();
        value.freeze();
        let err = value.set_extra("k", serde_json::json!(1)).unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::FrozenMutation);
        let err = value.push_file("default", "other").unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::FrozenMutation);
        let err = value.set_public_url(None).unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::FrozenMutation);
    }

    #[test]
    fn test_thawed_value_accepts_derived_files() {
        let mut value = sample_valid();
        value
            .push_file("default", "2f1a9a5e-0000-1000-8000-000000000000")
            .unwrap();
        assert_eq!(value.files().len(), 2);
    }
}
