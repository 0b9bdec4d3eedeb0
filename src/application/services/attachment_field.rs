use std::sync::Arc;

use async_trait::async_trait;

use crate::application::services::registry::DepotRegistry;
use crate::application::transactions::attachment_tracker::AttachmentTracker;
use crate::common::clock;
use crate::common::errors::{Result, StorageError};
use crate::domain::entities::attached_file::AttachedFile;
use crate::domain::repositories::payload::{Payload, PayloadSource, UploadIntake};

/// Post-save transform applied to freshly stored attachments.
///
/// Filters run right after the main file has been stored, with the value
/// temporarily thawed so they can annotate it or append derived artifacts
/// to its file list. They never run for values materialized from a row.
#[async_trait]
pub trait AttachmentFilter: Send + Sync {
    async fn on_save(&self, attachment: &mut AttachedFile) -> Result<()>;
}

/// Binds a database column or document property to an [`AttachedFile`].
///
/// The field knows which store new content goes to (a configured name or
/// the registry default), which filters to run after a save, and keeps the
/// transaction tracker informed so that blob lifetimes follow row
/// lifetimes. The resolved store name is persisted inside the value, so
/// files stay reachable even if the default changes later.
#[derive(Default)]
pub struct AttachmentField {
    depot_name: Option<String>,
    filters: Vec<Arc<dyn AttachmentFilter>>,
}

impl AttachmentField {
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets a specific store (or alias) instead of the default.
    pub fn with_depot(mut self, depot_name: impl Into<String>) -> Self {
        self.depot_name = Some(depot_name.into());
        self
    }

    pub fn with_filter(mut self, filter: Arc<dyn AttachmentFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    fn resolve_depot_name(&self) -> Result<String> {
        let name = match self.depot_name.as_deref() {
            Some(name) => name.to_string(),
            None => DepotRegistry::get_default()?,
        };
        DepotRegistry::resolve(&name).ok_or_else(|| {
            StorageError::configuration(format!("storage '{}' has not been found", name))
        })
    }

    /// Stores new content and produces the frozen value to save into the
    /// row. The previous value (if any) is scheduled for deletion on
    /// commit; the new files for deletion on rollback.
    pub async fn assign(
        &self,
        tracker: &AttachmentTracker,
        old: Option<&AttachedFile>,
        payload: Payload,
        filename: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<AttachedFile> {
        let depot_name = self.resolve_depot_name()?;
        let depot = DepotRegistry::get(Some(&depot_name))?;

        // Derive the metadata here so the row record matches what the
        // driver stores.
        let intake = UploadIntake::resolve(payload, filename, content_type)?;
        let (content, filename, content_type) = intake.file_info();
        let payload = match content {
            PayloadSource::Bytes(data) => Payload::Bytes(data),
            PayloadSource::Stream(reader) => Payload::Stream { reader, name: None },
        };
        let file_id = depot
            .create(payload, Some(&filename), Some(&content_type))
            .await?;

        let public_url = depot
            .get(&file_id)
            .await
            .ok()
            .and_then(|f| f.public_url().map(str::to_string));

        let mut value = AttachedFile::new(
            depot_name,
            file_id,
            filename,
            content_type,
            clock::utc_now(),
            public_url,
        );
        self.apply_filters(&mut value).await?;
        value.freeze();

        tracker.swap(old, Some(&value));
        Ok(value)
    }

    /// Accepts an already built value (typically decoded from another row
    /// or produced by `assign`) for this field. The value must target a
    /// store the registry can resolve.
    pub async fn accept(
        &self,
        tracker: &AttachmentTracker,
        old: Option<&AttachedFile>,
        mut value: AttachedFile,
    ) -> Result<AttachedFile> {
        if DepotRegistry::resolve(value.depot_name()).is_none() {
            return Err(StorageError::configuration(format!(
                "storage '{}' has not been found",
                value.depot_name()
            )));
        }
        self.apply_filters(&mut value).await?;
        value.freeze();
        tracker.swap(old, Some(&value));
        Ok(value)
    }

    /// Clears the field: the current files are deleted once the
    /// surrounding transaction commits.
    pub fn on_field_clear(&self, tracker: &AttachmentTracker, old: Option<&AttachedFile>) {
        tracker.swap(old, None);
    }

    /// The owning row was deleted.
    pub fn on_row_delete(&self, tracker: &AttachmentTracker, value: &AttachedFile) {
        tracker.delete(Some(value));
    }

    /// Encodes the value into the single JSON string stored in the row.
    pub fn serialize(&self, value: &AttachedFile) -> Result<String> {
        value.encode()
    }

    /// Decodes a row value back into a frozen AttachedFile.
    pub fn materialize(&self, raw: &str) -> Result<AttachedFile> {
        AttachedFile::decode(raw)
    }

    async fn apply_filters(&self, value: &mut AttachedFile) -> Result<()> {
        if self.filters.is_empty() || !value.has_original_content() {
            return Ok(());
        }
        value.thaw();
        for filter in &self.filters {
            filter.on_save(value).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::services::registry::test_guard;
    use crate::domain::repositories::file_storage::FileStorage;
    use crate::infrastructure::repositories::memory_storage::MemoryFileStorage;

    async fn setup_store(name: &str) -> Arc<MemoryFileStorage> {
        let store = Arc::new(MemoryFileStorage::new());
        DepotRegistry::register_store(name, store.clone()).unwrap();
        store
    }

    #[tokio::test]
    async fn test_assign_creates_and_freezes() {
        let _guard = test_guard();
        DepotRegistry::clear();
        let store = setup_store("field_default").await;

        let field = AttachmentField::new();
        let tracker = AttachmentTracker::new();
        let value = field
            .assign(&tracker, None, b"PAYLOAD"[..].into(), Some("doc.txt"), None)
            .await
            .unwrap();

        assert!(value.is_frozen());
        assert_eq!(value.depot_name(), "field_default");
        assert_eq!(value.filename(), "doc.txt");
        assert_eq!(value.content_type(), "text/plain");
        assert_eq!(
            value.path(),
            format!("field_default/{}", value.file_id())
        );
        assert!(store.exists(value.file_id()).await.unwrap());

        // the new files are scheduled for cleanup on rollback only
        assert_eq!(tracker.pending_rollback_deletes(), value.files());
        assert!(tracker.pending_deletes().is_empty());
    }

    #[tokio::test]
    async fn test_assign_schedules_previous_value() {
        let _guard = test_guard();
        DepotRegistry::clear();
        setup_store("field_swap").await;

        let field = AttachmentField::new();
        let tracker = AttachmentTracker::new();
        let first = field
            .assign(&tracker, None, b"one"[..].into(), None, None)
            .await
            .unwrap();
        let second = field
            .assign(&tracker, Some(&first), b"two"[..].into(), None, None)
            .await
            .unwrap();

        assert_eq!(tracker.pending_deletes(), first.files());
        assert_eq!(tracker.pending_rollback_deletes(), second.files());
    }

    #[tokio::test]
    async fn test_field_pins_configured_store() {
        let _guard = test_guard();
        DepotRegistry::clear();
        setup_store("field_main").await;
        setup_store("field_pinned").await;
        DepotRegistry::alias("field_alias", "field_pinned").unwrap();

        let field = AttachmentField::new().with_depot("field_alias");
        let tracker = AttachmentTracker::new();
        let value = field
            .assign(&tracker, None, b"x"[..].into(), None, None)
            .await
            .unwrap();

        // the alias is resolved and the concrete name persisted
        assert_eq!(value.depot_name(), "field_pinned");
    }

    #[tokio::test]
    async fn test_unknown_store_rejected() {
        let _guard = test_guard();
        DepotRegistry::clear();
        setup_store("field_known").await;

        let field = AttachmentField::new().with_depot("field_unknown");
        let tracker = AttachmentTracker::new();
        let err = field
            .assign(&tracker, None, b"x"[..].into(), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::Configuration);

        // accepting a value targeting an unresolvable store is refused too
        let stray = AttachedFile::new(
            "field_unknown",
            "11111111-2222-1333-8444-555555555555",
            "f.txt",
            "text/plain",
            clock::utc_now(),
            None,
        );
        let err = field.accept(&tracker, None, stray).await.unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_filters_run_once_and_can_add_artifacts() {
        let _guard = test_guard();
        DepotRegistry::clear();
        setup_store("field_filters").await;

        struct Annotate;
        #[async_trait]
        impl AttachmentFilter for Annotate {
            async fn on_save(&self, attachment: &mut AttachedFile) -> Result<()> {
                attachment.set_extra("seen", serde_json::json!(true))?;
                attachment.push_file("field_filters", "22222222-3333-1444-8555-666666666666")
            }
        }

        let field = AttachmentField::new().with_filter(Arc::new(Annotate));
        let tracker = AttachmentTracker::new();
        let value = field
            .assign(&tracker, None, b"x"[..].into(), None, None)
            .await
            .unwrap();
        assert_eq!(value.extra("seen"), Some(&serde_json::json!(true)));
        assert_eq!(value.files().len(), 2);
        assert!(value.is_frozen());

        // a decoded value has no original content: filters must not rerun
        let decoded = field.materialize(&field.serialize(&value).unwrap()).unwrap();
        let accepted = field
            .accept(&tracker, None, decoded)
            .await
            .unwrap();
        assert_eq!(accepted.files().len(), 2);
    }
}
