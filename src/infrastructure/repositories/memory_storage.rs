use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use crate::common::errors::{Result, StorageError};
use crate::domain::entities::stored_file::{FileMetadata, StoredFile};
use crate::domain::repositories::file_storage::{check_file_id, new_file_id, FileStorage};
use crate::domain::repositories::payload::{BoxAsyncRead, Payload, UploadIntake};

#[derive(Clone)]
struct MemoryEntry {
    data: Bytes,
    metadata: FileMetadata,
}

/// Store keeping files in memory. Useful for caches and tests.
#[derive(Clone, Default)]
pub struct MemoryFileStorage {
    files: Arc<RwLock<HashMap<String, MemoryEntry>>>,
}

impl MemoryFileStorage {
    pub fn new() -> Self {
        Self::default()
    }

    async fn save_file(
        &self,
        file_id: &str,
        intake: UploadIntake,
        existing: Option<&FileMetadata>,
    ) -> Result<()> {
        let (content, filename, content_type) = match existing {
            Some(existing) => intake.file_info_or_existing(existing),
            None => intake.file_info(),
        };
        let data = content
            .into_bytes()
            .await
            .map_err(|e| StorageError::backend("could not read payload").with_source(e))?;
        let metadata = FileMetadata::new(filename, content_type, data.len() as u64);
        self.files
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(file_id.to_string(), MemoryEntry { data, metadata });
        Ok(())
    }

    fn entry(&self, file_id: &str) -> Option<MemoryEntry> {
        self.files
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(file_id)
            .cloned()
    }
}

#[async_trait]
impl FileStorage for MemoryFileStorage {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn create(
        &self,
        payload: Payload,
        filename: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<String> {
        let new_file_id = new_file_id();
        let intake = UploadIntake::resolve(payload, filename, content_type)?;
        self.save_file(&new_file_id, intake, None).await?;
        Ok(new_file_id)
    }

    async fn get(&self, file_id: &str) -> Result<StoredFile> {
        check_file_id(file_id)?;
        let entry = self
            .entry(file_id)
            .ok_or_else(|| StorageError::not_found(file_id))?;
        let data = entry.data.clone();
        Ok(StoredFile::new(
            file_id,
            entry.metadata,
            None,
            move || async move { Ok(Box::pin(std::io::Cursor::new(data)) as BoxAsyncRead) },
        ))
    }

    async fn replace(
        &self,
        file_id: &str,
        payload: Payload,
        filename: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<String> {
        check_file_id(file_id)?;
        let existing = self
            .entry(file_id)
            .ok_or_else(|| StorageError::not_found(file_id))?;
        let intake = UploadIntake::resolve(payload, filename, content_type)?;
        self.save_file(file_id, intake, Some(&existing.metadata))
            .await?;
        Ok(file_id.to_string())
    }

    async fn delete(&self, file_id: &str) -> Result<()> {
        check_file_id(file_id)?;
        self.files
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(file_id);
        Ok(())
    }

    async fn exists(&self, file_id: &str) -> Result<bool> {
        check_file_id(file_id)?;
        Ok(self
            .files
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(file_id))
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .files
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let fs = MemoryFileStorage::new();
        let file_id = fs
            .create(b"HELLO"[..].into(), Some("f.txt"), Some("text/plain"))
            .await
            .unwrap();

        let mut file = fs.get(&file_id).await.unwrap();
        assert_eq!(file.read_to_end().await.unwrap().as_ref(), b"HELLO");
        assert_eq!(file.filename(), "f.txt");
        assert_eq!(file.content_type(), "text/plain");
        assert_eq!(file.content_length(), 5);
    }

    #[tokio::test]
    async fn test_replace_preserves_id() {
        let fs = MemoryFileStorage::new();
        let file_id = fs.create(b"A"[..].into(), Some("a.bin"), None).await.unwrap();
        let replaced = fs
            .replace(&file_id, b"B"[..].into(), Some("b.png"), None)
            .await
            .unwrap();
        assert_eq!(replaced, file_id);

        let mut file = fs.get(&file_id).await.unwrap();
        assert_eq!(file.read_to_end().await.unwrap().as_ref(), b"B");
        assert_eq!(file.content_type(), "image/png");
    }

    #[tokio::test]
    async fn test_replace_missing_fails() {
        let fs = MemoryFileStorage::new();
        let err = fs
            .replace(&new_file_id(), b"B"[..].into(), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_delete_idempotent_and_exists() {
        let fs = MemoryFileStorage::new();
        let file_id = fs.create(b"X"[..].into(), None, None).await.unwrap();
        assert!(fs.exists(&file_id).await.unwrap());
        fs.delete(&file_id).await.unwrap();
        fs.delete(&file_id).await.unwrap();
        assert!(!fs.exists(&file_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_id_discrimination() {
        let fs = MemoryFileStorage::new();
        assert_eq!(
            fs.get("not-an-id").await.unwrap_err().kind,
            crate::ErrorKind::InvalidId
        );
        assert_eq!(
            fs.get(&new_file_id()).await.unwrap_err().kind,
            crate::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_list() {
        let fs = MemoryFileStorage::new();
        let a = fs.create(b"a"[..].into(), None, None).await.unwrap();
        let b = fs.create(b"b"[..].into(), None, None).await.unwrap();
        let mut listed = fs.list().await.unwrap();
        listed.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(listed, expected);
    }
}
