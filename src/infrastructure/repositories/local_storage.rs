use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::common::config::StorageSettings;
use crate::common::errors::{Result, StorageError};
use crate::domain::entities::stored_file::{FileMetadata, StoredFile};
use crate::domain::repositories::file_storage::{check_file_id, new_file_id, FileStorage};
use crate::domain::repositories::payload::{
    BoxAsyncRead, Payload, PayloadSource, UploadIntake,
};

const PAYLOAD_FILE: &str = "file";
const METADATA_FILE: &str = "metadata.json";

/// Store keeping files on the local filesystem.
///
/// Every file id maps to a directory `{storage_path}/{file_id}` holding the
/// raw payload in `file` and a JSON metadata record in `metadata.json`. The
/// payload is written first and the metadata last, so a reader finding the
/// directory without readable metadata treats the record as absent rather
/// than observing a half-written file.
pub struct LocalFileStorage {
    storage_path: PathBuf,
}

impl LocalFileStorage {
    pub async fn new(storage_path: impl Into<PathBuf>) -> Result<Self> {
        let storage_path = storage_path.into();
        fs::create_dir_all(&storage_path).await.map_err(|e| {
            StorageError::backend(format!(
                "could not create storage root {}",
                storage_path.display()
            ))
            .with_source(e)
        })?;
        Ok(Self { storage_path })
    }

    pub async fn from_settings(settings: &StorageSettings) -> Result<Self> {
        Self::new(settings.require("storage_path")?).await
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    fn local_path(&self, file_id: &str) -> PathBuf {
        self.storage_path.join(file_id)
    }

    async fn read_metadata(&self, file_id: &str) -> Result<FileMetadata> {
        let metadata_path = self.local_path(file_id).join(METADATA_FILE);
        let raw = match fs::read(&metadata_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::not_found(file_id));
            }
            Err(e) => {
                return Err(StorageError::backend(format!(
                    "could not read metadata for file {}",
                    file_id
                ))
                .with_source(e));
            }
        };
        serde_json::from_slice(&raw).map_err(|e| {
            StorageError::backend(format!("invalid metadata for file {}", file_id)).with_source(e)
        })
    }

    async fn save_file(
        &self,
        file_id: &str,
        content: PayloadSource,
        filename: String,
        content_type: String,
    ) -> Result<()> {
        let dir = self.local_path(file_id);
        fs::create_dir_all(&dir).await.map_err(|e| {
            StorageError::backend(format!("could not create directory for file {}", file_id))
                .with_source(e)
        })?;

        let payload_path = dir.join(PAYLOAD_FILE);
        let content_length = match content {
            PayloadSource::Bytes(data) => {
                fs::write(&payload_path, &data).await.map_err(|e| {
                    StorageError::backend(format!("could not write file {}", file_id))
                        .with_source(e)
                })?;
                data.len() as u64
            }
            PayloadSource::Stream(mut reader) => {
                let mut file = fs::File::create(&payload_path).await.map_err(|e| {
                    StorageError::backend(format!("could not write file {}", file_id))
                        .with_source(e)
                })?;
                let written = tokio::io::copy(&mut reader, &mut file).await.map_err(|e| {
                    StorageError::backend(format!("could not write file {}", file_id))
                        .with_source(e)
                })?;
                file.flush().await.map_err(|e| {
                    StorageError::backend(format!("could not flush file {}", file_id))
                        .with_source(e)
                })?;
                written
            }
        };

        let metadata = FileMetadata::new(filename, content_type, content_length);
        let raw = serde_json::to_vec(&metadata).map_err(|e| {
            StorageError::backend(format!("could not encode metadata for file {}", file_id))
                .with_source(e)
        })?;
        fs::write(dir.join(METADATA_FILE), raw).await.map_err(|e| {
            StorageError::backend(format!("could not write metadata for file {}", file_id))
                .with_source(e)
        })?;
        Ok(())
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn create(
        &self,
        payload: Payload,
        filename: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<String> {
        let new_file_id = new_file_id();
        let intake = UploadIntake::resolve(payload, filename, content_type)?;
        let (content, filename, content_type) = intake.file_info();
        self.save_file(&new_file_id, content, filename, content_type)
            .await?;
        Ok(new_file_id)
    }

    async fn get(&self, file_id: &str) -> Result<StoredFile> {
        check_file_id(file_id)?;
        let metadata = self.read_metadata(file_id).await?;
        let payload_path = self.local_path(file_id).join(PAYLOAD_FILE);
        let owned_id = file_id.to_string();
        Ok(StoredFile::new(
            file_id,
            metadata,
            None,
            move || async move {
                let file = fs::File::open(&payload_path).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        StorageError::not_found(&owned_id)
                    } else {
                        StorageError::backend(format!("could not open file {}", owned_id))
                            .with_source(e)
                    }
                })?;
                Ok(Box::pin(file) as BoxAsyncRead)
            },
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

        // The id must already exist; replace is not a way to force a
        // chosen id on creation.
        if !self.exists(file_id).await? {
            return Err(StorageError::not_found(file_id));
        }

        let intake = UploadIntake::resolve(payload, filename, content_type)?;
        let (content, filename, content_type) = if intake.wants_existing_metadata() {
            let existing = self.read_metadata(file_id).await?;
            intake.file_info_or_existing(&existing)
        } else {
            intake.file_info()
        };

        self.delete(file_id).await?;
        self.save_file(file_id, content, filename, content_type)
            .await?;
        Ok(file_id.to_string())
    }

    async fn delete(&self, file_id: &str) -> Result<()> {
        check_file_id(file_id)?;
        if let Err(e) = fs::remove_dir_all(self.local_path(file_id)).await {
            // Missing entries make delete a no-op; anything else is logged
            // and swallowed the same way, the next create will fail loudly.
            tracing::debug!(file_id, error = %e, "suppressed error deleting local file");
        }
        Ok(())
    }

    async fn exists(&self, file_id: &str) -> Result<bool> {
        check_file_id(file_id)?;
        match fs::metadata(self.local_path(file_id)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::backend(format!(
                "could not check existence of file {}",
                file_id
            ))
            .with_source(e)),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.storage_path).await.map_err(|e| {
            StorageError::backend(format!(
                "could not list storage root {}",
                self.storage_path.display()
            ))
            .with_source(e)
        })?;

        let mut file_ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            StorageError::backend("could not list storage root").with_source(e)
        })? {
            if let Some(name) = entry.file_name().to_str() {
                file_ids.push(name.to_string());
            }
        }
        Ok(file_ids)
    }
}
