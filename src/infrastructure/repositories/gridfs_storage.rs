use async_trait::async_trait;
use futures::io::AsyncWriteExt;
use futures::TryStreamExt;
use mongodb::bson::{doc, oid::ObjectId, Bson, Document};
use mongodb::gridfs::{FilesCollectionDocument, GridFsBucket};
use mongodb::options::{GridFsBucketOptions, GridFsUploadOptions};
use mongodb::Client;
use tokio_util::compat::FuturesAsyncReadCompatExt;

use crate::common::clock;
use crate::common::config::StorageSettings;
use crate::common::errors::{Result, StorageError};
use crate::domain::entities::stored_file::{FileMetadata, StoredFile};
use crate::domain::repositories::file_storage::FileStorage;
use crate::domain::repositories::payload::{BoxAsyncRead, Payload, UploadIntake};

const DEFAULT_COLLECTION: &str = "filedepot";

/// Options accepted by the GridFS store.
#[derive(Debug, Clone)]
pub struct GridFsOptions {
    pub mongouri: String,
    pub collection: String,
}

impl GridFsOptions {
    pub fn from_settings(settings: &StorageSettings) -> Result<Self> {
        Ok(Self {
            mongouri: settings.require("mongouri")?.to_string(),
            collection: settings
                .get("collection")
                .unwrap_or(DEFAULT_COLLECTION)
                .to_string(),
        })
    }
}

/// Store keeping files in MongoDB through its chunked-file facility.
///
/// File ids are the native 12-byte ObjectId rendered as hex. Content type
/// and write timestamp travel in the files-collection metadata document.
///
/// Replace is delete-then-insert under the same id: a concurrent reader in
/// that window observes `NotFound`. That window is part of this store's
/// contract.
pub struct GridFsStorage {
    bucket: GridFsBucket,
}

impl GridFsStorage {
    pub async fn new(options: GridFsOptions) -> Result<Self> {
        let client = Client::with_uri_str(&options.mongouri).await.map_err(|e| {
            StorageError::configuration("could not connect to mongodb").with_source(e)
        })?;
        let database = client.default_database().ok_or_else(|| {
            StorageError::configuration("mongouri must name a database")
        })?;
        let bucket = database.gridfs_bucket(
            GridFsBucketOptions::builder()
                .bucket_name(options.collection)
                .build(),
        );
        Ok(Self { bucket })
    }

    pub async fn from_settings(settings: &StorageSettings) -> Result<Self> {
        Self::new(GridFsOptions::from_settings(settings)?).await
    }

    async fn find_document(&self, id: ObjectId) -> Result<Option<FilesCollectionDocument>> {
        let mut cursor = self
            .bucket
            .find(doc! { "_id": id }, None)
            .await
            .map_err(|e| {
                StorageError::backend(format!("could not query file {}", id)).with_source(e)
            })?;
        cursor.try_next().await.map_err(|e| {
            StorageError::backend(format!("could not query file {}", id)).with_source(e)
        })
    }

    fn metadata_from_document(&self, document: &FilesCollectionDocument) -> FileMetadata {
        let metadata: Option<&Document> = document.metadata.as_ref();
        let content_type = metadata
            .and_then(|m| m.get_str("contentType").ok())
            .unwrap_or(UploadIntake::DEFAULT_CONTENT_TYPE)
            .to_string();
        let last_modified = metadata
            .and_then(|m| m.get_str("lastModified").ok())
            .and_then(clock::parse_timestamp)
            .or_else(|| {
                chrono::DateTime::from_timestamp_millis(document.upload_date.timestamp_millis())
            })
            .unwrap_or_default();
        FileMetadata {
            filename: document
                .filename
                .clone()
                .unwrap_or_else(|| UploadIntake::DEFAULT_NAME.to_string()),
            content_type,
            content_length: document.length,
            last_modified,
        }
    }

    async fn save_file(
        &self,
        id: ObjectId,
        data: &[u8],
        filename: &str,
        content_type: &str,
    ) -> Result<()> {
        let options = GridFsUploadOptions::builder()
            .metadata(doc! {
                "contentType": content_type,
                "lastModified": clock::timestamp(),
            })
            .build();
        let mut stream = self
            .bucket
            .open_upload_stream_with_id(Bson::ObjectId(id), filename, options);
        stream.write_all(data).await.map_err(|e| {
            StorageError::backend(format!("could not upload file {}", id)).with_source(e)
        })?;
        stream.close().await.map_err(|e| {
            StorageError::backend(format!("could not finish upload of file {}", id))
                .with_source(e)
        })?;
        Ok(())
    }
}

/// Validates a GridFS file id. ObjectId hex can never escape the store
/// namespace; anything else fails with `InvalidId`.
fn check_object_id(file_id: &str) -> Result<ObjectId> {
    ObjectId::parse_str(file_id).map_err(|_| StorageError::invalid_id(file_id))
}

#[async_trait]
impl FileStorage for GridFsStorage {
    fn backend(&self) -> &'static str {
        "gridfs"
    }

    async fn create(
        &self,
        payload: Payload,
        filename: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<String> {
        let id = ObjectId::new();
        let intake = UploadIntake::resolve(payload, filename, content_type)?;
        let (content, filename, content_type) = intake.file_info();
        let data = content
            .into_bytes()
            .await
            .map_err(|e| StorageError::backend("could not buffer payload").with_source(e))?;
        self.save_file(id, &data, &filename, &content_type).await?;
        Ok(id.to_hex())
    }

    async fn get(&self, file_id: &str) -> Result<StoredFile> {
        let id = check_object_id(file_id)?;
        let document = self
            .find_document(id)
            .await?
            .ok_or_else(|| StorageError::not_found(file_id))?;
        let metadata = self.metadata_from_document(&document);

        let bucket = self.bucket.clone();
        let owned_id = file_id.to_string();
        Ok(StoredFile::new(
            file_id,
            metadata,
            None,
            move || async move {
                let stream = bucket
                    .open_download_stream(Bson::ObjectId(id))
                    .await
                    .map_err(|e| {
                        StorageError::backend(format!("could not open file {}", owned_id))
                            .with_source(e)
                    })?;
                Ok(Box::pin(stream.compat()) as BoxAsyncRead)
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
        let id = check_object_id(file_id)?;
        let document = self
            .find_document(id)
            .await?
            .ok_or_else(|| StorageError::not_found(file_id))?;

        let intake = UploadIntake::resolve(payload, filename, content_type)?;
        let (content, filename, content_type) = if intake.wants_existing_metadata() {
            let existing = self.metadata_from_document(&document);
            intake.file_info_or_existing(&existing)
        } else {
            intake.file_info()
        };
        let data = content
            .into_bytes()
            .await
            .map_err(|e| StorageError::backend("could not buffer payload").with_source(e))?;

        self.delete(file_id).await?;
        self.save_file(id, &data, &filename, &content_type).await?;
        Ok(file_id.to_string())
    }

    async fn delete(&self, file_id: &str) -> Result<()> {
        let id = check_object_id(file_id)?;
        match self.bucket.delete(Bson::ObjectId(id)).await {
            Ok(()) => Ok(()),
            // The driver reports deleting a missing file as a GridFS error;
            // delete is idempotent here.
            Err(e) if matches!(*e.kind, mongodb::error::ErrorKind::GridFs(_)) => {
                tracing::debug!(file_id, "delete of absent gridfs file ignored");
                Ok(())
            }
            Err(e) => Err(StorageError::backend(format!(
                "could not delete file {}",
                file_id
            ))
            .with_source(e)),
        }
    }

    async fn exists(&self, file_id: &str) -> Result<bool> {
        let id = check_object_id(file_id)?;
        Ok(self.find_document(id).await?.is_some())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut cursor = self.bucket.find(doc! {}, None).await.map_err(|e| {
            StorageError::backend("could not list gridfs files").with_source(e)
        })?;
        let mut file_ids = Vec::new();
        while let Some(document) = cursor.try_next().await.map_err(|e| {
            StorageError::backend("could not list gridfs files").with_source(e)
        })? {
            if let Bson::ObjectId(id) = document.id {
                file_ids.push(id.to_hex());
            }
        }
        Ok(file_ids)
    }
}
