use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use google_cloud_storage::client::{google_cloud_auth::credentials::CredentialsFile, Client, ClientConfig};
use google_cloud_storage::http::buckets::get::GetBucketRequest;
use google_cloud_storage::http::buckets::insert::InsertBucketRequest;
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::list::ListObjectsRequest;
use google_cloud_storage::http::objects::upload::{UploadObjectRequest, UploadType};
use google_cloud_storage::http::objects::Object;
use google_cloud_storage::http::Error as GcsError;
use google_cloud_storage::sign::{SignedURLMethod, SignedURLOptions};

use crate::common::clock;
use crate::common::config::{AccessPolicy, StorageSettings};
use crate::common::disposition::{
    make_content_disposition, percent_decode_filename, percent_encode_filename,
};
use crate::common::errors::{Result, StorageError};
use crate::domain::entities::stored_file::{FileMetadata, StoredFile};
use crate::domain::repositories::file_storage::{check_file_id, new_file_id, FileStorage};
use crate::domain::repositories::payload::{BoxAsyncRead, Payload, UploadIntake};

const METADATA_FILENAME: &str = "x-depot-filename";
const METADATA_MODIFIED: &str = "x-depot-modified";

const PUBLIC_STORAGE_HOST: &str = "https://storage.googleapis.com";

/// V4 signing ceiling, same as SigV4.
const SIGNED_URL_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Options accepted by the GCS store.
#[derive(Debug, Clone)]
pub struct GcsOptions {
    pub project_id: Option<String>,
    pub credentials: Option<String>,
    pub bucket: String,
    pub policy: AccessPolicy,
    pub prefix: String,
    pub endpoint: Option<String>,
}

impl GcsOptions {
    pub fn from_settings(settings: &StorageSettings) -> Result<Self> {
        Ok(Self {
            project_id: settings.get("project_id").map(str::to_string),
            credentials: settings
                .get_or_env("credentials", "GOOGLE_APPLICATION_CREDENTIALS"),
            bucket: settings.require("bucket")?.to_string(),
            policy: AccessPolicy::from_settings(settings)?,
            prefix: settings.get("prefix").unwrap_or_default().to_string(),
            endpoint: settings
                .get("endpoint")
                .map(str::to_string)
                .or_else(|| std::env::var("STORAGE_EMULATOR_HOST").ok()),
        })
    }
}

/// Store keeping files as objects in a Google Cloud Storage bucket.
///
/// Key scheme and metadata mirror the S3 store: objects live at
/// `{prefix}{file_id}`, the filename travels percent-encoded in
/// `x-depot-filename`, the write timestamp in `x-depot-modified`, and the
/// content type and Content-Disposition use the native object fields.
pub struct GcsStorage {
    client: Client,
    bucket: String,
    prefix: String,
    policy: AccessPolicy,
    endpoint: Option<String>,
}

impl GcsStorage {
    pub async fn new(options: GcsOptions) -> Result<Self> {
        let mut config = match &options.credentials {
            Some(path) => {
                let credentials = CredentialsFile::new_from_file(path.clone())
                    .await
                    .map_err(|e| {
                        StorageError::configuration(format!(
                            "could not load credentials file {}",
                            path
                        ))
                        .with_source(e)
                    })?;
                ClientConfig::default()
                    .with_credentials(credentials)
                    .await
                    .map_err(|e| {
                        StorageError::configuration("invalid service account credentials")
                            .with_source(e)
                    })?
            }
            // Emulators take unauthenticated clients; everything else is
            // expected to carry credentials.
            None => ClientConfig::default().anonymous(),
        };
        if let Some(endpoint) = &options.endpoint {
            config.storage_endpoint = endpoint.clone();
        }
        tracing::debug!(
            bucket = %options.bucket,
            project_id = options.project_id.as_deref().unwrap_or("<default>"),
            "creating gcs storage client"
        );

        let storage = Self {
            client: Client::new(config),
            bucket: options.bucket,
            prefix: options.prefix,
            policy: options.policy,
            endpoint: options.endpoint,
        };
        storage.ensure_bucket().await?;
        Ok(storage)
    }

    pub async fn from_settings(settings: &StorageSettings) -> Result<Self> {
        Self::new(GcsOptions::from_settings(settings)?).await
    }

    fn key(&self, file_id: &str) -> String {
        format!("{}{}", self.prefix, file_id)
    }

    async fn ensure_bucket(&self) -> Result<()> {
        let found = self
            .client
            .get_bucket(&GetBucketRequest {
                bucket: self.bucket.clone(),
                ..Default::default()
            })
            .await;
        match found {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                tracing::info!(bucket = %self.bucket, "creating missing bucket");
                self.client
                    .insert_bucket(&InsertBucketRequest {
                        name: self.bucket.clone(),
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| {
                        StorageError::backend(format!(
                            "could not create bucket {}",
                            self.bucket
                        ))
                        .with_source(e)
                    })?;
                Ok(())
            }
            Err(e) => Err(StorageError::backend(format!(
                "could not check bucket {}",
                self.bucket
            ))
            .with_source(e)),
        }
    }

    async fn object(&self, file_id: &str) -> Result<Option<Object>> {
        let found = self
            .client
            .get_object(&GetObjectRequest {
                bucket: self.bucket.clone(),
                object: self.key(file_id),
                ..Default::default()
            })
            .await;
        match found {
            Ok(object) => Ok(Some(object)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(StorageError::backend(format!(
                "could not fetch metadata for file {}",
                file_id
            ))
            .with_source(e)),
        }
    }

    fn metadata_from_object(&self, object: &Object) -> FileMetadata {
        let user_metadata = object.metadata.as_ref();
        let filename = user_metadata
            .and_then(|m| m.get(METADATA_FILENAME))
            .map(|v| percent_decode_filename(v))
            .unwrap_or_else(|| UploadIntake::DEFAULT_NAME.to_string());
        let last_modified = user_metadata
            .and_then(|m| m.get(METADATA_MODIFIED))
            .and_then(|v| clock::parse_timestamp(v))
            .or_else(|| {
                object
                    .updated
                    .and_then(|t| chrono::DateTime::from_timestamp(t.unix_timestamp(), 0))
            })
            .unwrap_or_default();
        FileMetadata {
            filename,
            content_type: object
                .content_type
                .clone()
                .unwrap_or_else(|| UploadIntake::DEFAULT_CONTENT_TYPE.to_string()),
            content_length: object.size.max(0) as u64,
            last_modified,
        }
    }

    async fn save_file(
        &self,
        file_id: &str,
        data: Vec<u8>,
        filename: &str,
        content_type: &str,
    ) -> Result<()> {
        let mut user_metadata = HashMap::new();
        user_metadata.insert(
            METADATA_FILENAME.to_string(),
            percent_encode_filename(filename),
        );
        user_metadata.insert(METADATA_MODIFIED.to_string(), clock::timestamp());

        let upload_type = UploadType::Multipart(Box::new(Object {
            name: self.key(file_id),
            content_type: Some(content_type.to_string()),
            content_disposition: Some(make_content_disposition("inline", filename)),
            metadata: Some(user_metadata),
            ..Default::default()
        }));
        self.client
            .upload_object(
                &UploadObjectRequest {
                    bucket: self.bucket.clone(),
                    ..Default::default()
                },
                data,
                &upload_type,
            )
            .await
            .map_err(|e| {
                StorageError::backend(format!("could not upload file {}", file_id)).with_source(e)
            })?;
        Ok(())
    }

    async fn public_url(&self, file_id: &str) -> Option<String> {
        match self.policy {
            AccessPolicy::PublicRead => {
                let base = self.endpoint.as_deref().unwrap_or(PUBLIC_STORAGE_HOST);
                Some(format!("{}/{}/{}", base, self.bucket, self.key(file_id)))
            }
            AccessPolicy::Private => {
                let signed = self
                    .client
                    .signed_url(
                        &self.bucket,
                        &self.key(file_id),
                        None,
                        None,
                        SignedURLOptions {
                            method: SignedURLMethod::GET,
                            expires: SIGNED_URL_TTL,
                            ..Default::default()
                        },
                    )
                    .await;
                match signed {
                    Ok(url) => Some(url),
                    Err(e) => {
                        tracing::warn!(file_id, error = %e, "could not sign object url");
                        None
                    }
                }
            }
        }
    }
}

fn is_not_found(error: &GcsError) -> bool {
    matches!(error, GcsError::Response(response) if response.code == 404)
}

#[async_trait]
impl FileStorage for GcsStorage {
    fn backend(&self) -> &'static str {
        "gcs"
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
        let data = content
            .into_bytes()
            .await
            .map_err(|e| StorageError::backend("could not buffer payload").with_source(e))?;
        self.save_file(&new_file_id, data.to_vec(), &filename, &content_type)
            .await?;
        Ok(new_file_id)
    }

    async fn get(&self, file_id: &str) -> Result<StoredFile> {
        check_file_id(file_id)?;
        let object = self
            .object(file_id)
            .await?
            .ok_or_else(|| StorageError::not_found(file_id))?;
        let metadata = self.metadata_from_object(&object);
        let public_url = self.public_url(file_id).await;

        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = self.key(file_id);
        let owned_id = file_id.to_string();
        Ok(StoredFile::new(
            file_id,
            metadata,
            public_url,
            move || async move {
                let data = client
                    .download_object(
                        &GetObjectRequest {
                            bucket,
                            object: key,
                            ..Default::default()
                        },
                        &Range::default(),
                    )
                    .await
                    .map_err(|e| {
                        if is_not_found(&e) {
                            StorageError::not_found(&owned_id)
                        } else {
                            StorageError::backend(format!("could not open file {}", owned_id))
                                .with_source(e)
                        }
                    })?;
                Ok(Box::pin(std::io::Cursor::new(data)) as BoxAsyncRead)
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
        let object = self
            .object(file_id)
            .await?
            .ok_or_else(|| StorageError::not_found(file_id))?;

        let intake = UploadIntake::resolve(payload, filename, content_type)?;
        let (content, filename, content_type) = if intake.wants_existing_metadata() {
            let existing = self.metadata_from_object(&object);
            intake.file_info_or_existing(&existing)
        } else {
            intake.file_info()
        };
        let data = content
            .into_bytes()
            .await
            .map_err(|e| StorageError::backend("could not buffer payload").with_source(e))?;
        self.save_file(file_id, data.to_vec(), &filename, &content_type)
            .await?;
        Ok(file_id.to_string())
    }

    async fn delete(&self, file_id: &str) -> Result<()> {
        check_file_id(file_id)?;
        let deleted = self
            .client
            .delete_object(&DeleteObjectRequest {
                bucket: self.bucket.clone(),
                object: self.key(file_id),
                ..Default::default()
            })
            .await;
        match deleted {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(StorageError::backend(format!(
                "could not delete file {}",
                file_id
            ))
            .with_source(e)),
        }
    }

    async fn exists(&self, file_id: &str) -> Result<bool> {
        check_file_id(file_id)?;
        Ok(self.object(file_id).await?.is_some())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut file_ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let response = self
                .client
                .list_objects(&ListObjectsRequest {
                    bucket: self.bucket.clone(),
                    prefix: Some(self.prefix.clone()),
                    page_token: page_token.clone(),
                    ..Default::default()
                })
                .await
                .map_err(|e| {
                    StorageError::backend(format!("could not list bucket {}", self.bucket))
                        .with_source(e)
                })?;
            for object in response.items.unwrap_or_default() {
                let id = object
                    .name
                    .strip_prefix(&self.prefix)
                    .unwrap_or(&object.name)
                    .to_string();
                file_ids.push(id);
            }
            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        Ok(file_ids)
    }
}
