use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CreateBucketConfiguration, ObjectCannedAcl, ServerSideEncryption,
    StorageClass,
};
use aws_sdk_s3::Client;

use crate::common::clock;
use crate::common::config::{AccessPolicy, StorageSettings};
use crate::common::disposition::{
    make_content_disposition, percent_decode_filename, percent_encode_filename,
};
use crate::common::errors::{Result, StorageError};
use crate::domain::entities::stored_file::{FileMetadata, StoredFile};
use crate::domain::repositories::file_storage::{check_file_id, new_file_id, FileStorage};
use crate::domain::repositories::payload::{
    BoxAsyncRead, Payload, SpooledPayload, UploadIntake,
};

const METADATA_FILENAME: &str = "x-depot-filename";
const METADATA_MODIFIED: &str = "x-depot-modified";

/// SigV4 ceiling for presigned URLs.
const SIGNED_URL_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Options accepted by the S3 store.
#[derive(Debug, Clone)]
pub struct S3Options {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    pub region_name: Option<String>,
    pub endpoint_url: Option<String>,
    pub policy: AccessPolicy,
    pub storage_class: Option<String>,
    pub prefix: String,
    pub encrypt_key: bool,
    pub create_bucket: bool,
}

impl S3Options {
    /// Reads options from store settings, falling back to the provider's
    /// standard environment variables for credentials and endpoint.
    pub fn from_settings(settings: &StorageSettings) -> Result<Self> {
        let access_key_id = settings
            .get_or_env("access_key_id", "AWS_ACCESS_KEY_ID")
            .ok_or_else(|| StorageError::configuration("missing setting 'access_key_id'"))?;
        let secret_access_key = settings
            .get_or_env("secret_access_key", "AWS_SECRET_ACCESS_KEY")
            .ok_or_else(|| StorageError::configuration("missing setting 'secret_access_key'"))?;
        Ok(Self {
            access_key_id,
            secret_access_key,
            bucket: settings.require("bucket")?.to_string(),
            region_name: settings.get_or_env("region_name", "AWS_REGION"),
            endpoint_url: settings
                .get("endpoint_url")
                .or_else(|| settings.get("host"))
                .map(str::to_string)
                .or_else(|| std::env::var("AWS_ENDPOINT_URL").ok()),
            policy: AccessPolicy::from_settings(settings)?,
            storage_class: settings.get("storage_class").map(str::to_string),
            prefix: settings.get("prefix").unwrap_or_default().to_string(),
            encrypt_key: flag(settings.get("encrypt_key")),
            create_bucket: settings
                .get("create_bucket")
                .map(|v| flag(Some(v)))
                .unwrap_or(true),
        })
    }
}

fn flag(value: Option<&str>) -> bool {
    matches!(value, Some("true") | Some("1") | Some("yes"))
}

/// Store keeping files as objects in an S3 bucket.
///
/// Each file id maps to the object `{prefix}{file_id}`. The original
/// filename travels percent-encoded in the `x-depot-filename` user-metadata
/// key and the write timestamp in `x-depot-modified`; the content type uses
/// the native MIME field and Content-Disposition is fixed at upload time.
pub struct S3Storage {
    client: Client,
    bucket: String,
    prefix: String,
    policy: AccessPolicy,
    storage_class: Option<StorageClass>,
    encrypt: bool,
}

impl S3Storage {
    pub async fn new(options: S3Options) -> Result<Self> {
        let region = Region::new(
            options
                .region_name
                .clone()
                .unwrap_or_else(|| "us-east-1".to_string()),
        );
        let credentials = Credentials::new(
            options.access_key_id.clone(),
            options.secret_access_key.clone(),
            None,
            None,
            "depot-settings",
        );
        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(region);
        if let Some(endpoint_url) = &options.endpoint_url {
            // Path-style addressing keeps emulators and MinIO happy.
            builder = builder.endpoint_url(endpoint_url).force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        let storage = Self {
            client,
            bucket: options.bucket,
            prefix: options.prefix,
            policy: options.policy,
            storage_class: options.storage_class.map(|s| StorageClass::from(s.as_str())),
            encrypt: options.encrypt_key,
        };
        if options.create_bucket {
            storage.ensure_bucket(options.region_name.as_deref()).await?;
        }
        Ok(storage)
    }

    pub async fn from_settings(settings: &StorageSettings) -> Result<Self> {
        Self::new(S3Options::from_settings(settings)?).await
    }

    fn key(&self, file_id: &str) -> String {
        format!("{}{}", self.prefix, file_id)
    }

    async fn ensure_bucket(&self, region_name: Option<&str>) -> Result<()> {
        let head = self.client.head_bucket().bucket(&self.bucket).send().await;
        match head {
            Ok(_) => return Ok(()),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => {}
            Err(e) => {
                return Err(StorageError::backend(format!(
                    "could not check bucket {}",
                    self.bucket
                ))
                .with_source(e));
            }
        }

        tracing::info!(bucket = %self.bucket, "creating missing bucket");
        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if let Some(region) = region_name {
            if region != "us-east-1" {
                request = request.create_bucket_configuration(
                    CreateBucketConfiguration::builder()
                        .location_constraint(BucketLocationConstraint::from(region))
                        .build(),
                );
            }
        }
        request.send().await.map_err(|e| {
            StorageError::backend(format!("could not create bucket {}", self.bucket))
                .with_source(e)
        })?;
        Ok(())
    }

    async fn head(
        &self,
        file_id: &str,
    ) -> Result<Option<aws_sdk_s3::operation::head_object::HeadObjectOutput>> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(file_id))
            .send()
            .await;
        match response {
            Ok(head) => Ok(Some(head)),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(None),
            Err(e) => Err(StorageError::backend(format!(
                "could not fetch metadata for file {}",
                file_id
            ))
            .with_source(e)),
        }
    }

    fn metadata_from_head(
        &self,
        head: &aws_sdk_s3::operation::head_object::HeadObjectOutput,
    ) -> FileMetadata {
        let user_metadata = head.metadata();
        let filename = user_metadata
            .and_then(|m| m.get(METADATA_FILENAME))
            .map(|v| percent_decode_filename(v))
            .unwrap_or_else(|| UploadIntake::DEFAULT_NAME.to_string());
        let last_modified = user_metadata
            .and_then(|m| m.get(METADATA_MODIFIED))
            .and_then(|v| clock::parse_timestamp(v))
            .or_else(|| {
                head.last_modified()
                    .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), 0))
            })
            .unwrap_or_default();
        FileMetadata {
            filename,
            content_type: head
                .content_type()
                .unwrap_or(UploadIntake::DEFAULT_CONTENT_TYPE)
                .to_string(),
            content_length: head.content_length().unwrap_or(0).max(0) as u64,
            last_modified,
        }
    }

    async fn save_file(
        &self,
        file_id: &str,
        content: SpooledPayload,
        filename: &str,
        content_type: &str,
    ) -> Result<()> {
        let body = match &content {
            SpooledPayload::Memory(data) => ByteStream::from(data.clone()),
            SpooledPayload::Disk { file, .. } => {
                ByteStream::from_path(file.path()).await.map_err(|e| {
                    StorageError::backend("could not read spooled payload").with_source(e)
                })?
            }
        };

        let acl = match self.policy {
            AccessPolicy::PublicRead => ObjectCannedAcl::PublicRead,
            AccessPolicy::Private => ObjectCannedAcl::Private,
        };

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(file_id))
            .acl(acl)
            .content_type(content_type)
            .content_disposition(make_content_disposition("inline", filename))
            .metadata(METADATA_FILENAME, percent_encode_filename(filename))
            .metadata(METADATA_MODIFIED, clock::timestamp())
            .set_storage_class(self.storage_class.clone())
            .set_server_side_encryption(self.encrypt.then_some(ServerSideEncryption::Aes256))
            .body(body)
            .send()
            .await
            .map_err(|e| {
                StorageError::backend(format!("could not upload file {}", file_id)).with_source(e)
            })?;
        Ok(())
    }

    /// Direct URL for the object: under `public-read` the presigned URL
    /// with query auth stripped, otherwise the signed URL itself.
    async fn public_url(&self, file_id: &str) -> Option<String> {
        let config = PresigningConfig::expires_in(SIGNED_URL_TTL).ok()?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(file_id))
            .presigned(config)
            .await;
        match presigned {
            Ok(request) => {
                let url = request.uri().to_string();
                Some(match self.policy {
                    AccessPolicy::PublicRead => strip_query_auth(&url),
                    AccessPolicy::Private => url,
                })
            }
            Err(e) => {
                tracing::warn!(file_id, error = %e, "could not presign object url");
                None
            }
        }
    }
}

fn strip_query_auth(url: &str) -> String {
    url.split('?').next().unwrap_or(url).to_string()
}

#[async_trait]
impl FileStorage for S3Storage {
    fn backend(&self) -> &'static str {
        "s3"
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
        let spooled = content
            .into_spooled()
            .await
            .map_err(|e| StorageError::backend("could not buffer payload").with_source(e))?;
        self.save_file(&new_file_id, spooled, &filename, &content_type)
            .await?;
        Ok(new_file_id)
    }

    async fn get(&self, file_id: &str) -> Result<StoredFile> {
        check_file_id(file_id)?;
        let head = self
            .head(file_id)
            .await?
            .ok_or_else(|| StorageError::not_found(file_id))?;
        let metadata = self.metadata_from_head(&head);
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
                let response = client
                    .get_object()
                    .bucket(bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| {
                        if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                            StorageError::not_found(&owned_id)
                        } else {
                            StorageError::backend(format!("could not open file {}", owned_id))
                                .with_source(e)
                        }
                    })?;
                Ok(Box::pin(response.body.into_async_read()) as BoxAsyncRead)
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
        let head = self
            .head(file_id)
            .await?
            .ok_or_else(|| StorageError::not_found(file_id))?;

        let intake = UploadIntake::resolve(payload, filename, content_type)?;
        let (content, filename, content_type) = if intake.wants_existing_metadata() {
            let existing = self.metadata_from_head(&head);
            intake.file_info_or_existing(&existing)
        } else {
            intake.file_info()
        };
        let spooled = content
            .into_spooled()
            .await
            .map_err(|e| StorageError::backend("could not buffer payload").with_source(e))?;
        self.save_file(file_id, spooled, &filename, &content_type)
            .await?;
        Ok(file_id.to_string())
    }

    async fn delete(&self, file_id: &str) -> Result<()> {
        check_file_id(file_id)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(file_id))
            .send()
            .await
            .map_err(|e| {
                StorageError::backend(format!("could not delete file {}", file_id)).with_source(e)
            })?;
        Ok(())
    }

    async fn exists(&self, file_id: &str) -> Result<bool> {
        check_file_id(file_id)?;
        Ok(self.head(file_id).await?.is_some())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&self.prefix)
            .into_paginator()
            .send();

        let mut file_ids = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                StorageError::backend(format!("could not list bucket {}", self.bucket))
                    .with_source(e)
            })?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    let id = key.strip_prefix(&self.prefix).unwrap_or(key);
                    file_ids.push(id.to_string());
                }
            }
        }
        Ok(file_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_require_bucket() {
        let settings = StorageSettings::new("s3")
            .with_option("access_key_id", "AK")
            .with_option("secret_access_key", "SK");
        let err = S3Options::from_settings(&settings).unwrap_err();
        assert!(err.message.contains("bucket"));
    }

    #[test]
    fn test_options_defaults() {
        let settings = StorageSettings::new("s3")
            .with_option("access_key_id", "AK")
            .with_option("secret_access_key", "SK")
            .with_option("bucket", "files");
        let options = S3Options::from_settings(&settings).unwrap();
        assert_eq!(options.policy, AccessPolicy::PublicRead);
        assert_eq!(options.prefix, "");
        assert!(options.create_bucket);
        assert!(!options.encrypt_key);
    }

    #[test]
    fn test_options_flags_and_prefix() {
        let settings = StorageSettings::new("s3")
            .with_option("access_key_id", "AK")
            .with_option("secret_access_key", "SK")
            .with_option("bucket", "files")
            .with_option("prefix", "app/")
            .with_option("policy", "private")
            .with_option("encrypt_key", "true")
            .with_option("create_bucket", "false");
        let options = S3Options::from_settings(&settings).unwrap();
        assert_eq!(options.prefix, "app/");
        assert_eq!(options.policy, AccessPolicy::Private);
        assert!(options.encrypt_key);
        assert!(!options.create_bucket);
    }

    #[test]
    fn test_query_auth_stripping() {
        assert_eq!(
            strip_query_auth("https://b.s3.amazonaws.com/k?X-Amz-Signature=abc"),
            "https://b.s3.amazonaws.com/k"
        );
        assert_eq!(
            strip_query_auth("https://b.s3.amazonaws.com/k"),
            "https://b.s3.amazonaws.com/k"
        );
    }
}
