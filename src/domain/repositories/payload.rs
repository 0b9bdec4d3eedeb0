use std::path::Path;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::common::errors::{Result, StorageError};
use crate::domain::entities::stored_file::FileMetadata;

/// Boxed reader used for stream payloads and stored-file handles.
pub type BoxAsyncRead = Pin<Box<dyn AsyncRead + Send>>;

/// Payloads above this size are spilled from memory to a temporary file
/// before being handed to an object-storage upload.
pub const INMEMORY_SPOOL_SIZE: usize = 1024 * 1024;

const SPOOL_READ_CHUNK: usize = 64 * 1024;

/// A form-upload record: raw content together with the filename and MIME
/// type the client declared for it.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub data: Bytes,
    pub filename: String,
    pub content_type: String,
}

/// The intention to upload some content under an explicit filename and
/// content type. Useful to attach metadata to payloads that would not
/// otherwise carry any.
pub struct FileIntent {
    content: Box<Payload>,
    filename: Option<String>,
    content_type: Option<String>,
}

impl FileIntent {
    pub fn new(
        content: impl Into<Payload>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            content: Box::new(content.into()),
            filename: Some(filename.into()),
            content_type: Some(content_type.into()),
        }
    }
}

/// The payload shapes accepted by every driver `create`/`replace` call.
///
/// Character strings are deliberately representable so that drivers can
/// reject them: stored content is always bytes, never text with an
/// ambiguous encoding.
pub enum Payload {
    /// Raw bytes
    Bytes(Bytes),
    /// A readable stream, optionally carrying the name of its source
    Stream {
        reader: BoxAsyncRead,
        name: Option<String>,
    },
    /// A form-upload record
    Upload(FileUpload),
    /// Payload plus explicit metadata overrides
    Intent(FileIntent),
    /// A character string. Always rejected with `UnsupportedPayload`.
    Text(String),
}

impl Payload {
    pub fn from_reader(reader: impl AsyncRead + Send + 'static, name: Option<String>) -> Self {
        Payload::Stream {
            reader: Box::pin(reader),
            name,
        }
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Payload::Bytes(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload::Bytes(data.into())
    }
}

impl From<&[u8]> for Payload {
    fn from(data: &[u8]) -> Self {
        Payload::Bytes(Bytes::copy_from_slice(data))
    }
}

impl From<FileUpload> for Payload {
    fn from(upload: FileUpload) -> Self {
        Payload::Upload(upload)
    }
}

impl From<FileIntent> for Payload {
    fn from(intent: FileIntent) -> Self {
        Payload::Intent(intent)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

/// Content extracted out of a payload once metadata has been resolved.
pub enum PayloadSource {
    Bytes(Bytes),
    Stream(BoxAsyncRead),
}

impl PayloadSource {
    /// Reads the whole content into memory.
    pub async fn into_bytes(self) -> std::io::Result<Bytes> {
        match self {
            PayloadSource::Bytes(data) => Ok(data),
            PayloadSource::Stream(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Ok(buf.into())
            }
        }
    }

    /// Buffers the content for an upload that needs a known length.
    /// Stays in memory up to [`INMEMORY_SPOOL_SIZE`], spills to a
    /// temporary file beyond that.
    pub async fn into_spooled(self) -> std::io::Result<SpooledPayload> {
        let mut reader = match self {
            PayloadSource::Bytes(data) => return Ok(SpooledPayload::Memory(data)),
            PayloadSource::Stream(reader) => reader,
        };

        let mut buf = BytesMut::new();
        let mut chunk = vec![0u8; SPOOL_READ_CHUNK];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(SpooledPayload::Memory(buf.freeze()));
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.len() > INMEMORY_SPOOL_SIZE {
                break;
            }
        }

        // Over the threshold: spill what has been read plus the rest of the
        // stream to a temporary file.
        let temp = NamedTempFile::new()?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(temp.path())
            .await?;
        file.write_all(&buf).await?;
        let mut len = buf.len() as u64;
        len += tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        Ok(SpooledPayload::Disk { file: temp, len })
    }
}

/// A buffered payload with a known length, either in memory or in a
/// temporary file that is removed on drop.
pub enum SpooledPayload {
    Memory(Bytes),
    Disk { file: NamedTempFile, len: u64 },
}

impl SpooledPayload {
    pub fn len(&self) -> u64 {
        match self {
            SpooledPayload::Memory(data) => data.len() as u64,
            SpooledPayload::Disk { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            SpooledPayload::Memory(_) => None,
            SpooledPayload::Disk { file, .. } => Some(file.path()),
        }
    }
}

/// Resolves a payload plus optional explicit metadata into content,
/// filename and content type, applying the same derivation ladder on every
/// driver:
///
/// * filename: explicit argument, the payload's own filename, then the
///   basename of the payload's source name;
/// * content type: explicit argument, the payload's declared type, then a
///   MIME guess from the filename, then `application/octet-stream`.
pub struct UploadIntake {
    content: PayloadSource,
    filename: Option<String>,
    content_type: Option<String>,
}

impl UploadIntake {
    pub const DEFAULT_NAME: &'static str = "unnamed";
    pub const DEFAULT_CONTENT_TYPE: &'static str = "application/octet-stream";

    pub fn resolve(
        payload: Payload,
        filename: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<Self> {
        let mut filename = filename.map(str::to_string);
        let mut content_type = content_type.map(str::to_string);

        let content = Self::unwrap_content(payload, &mut filename, &mut content_type)?;

        if content_type.is_none() {
            if let Some(name) = filename.as_deref() {
                content_type = mime_guess::from_path(name)
                    .first_raw()
                    .map(str::to_string);
            }
        }

        Ok(Self {
            content,
            filename,
            content_type,
        })
    }

    fn unwrap_content(
        payload: Payload,
        filename: &mut Option<String>,
        content_type: &mut Option<String>,
    ) -> Result<PayloadSource> {
        match payload {
            Payload::Text(_) => Err(StorageError::unsupported_payload()),
            Payload::Bytes(data) => Ok(PayloadSource::Bytes(data)),
            Payload::Stream { reader, name } => {
                if filename.is_none() {
                    *filename = name.as_deref().map(basename);
                }
                Ok(PayloadSource::Stream(reader))
            }
            Payload::Upload(upload) => {
                if filename.is_none() {
                    *filename = Some(upload.filename);
                }
                if content_type.is_none() {
                    *content_type = Some(upload.content_type);
                }
                Ok(PayloadSource::Bytes(upload.data))
            }
            Payload::Intent(intent) => {
                if filename.is_none() {
                    *filename = intent.filename;
                }
                if content_type.is_none() {
                    *content_type = intent.content_type;
                }
                Self::unwrap_content(*intent.content, filename, content_type)
            }
        }
    }

    /// True when a replace should fall back to the existing record's
    /// metadata instead of the defaults.
    pub fn wants_existing_metadata(&self) -> bool {
        self.filename.is_none()
    }

    /// Final content, filename and content type with defaults applied.
    pub fn file_info(self) -> (PayloadSource, String, String) {
        (
            self.content,
            self.filename
                .unwrap_or_else(|| Self::DEFAULT_NAME.to_string()),
            self.content_type
                .unwrap_or_else(|| Self::DEFAULT_CONTENT_TYPE.to_string()),
        )
    }

    /// Like [`file_info`](Self::file_info) but, when no filename could be
    /// derived, reuses the metadata of the record being replaced.
    pub fn file_info_or_existing(self, existing: &FileMetadata) -> (PayloadSource, String, String) {
        if self.filename.is_none() {
            return (
                self.content,
                existing.filename.clone(),
                existing.content_type.clone(),
            );
        }
        self.file_info()
    }
}

fn basename(name: &str) -> String {
    name.rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(
        payload: Payload,
        filename: Option<&str>,
        content_type: Option<&str>,
    ) -> (String, String) {
        let (_, filename, content_type) = UploadIntake::resolve(payload, filename, content_type)
            .unwrap()
            .file_info();
        (filename, content_type)
    }

    #[test]
    fn test_content_type_guessed_from_filename() {
        assert_eq!(
            info(b"12345"[..].into(), Some("image.png"), None),
            ("image.png".to_string(), "image/png".to_string())
        );
        assert_eq!(
            info(b"12345"[..].into(), Some("file.txt"), None),
            ("file.txt".to_string(), "text/plain".to_string())
        );
        assert_eq!(
            info(b"12345"[..].into(), Some("no_extension"), None),
            (
                "no_extension".to_string(),
                "application/octet-stream".to_string()
            )
        );
    }

    #[test]
    fn test_defaults_applied_when_nothing_known() {
        assert_eq!(
            info(b"12345"[..].into(), None, None),
            (
                UploadIntake::DEFAULT_NAME.to_string(),
                UploadIntake::DEFAULT_CONTENT_TYPE.to_string()
            )
        );
    }

    #[test]
    fn test_stream_name_reduced_to_basename() {
        let payload = Payload::from_reader(
            std::io::Cursor::new(b"12345".to_vec()),
            Some("/var/uploads/photo.jpg".to_string()),
        );
        let (filename, content_type) = info(payload, None, None);
        assert_eq!(filename, "photo.jpg");
        assert_eq!(content_type, "image/jpeg");
    }

    #[test]
    fn test_upload_record_provides_both() {
        let upload = FileUpload {
            data: Bytes::from_static(b"12345"),
            filename: "form.bin".to_string(),
            content_type: "application/x-custom".to_string(),
        };
        assert_eq!(
            info(upload.into(), None, None),
            ("form.bin".to_string(), "application/x-custom".to_string())
        );
    }

    #[test]
    fn test_intent_overrides_win_over_guessing() {
        let intent = FileIntent::new(&b"12345"[..], "named.unknown", "text/csv");
        assert_eq!(
            info(intent.into(), None, None),
            ("named.unknown".to_string(), "text/csv".to_string())
        );
    }

    #[test]
    fn test_explicit_arguments_win_over_intent() {
        let intent = FileIntent::new(&b"12345"[..], "inner.txt", "text/plain");
        assert_eq!(
            info(intent.into(), Some("outer.csv"), None),
            ("outer.csv".to_string(), "text/csv".to_string())
        );
    }

    #[test]
    fn test_text_payload_rejected() {
        let err = UploadIntake::resolve("some unicode".into(), None, None).unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::UnsupportedPayload);
    }

    #[tokio::test]
    async fn test_small_stream_spools_in_memory() {
        let payload = Payload::from_reader(std::io::Cursor::new(vec![7u8; 1000]), None);
        let intake = UploadIntake::resolve(payload, None, None).unwrap();
        let (content, _, _) = intake.file_info();
        let spooled = content.into_spooled().await.unwrap();
        assert_eq!(spooled.len(), 1000);
        assert!(spooled.path().is_none());
    }

    #[tokio::test]
    async fn test_large_stream_spills_to_disk() {
        let payload = Payload::from_reader(
            std::io::Cursor::new(vec![7u8; INMEMORY_SPOOL_SIZE + 1024]),
            None,
        );
        let intake = UploadIntake::resolve(payload, None, None).unwrap();
        let (content, _, _) = intake.file_info();
        let spooled = content.into_spooled().await.unwrap();
        assert_eq!(spooled.len(), (INMEMORY_SPOOL_SIZE + 1024) as u64);
        let path = spooled.path().expect("should have spilled").to_path_buf();
        assert!(path.exists());
        drop(spooled);
        assert!(!path.exists());
    }
}
