use std::collections::HashMap;
use std::fmt::{Display, Formatter, Result as FmtResult};

use crate::common::errors::{Result, StorageError};

/// Conventional prefix for depot settings inside an application
/// configuration map.
pub const DEFAULT_CONFIG_PREFIX: &str = "depot.";

/// Backend selected when the settings omit the `backend` key.
pub const DEFAULT_BACKEND: &str = "local";

/// Flat settings for one store: the backend selector plus driver options.
///
/// Settings are usually carved out of an application-wide configuration map
/// where every depot option carries the `depot.` prefix, the minimum
/// required key being `depot.backend`. Remaining keys are handed to the
/// selected driver verbatim.
#[derive(Debug, Clone, Default)]
pub struct StorageSettings {
    backend: String,
    options: HashMap<String, String>,
}

impl StorageSettings {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            options: HashMap::new(),
        }
    }

    /// Extracts the settings under `prefix` from a flat configuration map.
    pub fn from_map(config: &HashMap<String, String>, prefix: &str) -> Self {
        let backend_key = format!("{}backend", prefix);
        let backend = config
            .get(&backend_key)
            .cloned()
            .unwrap_or_else(|| DEFAULT_BACKEND.to_string());

        let options = config
            .iter()
            .filter(|(k, _)| k.starts_with(prefix) && **k != backend_key)
            .map(|(k, v)| (k[prefix.len()..].to_string(), v.clone()))
            .collect();

        Self { backend, options }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Returns the option value, falling back to the given environment
    /// variable the way provider SDK credential chains do.
    pub fn get_or_env(&self, key: &str, env_var: &str) -> Option<String> {
        self.get(key)
            .map(str::to_string)
            .or_else(|| std::env::var(env_var).ok())
    }

    /// Returns the option value or a configuration error naming the key.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| {
            StorageError::configuration(format!(
                "missing required setting '{}' for backend '{}'",
                key, self.backend
            ))
        })
    }

    pub fn options(&self) -> &HashMap<String, String> {
        &self.options
    }
}

/// Canned ACL accepted by the object-storage drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessPolicy {
    #[default]
    PublicRead,
    Private,
}

impl AccessPolicy {
    /// Reads the `policy` option, defaulting to public-read.
    pub fn from_settings(settings: &StorageSettings) -> Result<Self> {
        match settings.get("policy") {
            None => Ok(Self::default()),
            Some("public-read") => Ok(AccessPolicy::PublicRead),
            Some("private") => Ok(AccessPolicy::Private),
            Some(other) => Err(StorageError::configuration(format!(
                "policy must be public-read or private, got '{}'",
                other
            ))),
        }
    }
}

impl Display for AccessPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            AccessPolicy::PublicRead => write!(f, "public-read"),
            AccessPolicy::Private => write!(f, "private"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_settings_extracted_under_prefix() {
        let map = config(&[
            ("depot.backend", "s3"),
            ("depot.bucket", "files"),
            ("depot.prefix", "app/"),
            ("unrelated.key", "x"),
        ]);
        let settings = StorageSettings::from_map(&map, DEFAULT_CONFIG_PREFIX);
        assert_eq!(settings.backend(), "s3");
        assert_eq!(settings.get("bucket"), Some("files"));
        assert_eq!(settings.get("prefix"), Some("app/"));
        assert_eq!(settings.get("unrelated.key"), None);
        assert_eq!(settings.get("backend"), None);
    }

    #[test]
    fn test_backend_defaults_to_local() {
        let map = config(&[("depot.storage_path", "./lfs")]);
        let settings = StorageSettings::from_map(&map, DEFAULT_CONFIG_PREFIX);
        assert_eq!(settings.backend(), DEFAULT_BACKEND);
        assert_eq!(settings.get("storage_path"), Some("./lfs"));
    }

    #[test]
    fn test_require_reports_missing_key() {
        let settings = StorageSettings::new("s3");
        let err = settings.require("bucket").unwrap_err();
        assert_eq!(err.kind, crate::common::errors::ErrorKind::Configuration);
        assert!(err.message.contains("bucket"));
    }

    #[test]
    fn test_policy_parsing() {
        let settings = StorageSettings::new("s3").with_option("policy", "private");
        assert_eq!(
            AccessPolicy::from_settings(&settings).unwrap(),
            AccessPolicy::Private
        );
        let settings = StorageSettings::new("s3");
        assert_eq!(
            AccessPolicy::from_settings(&settings).unwrap(),
            AccessPolicy::PublicRead
        );
        let settings = StorageSettings::new("s3").with_option("policy", "acl-weird");
        assert!(AccessPolicy::from_settings(&settings).is_err());
    }
}
