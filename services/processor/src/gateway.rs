use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Image extensions picked up from a device prefix
const IMAGE_EXTENSIONS: [&str; 3] = [".jpg", ".jpeg", ".png"];

/// Errors talking to the object store
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Failed to list objects under {prefix}: {message}")]
    ListFailed { prefix: String, message: String },

    #[error("Failed to download {key}: {message}")]
    DownloadFailed { key: String, message: String },

    #[error("Failed to delete {key}: {message}")]
    DeleteFailed { key: String, message: String },

    #[error("Object key has no filename: {0}")]
    InvalidKey(String),

    #[error("Failed to write local copy of {key}: {source}")]
    LocalWrite {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Remote blob store holding device uploads
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Image keys under `prefix`, sorted ascending
    async fn list(&self, prefix: &str) -> Result<Vec<String>, GatewayError>;

    /// Download `key` into `dest_dir`, returning the local path
    async fn download(&self, key: &str, dest_dir: &Path) -> Result<PathBuf, GatewayError>;

    /// Delete `key` from the store
    async fn delete(&self, key: &str) -> Result<(), GatewayError>;
}

/// Build the `<root>/<serial>/<YYYYMMDD>/` prefix for a device and date
pub fn device_prefix(root: &str, device_serial: &str, date: NaiveDate) -> String {
    let root = root.trim_matches('/');
    let serial = sanitize_path_component(device_serial);
    let date = date.format("%Y%m%d");

    if root.is_empty() {
        format!("{}/{}/", serial, date)
    } else {
        format!("{}/{}/{}/", root, serial, date)
    }
}

/// True when the key names a supported image file
pub fn is_image_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// True when `key` is an image sitting directly under `prefix`, not in a nested folder
pub fn is_batch_image(prefix: &str, key: &str) -> bool {
    key.strip_prefix(prefix)
        .map_or(false, |rest| !rest.is_empty() && !rest.contains('/'))
        && is_image_key(key)
}

/// Final path segment of an object key
pub fn key_filename(key: &str) -> Option<&str> {
    key.rsplit('/').next().filter(|name| !name.is_empty())
}

/// Sanitize a path component to prevent path traversal
pub(crate) fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// S3-backed object store
pub struct S3Gateway {
    client: S3Client,
    bucket: String,
}

impl S3Gateway {
    /// Create a new S3 gateway
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 gateway initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
        }
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Check that the bucket is reachable
    pub async fn check_bucket(&self) -> Result<(), GatewayError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| GatewayError::ListFailed {
                prefix: String::new(),
                message: e.to_string(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3Gateway {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>, GatewayError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .delimiter("/")
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| GatewayError::ListFailed {
                    prefix: prefix.to_string(),
                    message: e.to_string(),
                })?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key())
                    .filter(|key| is_batch_image(prefix, key))
                    .map(String::from),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        keys.sort();

        debug!(prefix = %prefix, count = keys.len(), "Listed image objects");

        Ok(keys)
    }

    #[instrument(skip(self, dest_dir), fields(bucket = %self.bucket))]
    async fn download(&self, key: &str, dest_dir: &Path) -> Result<PathBuf, GatewayError> {
        let filename =
            key_filename(key).ok_or_else(|| GatewayError::InvalidKey(key.to_string()))?;
        let local_path = dest_dir.join(filename);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| GatewayError::DownloadFailed {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| GatewayError::DownloadFailed {
                key: key.to_string(),
                message: e.to_string(),
            })?
            .into_bytes();

        tokio::fs::write(&local_path, &body)
            .await
            .map_err(|source| GatewayError::LocalWrite {
                key: key.to_string(),
                source,
            })?;

        debug!(
            key = %key,
            local_path = %local_path.display(),
            size_bytes = body.len(),
            "Object downloaded"
        );

        Ok(local_path)
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn delete(&self, key: &str) -> Result<(), GatewayError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| GatewayError::DeleteFailed {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        debug!(key = %key, "Object deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_prefix() {
        let date = NaiveDate::from_ymd_opt(2025, 4, 17).unwrap();

        assert_eq!(
            device_prefix("opencv", "SFRXC12515GF00001", date),
            "opencv/SFRXC12515GF00001/20250417/"
        );
        assert_eq!(device_prefix("/opencv/", "dev-1", date), "opencv/dev-1/20250417/");
        assert_eq!(device_prefix("", "dev-1", date), "dev-1/20250417/");
    }

    #[test]
    fn test_device_prefix_sanitizes_serial() {
        let date = NaiveDate::from_ymd_opt(2025, 4, 17).unwrap();
        assert_eq!(device_prefix("opencv", "../etc", date), "opencv/___etc/20250417/");
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("glasses-001"), "glasses-001");
        assert_eq!(sanitize_path_component("device/path"), "device_path");
        assert_eq!(sanitize_path_component("dev..ice"), "dev__ice");
    }

    #[test]
    fn test_is_image_key() {
        assert!(is_image_key("opencv/a/20250417/a_20250417_170454.jpg"));
        assert!(is_image_key("x.JPEG"));
        assert!(is_image_key("x.Png"));
        assert!(!is_image_key("x.txt"));
        assert!(!is_image_key("opencv/a/20250417/"));
    }

    #[test]
    fn test_is_batch_image_rejects_nested_keys() {
        let prefix = "opencv/dev-1/20250417/";

        assert!(is_batch_image(prefix, "opencv/dev-1/20250417/a.jpg"));
        assert!(!is_batch_image(prefix, "opencv/dev-1/20250417/retry/a.jpg"));
        assert!(!is_batch_image(prefix, "opencv/dev-1/20250417/"));
        assert!(!is_batch_image(prefix, "opencv/dev-1/20250417/notes.txt"));
        assert!(!is_batch_image(prefix, "opencv/dev-2/20250417/a.jpg"));
    }

    #[test]
    fn test_key_filename() {
        assert_eq!(key_filename("opencv/a/20250417/img.jpg"), Some("img.jpg"));
        assert_eq!(key_filename("img.jpg"), Some("img.jpg"));
        assert_eq!(key_filename("opencv/a/"), None);
    }
}
