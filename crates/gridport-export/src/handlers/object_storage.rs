//! Object-storage target handler
//!
//! One handler covers S3, S3-compatible stores (MinIO, R2), and the local
//! filesystem through the unified `object_store` trait, so every provider
//! shares key generation and write behavior. Each dispatch lands as one
//! time-partitioned JSON object under the configured prefix.

use super::{HandlerFactory, TargetHandler};
use crate::error::{HandlerError, HandlerResult};
use crate::event::{AlarmEvent, ExportResult};
use crate::store::TargetRecord;
use crate::types::SensitiveString;
use async_trait::async_trait;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use validator::Validate;

/// Storage provider selection
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    /// Amazon S3 or S3-compatible (MinIO, R2, ...)
    #[default]
    S3,
    /// Local filesystem (testing, edge deployments)
    Local,
}

/// Object-storage handler configuration (per-target config blob)
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct ObjectStorageConfig {
    /// Provider (default: s3)
    #[serde(default)]
    pub provider: StorageProvider,

    /// Bucket name (required for s3)
    #[serde(default)]
    pub bucket: Option<String>,

    /// Key prefix inside the bucket / root
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// AWS region (default: us-east-1)
    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint URL (MinIO, R2, ...)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Access key id
    #[serde(default)]
    pub access_key_id: Option<SensitiveString>,

    /// Secret access key
    #[serde(default)]
    pub secret_access_key: Option<SensitiveString>,

    /// Use path-style URLs (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,

    /// Skip request signing (public buckets)
    #[serde(default)]
    pub anonymous: bool,

    /// Root directory for the local provider
    #[serde(default)]
    pub root: Option<String>,
}

fn default_prefix() -> String {
    "exports".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Time-partitioned object key: `<prefix>/<yyyy>/<mm>/<dd>/<bd>-<nm>-<ts>-<id>.json`
fn object_key(prefix: &str, event: &AlarmEvent, at: chrono::DateTime<chrono::Utc>) -> String {
    let short_id = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}/{}/{}-{}-{}-{}.json",
        prefix.trim_end_matches('/'),
        at.format("%Y/%m/%d"),
        event.building_id,
        event.point_name,
        at.format("%H%M%S"),
        &short_id[..8]
    )
}

/// Handler instance bound to one target
pub struct ObjectStorageHandler {
    target_id: i64,
    target_name: String,
    prefix: String,
    store: Arc<dyn ObjectStore>,
}

impl ObjectStorageHandler {
    fn build_store(config: &ObjectStorageConfig) -> HandlerResult<Arc<dyn ObjectStore>> {
        match config.provider {
            StorageProvider::S3 => {
                let bucket = config.bucket.as_deref().ok_or_else(|| {
                    HandlerError::config("s3 provider requires 'bucket'")
                })?;

                let mut builder = object_store::aws::AmazonS3Builder::new()
                    .with_bucket_name(bucket)
                    .with_region(&config.region);

                if let Some(endpoint) = &config.endpoint {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_allow_http(endpoint.starts_with("http://"));
                }
                if let Some(key) = &config.access_key_id {
                    builder = builder.with_access_key_id(key.expose());
                }
                if let Some(secret) = &config.secret_access_key {
                    builder = builder.with_secret_access_key(secret.expose());
                }
                if config.force_path_style {
                    builder = builder.with_virtual_hosted_style_request(false);
                }
                if config.anonymous {
                    builder = builder.with_skip_signature(true);
                }

                let store = builder
                    .build()
                    .map_err(|e| HandlerError::config(format!("s3 store: {}", e)))?;
                Ok(Arc::new(store))
            }
            StorageProvider::Local => {
                let root = config
                    .root
                    .as_deref()
                    .ok_or_else(|| HandlerError::config("local provider requires 'root'"))?;
                std::fs::create_dir_all(root)?;
                let store = object_store::local::LocalFileSystem::new_with_prefix(root)
                    .map_err(|e| HandlerError::config(format!("local store: {}", e)))?;
                Ok(Arc::new(store))
            }
        }
    }
}

#[async_trait]
impl TargetHandler for ObjectStorageHandler {
    async fn send(&self, event: &AlarmEvent, payload: &Value) -> ExportResult {
        let started = Instant::now();

        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                return ExportResult::failure(
                    self.target_id,
                    &self.target_name,
                    format!("payload serialization failed: {}", e),
                )
                .with_processing_time(started.elapsed());
            }
        };
        let data_size = body.len();

        let key = object_key(&self.prefix, event, chrono::Utc::now());
        let path = ObjectPath::from(key);

        match self.store.put(&path, PutPayload::from(body)).await {
            Ok(_) => ExportResult::ok(self.target_id, &self.target_name)
                .with_processing_time(started.elapsed())
                .with_data_size(data_size),
            Err(e) => ExportResult::failure(
                self.target_id,
                &self.target_name,
                format!("object write failed: {}", e),
            )
            .with_processing_time(started.elapsed())
            .with_data_size(data_size),
        }
    }
}

/// Factory for the `object-storage` target type
pub struct ObjectStorageHandlerFactory;

impl HandlerFactory for ObjectStorageHandlerFactory {
    fn type_name(&self) -> &'static str {
        "object-storage"
    }

    fn create(&self, target: &TargetRecord) -> HandlerResult<Arc<dyn TargetHandler>> {
        let config: ObjectStorageConfig = serde_json::from_value(target.config.clone())
            .map_err(|e| HandlerError::config(format!("invalid object-storage config: {}", e)))?;
        config
            .validate()
            .map_err(|e| HandlerError::config(format!("invalid object-storage config: {}", e)))?;

        let store = ObjectStorageHandler::build_store(&config)?;
        Ok(Arc::new(ObjectStorageHandler {
            target_id: target.id,
            target_name: target.name.clone(),
            prefix: config.prefix,
            store,
        }))
    }
}
