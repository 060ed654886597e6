//! Local file target handler
//!
//! Two write modes:
//! - `append` (default): one JSON document per line (JSONL), with optional
//!   size-based rotation of the active file.
//! - `atomic`: the payload replaces the file content via a temp-file write
//!   and rename, so readers never observe a partial document.

use super::{HandlerFactory, TargetHandler};
use crate::error::{HandlerError, HandlerResult};
use crate::event::{AlarmEvent, ExportResult};
use crate::store::TargetRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use validator::Validate;

/// File handler configuration (per-target config blob)
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct FileHandlerConfig {
    /// Output file path
    #[validate(length(min = 1))]
    pub path: String,

    /// Write mode (default: append)
    #[serde(default)]
    pub mode: FileWriteMode,

    /// Create missing parent directories (default: true)
    #[serde(default = "default_true")]
    pub create_dirs: bool,

    /// Rotate the active file once it exceeds this many bytes
    /// (append mode only, 0 = no rotation)
    #[serde(default)]
    pub rotate_max_bytes: u64,
}

fn default_true() -> bool {
    true
}

/// How payloads land in the file
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileWriteMode {
    /// Append one JSON line per dispatch
    #[default]
    Append,
    /// Replace the file atomically (temp file + rename)
    Atomic,
}

/// Handler instance bound to one target
pub struct FileTargetHandler {
    target_id: i64,
    target_name: String,
    config: FileHandlerConfig,
    path: PathBuf,
}

impl FileTargetHandler {
    fn new(target: &TargetRecord, config: FileHandlerConfig) -> Self {
        let path = PathBuf::from(&config.path);
        Self {
            target_id: target.id,
            target_name: target.name.clone(),
            config,
            path,
        }
    }

    async fn ensure_parent(&self) -> HandlerResult<()> {
        if !self.config.create_dirs {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    async fn rotate_if_needed(&self, incoming: usize) -> HandlerResult<()> {
        if self.config.rotate_max_bytes == 0 {
            return Ok(());
        }

        let current = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };

        if current + incoming as u64 > self.config.rotate_max_bytes {
            let rotated = rotated_path(&self.path, chrono::Utc::now());
            tokio::fs::rename(&self.path, &rotated).await?;
            debug!(
                "File target '{}' rotated {} -> {}",
                self.target_name,
                self.path.display(),
                rotated.display()
            );
        }
        Ok(())
    }

    async fn write_append(&self, line: &[u8]) -> HandlerResult<()> {
        self.ensure_parent().await?;
        self.rotate_if_needed(line.len() + 1).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    async fn write_atomic(&self, body: &[u8]) -> HandlerResult<()> {
        self.ensure_parent().await?;

        let tmp = self
            .path
            .with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(body).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            // Leave no orphaned temp file behind on a failed rename
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                warn!(
                    "File target '{}' could not remove temp file {}: {}",
                    self.target_name,
                    tmp.display(),
                    cleanup
                );
            }
            return Err(HandlerError::Io(e));
        }
        Ok(())
    }
}

fn rotated_path(path: &Path, at: chrono::DateTime<chrono::Utc>) -> PathBuf {
    let stamp = at.format("%Y%m%dT%H%M%S");
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => path.with_extension(format!("{}.{}", stamp, ext)),
        None => path.with_extension(stamp.to_string()),
    }
}

#[async_trait]
impl TargetHandler for FileTargetHandler {
    async fn check(&self) -> HandlerResult<()> {
        self.ensure_parent().await?;
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                tokio::fs::metadata(parent).await.map_err(|e| {
                    HandlerError::config(format!(
                        "output directory {} not accessible: {}",
                        parent.display(),
                        e
                    ))
                })?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn send(&self, _event: &AlarmEvent, payload: &Value) -> ExportResult {
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

        let outcome = match self.config.mode {
            FileWriteMode::Append => self.write_append(&body).await,
            FileWriteMode::Atomic => self.write_atomic(&body).await,
        };

        match outcome {
            Ok(()) => ExportResult::ok(self.target_id, &self.target_name)
                .with_processing_time(started.elapsed())
                .with_data_size(data_size),
            Err(e) => ExportResult::failure(
                self.target_id,
                &self.target_name,
                format!("file write failed: {}", e),
            )
            .with_processing_time(started.elapsed())
            .with_data_size(data_size),
        }
    }
}

/// Factory for the `file` target type
pub struct FileHandlerFactory;

impl HandlerFactory for FileHandlerFactory {
    fn type_name(&self) -> &'static str {
        "file"
    }

    fn create(&self, target: &TargetRecord) -> HandlerResult<Arc<dyn TargetHandler>> {
        let config: FileHandlerConfig = serde_json::from_value(target.config.clone())
            .map_err(|e| HandlerError::config(format!("invalid file config: {}", e)))?;
        config
            .validate()
            .map_err(|e| HandlerError::config(format!("invalid file config: {}", e)))?;

        Ok(Arc::new(FileTargetHandler::new(target, config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::ExportMode;

    fn target_with(config: serde_json::Value) -> TargetRecord {
        TargetRecord {
            id: 4,
            name: "local-audit".to_string(),
            target_type: "file".to_string(),
            enabled: true,
            config,
            export_mode: ExportMode::default(),
            priority: None,
            template: None,
        }
    }

    fn handler_for(dir: &Path, file: &str, extra: serde_json::Value) -> FileTargetHandler {
        let mut config = serde_json::json!({"path": dir.join(file).to_string_lossy()});
        if let (Some(obj), Some(extra_obj)) = (config.as_object_mut(), extra.as_object()) {
            for (k, v) in extra_obj {
                obj.insert(k.clone(), v.clone());
            }
        }
        let target = target_with(config.clone());
        let parsed: FileHandlerConfig = serde_json::from_value(config).unwrap();
        FileTargetHandler::new(&target, parsed)
    }

    #[tokio::test]
    async fn test_append_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler_for(dir.path(), "out.jsonl", serde_json::json!({}));
        let event = AlarmEvent::new(1, "p", 1.0);

        let first = handler.send(&event, &serde_json::json!({"v": 1})).await;
        let second = handler.send(&event, &serde_json::json!({"v": 2})).await;
        assert!(first.success && second.success);
        assert!(first.data_size > 0);

        let content = tokio::fs::read_to_string(dir.path().join("out.jsonl"))
            .await
            .unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"v":1}"#);
        assert_eq!(lines[1], r#"{"v":2}"#);
    }

    #[tokio::test]
    async fn test_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler_for(dir.path(), "latest.json", serde_json::json!({"mode": "atomic"}));
        let event = AlarmEvent::new(1, "p", 1.0);

        handler.send(&event, &serde_json::json!({"v": 1})).await;
        handler.send(&event, &serde_json::json!({"v": 2})).await;

        let content = tokio::fs::read_to_string(dir.path().join("latest.json"))
            .await
            .unwrap();
        assert_eq!(content, r#"{"v":2}"#);

        // No temp files left behind
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["latest.json".to_string()]);
    }

    #[tokio::test]
    async fn test_rotation_moves_active_file() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler_for(
            dir.path(),
            "out.jsonl",
            serde_json::json!({"rotate_max_bytes": 16}),
        );
        let event = AlarmEvent::new(1, "p", 1.0);

        handler
            .send(&event, &serde_json::json!({"v": "0123456789"}))
            .await;
        handler.send(&event, &serde_json::json!({"v": 2})).await;

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut count = 0;
        while let Some(_entry) = entries.next_entry().await.unwrap() {
            count += 1;
        }
        assert_eq!(count, 2, "expected active file plus one rotated file");
    }

    #[tokio::test]
    async fn test_missing_parent_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let handler = handler_for(&nested, "out.jsonl", serde_json::json!({}));
        let result = handler
            .send(&AlarmEvent::new(1, "p", 1.0), &serde_json::json!({}))
            .await;
        assert!(result.success, "{:?}", result.error_message);
    }

    #[test]
    fn test_rotated_path_keeps_extension() {
        let at = chrono::DateTime::parse_from_rfc3339("2025-03-01T08:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let rotated = rotated_path(Path::new("/var/log/export/out.jsonl"), at);
        assert_eq!(
            rotated,
            PathBuf::from("/var/log/export/out.20250301T080000.jsonl")
        );
    }

    #[test]
    fn test_factory_rejects_empty_path() {
        let factory = FileHandlerFactory;
        assert!(factory
            .create(&target_with(serde_json::json!({"path": ""})))
            .is_err());
    }
}
