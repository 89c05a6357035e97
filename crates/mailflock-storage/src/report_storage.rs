//! File storage for exported reports

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailflock_common::config::ReportConfig;
use mailflock_common::types::UserId;
use mailflock_common::{Error, Result};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Report storage trait
#[async_trait]
pub trait ReportStorage: Send + Sync {
    /// Write a report and return its relative path
    async fn store(&self, path: &str, data: &[u8]) -> Result<String>;

    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    async fn delete(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;
}

/// Relative path of a report: `<user>/<resource>-<timestamp>.csv`
pub fn report_path(user_id: UserId, resource: &str, at: DateTime<Utc>) -> String {
    format!("{}/{}-{}.csv", user_id, resource, at.format("%Y%m%dT%H%M%S%.3fZ"))
}

/// Reports on the local filesystem
pub struct LocalReportStorage {
    base_path: PathBuf,
}

impl LocalReportStorage {
    pub fn new(config: &ReportConfig) -> Result<Self> {
        Self::from_path(&config.path)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .map_err(|e| Error::Storage(format!("Failed to create report directory: {}", e)))?;

        info!(path = %path.display(), "Initialized report storage");

        Ok(Self {
            base_path: path.to_path_buf(),
        })
    }

    /// Resolve a relative path under the base directory.
    /// Only plain path segments are accepted.
    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if path.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(Error::Storage(format!("Invalid report path: {}", path)));
        }
        Ok(self.base_path.join(relative))
    }
}

#[async_trait]
impl ReportStorage for LocalReportStorage {
    async fn store(&self, path: &str, data: &[u8]) -> Result<String> {
        let full_path = self.full_path(path)?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("Failed to create directory: {}", e)))?;
        }

        let mut file = fs::File::create(&full_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create report: {}", e)))?;
        file.write_all(data)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write report: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| Error::Storage(format!("Failed to write report: {}", e)))?;

        debug!(path, size = data.len(), "Stored report");
        Ok(path.to_string())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path)?;
        fs::read(&full_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to read report: {}", e)))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;
        fs::remove_file(&full_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to delete report: {}", e)))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path)?;
        Ok(fs::try_exists(&full_path).await.unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_read_delete() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalReportStorage::from_path(temp_dir.path()).unwrap();

        let data = b"id,email\n1,john@example.com\n";
        let path = storage.store("7/subscribers.csv", data).await.unwrap();
        assert_eq!(path, "7/subscribers.csv");
        assert!(storage.exists("7/subscribers.csv").await.unwrap());

        assert_eq!(storage.read("7/subscribers.csv").await.unwrap(), data);

        storage.delete("7/subscribers.csv").await.unwrap();
        assert!(!storage.exists("7/subscribers.csv").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_paths_outside_base() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalReportStorage::from_path(temp_dir.path()).unwrap();

        assert!(storage.store("../escape.csv", b"x").await.is_err());
        assert!(storage.store("/etc/passwd", b"x").await.is_err());
        assert!(storage.read("7/../../secret").await.is_err());
        assert!(storage.store("", b"x").await.is_err());
        assert!(storage.store("7/ok.csv", b"x").await.is_ok());
    }

    #[test]
    fn test_report_path() {
        let at = Utc.with_ymd_and_hms(2024, 5, 17, 8, 30, 0).unwrap();
        assert_eq!(
            report_path(7, "subscribers", at),
            "7/subscribers-20240517T083000.000Z.csv"
        );
    }
}
