//! Storage backend selection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use crate::config::{StorageBackend, StoreConfig};

use super::{MemoryStorage, PersistentStorage, SharedStorage};

/// Configured path (relative paths resolve against the working directory),
/// else `campaignd` under the platform data directory.
fn resolve_data_dir(config_path: Option<&Path>) -> PathBuf {
    if let Some(path) = config_path {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        return std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path);
    }

    dirs::data_dir()
        .map(|p| p.join("campaignd"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".local/share/campaignd"))
                .unwrap_or_else(|| PathBuf::from("./data"))
        })
}

/// Open the configured backend. Campaign and ledger state is lost on restart
/// with the memory backend.
pub async fn create_storage(config: &StoreConfig) -> anyhow::Result<SharedStorage> {
    match config.backend {
        StorageBackend::Memory => {
            tracing::warn!("using in-memory storage; campaigns and webhook ledger will not survive a restart");
            Ok(Arc::new(MemoryStorage::new()))
        }
        StorageBackend::Fjall => {
            let data_dir = resolve_data_dir(config.path.as_deref());
            std::fs::create_dir_all(&data_dir)
                .with_context(|| format!("create data directory {}", data_dir.display()))?;
            tracing::info!(path = %data_dir.display(), "using persistent storage");
            Ok(PersistentStorage::open(&data_dir).await? as SharedStorage)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_data_dir_explicit_absolute() {
        let path = Path::new("/custom/data/path");
        assert_eq!(resolve_data_dir(Some(path)), path);
    }

    #[test]
    fn test_resolve_data_dir_explicit_relative() {
        let resolved = resolve_data_dir(Some(Path::new("./my-data")));
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("my-data"));
    }

    #[test]
    fn test_resolve_data_dir_none_uses_system() {
        let resolved = resolve_data_dir(None);
        let path_str = resolved.to_string_lossy();
        assert!(
            path_str.contains("campaignd") || path_str.ends_with("data"),
            "unexpected data dir: {}",
            path_str
        );
    }

    #[tokio::test]
    async fn test_create_memory_storage() {
        let storage = create_storage(&StoreConfig::default()).await.unwrap();
        let id = storage
            .create_campaign(crate::store::Campaign::new("c", "hi", 1))
            .unwrap();
        assert!(storage.get_campaign(id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_fjall_storage_in_missing_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("state").join("campaignd");
        let config = StoreConfig {
            backend: StorageBackend::Fjall,
            path: Some(nested.clone()),
        };
        let storage = create_storage(&config).await.unwrap();
        assert_eq!(storage.stats().unwrap().campaigns, 0);
        assert!(nested.is_dir());
    }
}
