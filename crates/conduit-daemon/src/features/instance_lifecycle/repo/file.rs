use crate::features::instance_lifecycle::repo::Store;
use crate::shared::error::{DaemonError, DaemonResult};
use crate::shared::types::{Instance, Operation};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, info};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    #[serde(default)]
    instances: BTreeMap<String, Instance>,
    #[serde(default)]
    operations: BTreeMap<String, Operation>,
}

/// Store backed by a single JSON file.
///
/// Every mutation rewrites the whole document through a temp file in the same
/// directory, fsyncs it and renames it over the original, so a crash leaves
/// either the old or the new state on disk.
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<Option<StoreDocument>>,
}

impl JsonFileStore {
    pub async fn open(path: impl AsRef<Path>) -> DaemonResult<Self> {
        let path = path.as_ref().to_path_buf();
        let load_path = path.clone();
        let document = tokio::task::spawn_blocking(move || load_document(&load_path))
            .await
            .map_err(|e| DaemonError::StorageError(format!("store open task failed: {e}")))??;

        info!(
            path = %path.display(),
            instances = document.instances.len(),
            operations = document.operations.len(),
            "Opened store"
        );

        Ok(Self {
            path,
            state: Mutex::new(Some(document)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read<T>(&self, f: impl FnOnce(&StoreDocument) -> T) -> DaemonResult<T> {
        let state = self.state.lock().await;
        let document = state.as_ref().ok_or_else(closed)?;
        Ok(f(document))
    }

    /// Applies `f` to a copy of the document, persists it, then swaps it in.
    /// The lock is held across the write so writes reach disk in order.
    async fn mutate<T>(&self, f: impl FnOnce(&mut StoreDocument) -> T) -> DaemonResult<T> {
        let mut state = self.state.lock().await;
        let current = state.as_ref().ok_or_else(closed)?;

        let mut next = current.clone();
        let result = f(&mut next);

        let bytes = serde_json::to_vec_pretty(&next)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(|e| DaemonError::StorageError(format!("store write task failed: {e}")))??;

        *state = Some(next);
        Ok(result)
    }
}

fn closed() -> DaemonError {
    DaemonError::StorageError("store is closed".to_string())
}

fn load_document(path: &Path) -> DaemonResult<StoreDocument> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    if !path.exists() {
        let document = StoreDocument {
            version: FORMAT_VERSION,
            ..StoreDocument::default()
        };
        write_atomically(path, &serde_json::to_vec_pretty(&document)?)?;
        return Ok(document);
    }

    let bytes = std::fs::read(path)?;
    let document: StoreDocument = serde_json::from_slice(&bytes).map_err(|e| {
        DaemonError::StorageError(format!("corrupt store file {}: {e}", path.display()))
    })?;

    if document.version > FORMAT_VERSION {
        return Err(DaemonError::StorageError(format!(
            "store file {} has unsupported format version {}",
            path.display(),
            document.version
        )));
    }

    Ok(document)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> DaemonResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| DaemonError::StorageError(e.error.to_string()))?;

    // Make the rename itself durable.
    if let Ok(dir_handle) = std::fs::File::open(&dir) {
        let _ = dir_handle.sync_all();
    }

    debug!(path = %path.display(), bytes = bytes.len(), "Store flushed");
    Ok(())
}

#[async_trait]
impl Store for JsonFileStore {
    async fn save_instance(&self, instance: &Instance) -> DaemonResult<()> {
        let instance = instance.clone();
        self.mutate(move |doc| {
            doc.instances.insert(instance.instance_id.clone(), instance);
        })
        .await
    }

    async fn get_instance(&self, instance_id: &str) -> DaemonResult<Option<Instance>> {
        self.read(|doc| doc.instances.get(instance_id).cloned()).await
    }

    async fn list_instances(&self) -> DaemonResult<Vec<Instance>> {
        let mut list = self
            .read(|doc| doc.instances.values().cloned().collect::<Vec<_>>())
            .await?;
        list.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        Ok(list)
    }

    async fn delete_instance(&self, instance_id: &str) -> DaemonResult<bool> {
        if !self
            .read(|doc| doc.instances.contains_key(instance_id))
            .await?
        {
            return Ok(false);
        }
        self.mutate(|doc| doc.instances.remove(instance_id).is_some())
            .await
    }

    async fn save_operation(&self, operation: &Operation) -> DaemonResult<()> {
        let operation = operation.clone();
        self.mutate(move |doc| {
            doc.operations
                .insert(operation.operation_id.clone(), operation);
        })
        .await
    }

    async fn get_operation(&self, operation_id: &str) -> DaemonResult<Option<Operation>> {
        self.read(|doc| doc.operations.get(operation_id).cloned())
            .await
    }

    async fn list_operations(&self) -> DaemonResult<Vec<Operation>> {
        let mut list = self
            .read(|doc| doc.operations.values().cloned().collect::<Vec<_>>())
            .await?;
        list.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.operation_id.cmp(&b.operation_id))
        });
        Ok(list)
    }

    async fn close(&self) -> DaemonResult<()> {
        let mut state = self.state.lock().await;
        if state.take().is_some() {
            info!(path = %self.path.display(), "Closed store");
        }
        Ok(())
    }
}
