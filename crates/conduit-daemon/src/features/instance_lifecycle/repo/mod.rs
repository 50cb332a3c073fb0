pub mod file;

pub use file::JsonFileStore;

use crate::shared::error::{DaemonError, DaemonResult};
use crate::shared::types::{Instance, Operation};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Durable storage for instance and operation records.
///
/// Implementations must be safe for concurrent use and must make every write
/// durable before returning.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace an instance record
    async fn save_instance(&self, instance: &Instance) -> DaemonResult<()>;

    /// Retrieve an instance by ID
    async fn get_instance(&self, instance_id: &str) -> DaemonResult<Option<Instance>>;

    /// List all instances, oldest first
    async fn list_instances(&self) -> DaemonResult<Vec<Instance>>;

    /// Delete an instance, returning whether it existed
    async fn delete_instance(&self, instance_id: &str) -> DaemonResult<bool>;

    /// Insert or replace an operation record
    async fn save_operation(&self, operation: &Operation) -> DaemonResult<()>;

    /// Retrieve an operation by ID
    async fn get_operation(&self, operation_id: &str) -> DaemonResult<Option<Operation>>;

    /// List all operations, oldest first
    async fn list_operations(&self) -> DaemonResult<Vec<Operation>>;

    /// Release the backing handle. Later calls fail with a storage error.
    async fn close(&self) -> DaemonResult<()> {
        Ok(())
    }
}

/// In-memory implementation of the store
#[derive(Clone, Default)]
pub struct InMemoryStore {
    instances: Arc<RwLock<HashMap<String, Instance>>>,
    operations: Arc<RwLock<HashMap<String, Operation>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> DaemonError {
    DaemonError::StorageError("Lock poisoned".to_string())
}

#[async_trait]
impl Store for InMemoryStore {
    async fn save_instance(&self, instance: &Instance) -> DaemonResult<()> {
        let mut instances = self.instances.write().map_err(poisoned)?;
        instances.insert(instance.instance_id.clone(), instance.clone());
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> DaemonResult<Option<Instance>> {
        let instances = self.instances.read().map_err(poisoned)?;
        Ok(instances.get(instance_id).cloned())
    }

    async fn list_instances(&self) -> DaemonResult<Vec<Instance>> {
        let instances = self.instances.read().map_err(poisoned)?;
        let mut list: Vec<Instance> = instances.values().cloned().collect();
        list.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        Ok(list)
    }

    async fn delete_instance(&self, instance_id: &str) -> DaemonResult<bool> {
        let mut instances = self.instances.write().map_err(poisoned)?;
        Ok(instances.remove(instance_id).is_some())
    }

    async fn save_operation(&self, operation: &Operation) -> DaemonResult<()> {
        let mut operations = self.operations.write().map_err(poisoned)?;
        operations.insert(operation.operation_id.clone(), operation.clone());
        Ok(())
    }

    async fn get_operation(&self, operation_id: &str) -> DaemonResult<Option<Operation>> {
        let operations = self.operations.read().map_err(poisoned)?;
        Ok(operations.get(operation_id).cloned())
    }

    async fn list_operations(&self) -> DaemonResult<Vec<Operation>> {
        let operations = self.operations.read().map_err(poisoned)?;
        let mut list: Vec<Operation> = operations.values().cloned().collect();
        list.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.operation_id.cmp(&b.operation_id))
        });
        Ok(list)
    }
}
