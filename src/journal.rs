//! Execution and definition storage traits

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::definition::SagaDefinition;
use crate::state::SagaExecution;
use crate::ExecutionId;

/// Durable home of execution snapshots.
///
/// The runner writes the whole snapshot at every step boundary, so a store
/// only ever needs last-writer-wins semantics per execution id.
pub trait ExecutionStore: Send + Sync + 'static {
    fn save_execution(&self, execution: &SagaExecution) -> Result<(), StoreError>;
    fn load_execution(&self, id: ExecutionId) -> Result<Option<SagaExecution>, StoreError>;
    /// All executions, ascending by id
    fn list_executions(&self) -> Result<Vec<SagaExecution>, StoreError>;
}

/// Persisted saga definitions, stored as the exported document
pub trait DefinitionStore: Send + Sync + 'static {
    fn save_definition(&self, definition: &SagaDefinition) -> Result<(), StoreError>;
    fn load_definition(&self, id: &str) -> Result<Option<SagaDefinition>, StoreError>;
    fn list_definitions(&self) -> Result<Vec<SagaDefinition>, StoreError>;
}

/// A backend that holds both executions and definitions
pub trait SagaStore: ExecutionStore + DefinitionStore {}

impl<T: ExecutionStore + DefinitionStore> SagaStore for T {}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(Box<str>),
    #[error("Serialization error: {0}")]
    Serialization(Box<str>),
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string().into())
    }
}

/// In-memory store for tests and the `memory` storage kind
pub struct InMemoryStore {
    executions: RwLock<BTreeMap<u64, SagaExecution>>,
    definitions: RwLock<HashMap<String, SagaDefinition>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            executions: RwLock::new(BTreeMap::new()),
            definitions: RwLock::new(HashMap::new()),
        }
    }
}

impl ExecutionStore for InMemoryStore {
    fn save_execution(&self, execution: &SagaExecution) -> Result<(), StoreError> {
        let mut data = self
            .executions
            .write()
            .map_err(|e| StoreError::Storage(e.to_string().into()))?;
        data.insert(execution.id.get(), execution.clone());
        Ok(())
    }

    fn load_execution(&self, id: ExecutionId) -> Result<Option<SagaExecution>, StoreError> {
        let data = self
            .executions
            .read()
            .map_err(|e| StoreError::Storage(e.to_string().into()))?;
        Ok(data.get(&id.get()).cloned())
    }

    fn list_executions(&self) -> Result<Vec<SagaExecution>, StoreError> {
        let data = self
            .executions
            .read()
            .map_err(|e| StoreError::Storage(e.to_string().into()))?;
        Ok(data.values().cloned().collect())
    }
}

impl DefinitionStore for InMemoryStore {
    fn save_definition(&self, definition: &SagaDefinition) -> Result<(), StoreError> {
        let mut data = self
            .definitions
            .write()
            .map_err(|e| StoreError::Storage(e.to_string().into()))?;
        data.insert(definition.id.clone(), definition.clone());
        Ok(())
    }

    fn load_definition(&self, id: &str) -> Result<Option<SagaDefinition>, StoreError> {
        let data = self
            .definitions
            .read()
            .map_err(|e| StoreError::Storage(e.to_string().into()))?;
        Ok(data.get(id).cloned())
    }

    fn list_definitions(&self) -> Result<Vec<SagaDefinition>, StoreError> {
        let data = self
            .definitions
            .read()
            .map_err(|e| StoreError::Storage(e.to_string().into()))?;
        let mut definitions: Vec<_> = data.values().cloned().collect();
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(definitions)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Persist a snapshot, logging instead of failing the execution
pub(crate) fn checkpoint(store: &dyn ExecutionStore, execution: &SagaExecution) {
    if let Err(error) = store.save_execution(execution) {
        tracing::error!(execution_id = %execution.id, error = %error, "Failed to persist execution snapshot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_in_memory_lists_in_id_order() {
        let store = InMemoryStore::new();
        let definition: SagaDefinition = serde_json::from_value(json!({
            "id": "flow",
            "name": "Flow",
            "stepGroups": [{"id": "g", "steps": [{"id": "a", "operation": "a"}]}]
        }))
        .unwrap();

        for id in [3, 1, 2] {
            let execution = SagaExecution::new(ExecutionId::new(id), &definition, json!(null), 0);
            store.save_execution(&execution).unwrap();
        }
        store.save_definition(&definition).unwrap();

        let ids: Vec<u64> = store
            .list_executions()
            .unwrap()
            .into_iter()
            .map(|e| e.id.get())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(store.load_execution(ExecutionId::new(4)).unwrap().is_none());
        assert_eq!(store.list_definitions().unwrap().len(), 1);
    }
}
