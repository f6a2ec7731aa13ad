//! LMDB-backed store
//!
//! Two named databases in one environment: `executions` keyed by the
//! zero-padded execution id (so iteration order is id order) and
//! `definitions` keyed by definition id. Values are the JSON documents.

use std::path::Path;

use heed::types::{SerdeJson, Str};
use heed::{Database, Env, EnvOpenOptions};

use crate::definition::SagaDefinition;
use crate::journal::{DefinitionStore, ExecutionStore, StoreError};
use crate::state::SagaExecution;
use crate::ExecutionId;

pub struct LmdbStore {
    env: Env,
    executions: Database<Str, SerdeJson<SagaExecution>>,
    definitions: Database<Str, SerdeJson<SagaDefinition>>,
}

impl From<heed::Error> for StoreError {
    fn from(error: heed::Error) -> Self {
        Self::Storage(error.to_string().into())
    }
}

impl LmdbStore {
    /// Open (creating if needed) the environment at `path`
    pub fn open(path: impl AsRef<Path>, map_size_mb: usize) -> Result<Self, StoreError> {
        std::fs::create_dir_all(path.as_ref())
            .map_err(|e| StoreError::Storage(e.to_string().into()))?;

        // SAFETY: the environment is opened once per path by this process
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb.max(1) * 1024 * 1024)
                .max_dbs(2)
                .open(path.as_ref())?
        };

        let mut wtxn = env.write_txn()?;
        let executions = env.create_database(&mut wtxn, Some("executions"))?;
        let definitions = env.create_database(&mut wtxn, Some("definitions"))?;
        wtxn.commit()?;

        tracing::info!(path = %path.as_ref().display(), "Opened LMDB store");

        Ok(Self {
            env,
            executions,
            definitions,
        })
    }
}

impl ExecutionStore for LmdbStore {
    fn save_execution(&self, execution: &SagaExecution) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn()?;
        self.executions
            .put(&mut wtxn, &execution.id.storage_key(), execution)?;
        wtxn.commit()?;
        Ok(())
    }

    fn load_execution(&self, id: ExecutionId) -> Result<Option<SagaExecution>, StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.executions.get(&rtxn, &id.storage_key())?)
    }

    fn list_executions(&self) -> Result<Vec<SagaExecution>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let mut executions = Vec::new();
        for entry in self.executions.iter(&rtxn)? {
            let (_, execution) = entry?;
            executions.push(execution);
        }
        Ok(executions)
    }
}

impl DefinitionStore for LmdbStore {
    fn save_definition(&self, definition: &SagaDefinition) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn()?;
        self.definitions.put(&mut wtxn, &definition.id, definition)?;
        wtxn.commit()?;
        Ok(())
    }

    fn load_definition(&self, id: &str) -> Result<Option<SagaDefinition>, StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.definitions.get(&rtxn, id)?)
    }

    fn list_definitions(&self) -> Result<Vec<SagaDefinition>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let mut definitions = Vec::new();
        for entry in self.definitions.iter(&rtxn)? {
            let (_, definition) = entry?;
            definitions.push(definition);
        }
        Ok(definitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SagaStatus;
    use serde_json::json;

    fn definition() -> SagaDefinition {
        serde_json::from_value(json!({
            "id": "orders",
            "name": "Orders",
            "stepGroups": [{"id": "g", "steps": [{"id": "a", "operation": "a"}]}]
        }))
        .unwrap()
    }

    #[test]
    fn test_executions_survive_reopen_in_id_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let def = definition();

        {
            let store = LmdbStore::open(dir.path(), 16).unwrap();
            store.save_definition(&def).unwrap();
            for id in [10, 2, 9] {
                let execution = SagaExecution::new(ExecutionId::new(id), &def, json!({}), 1);
                store.save_execution(&execution).unwrap();
            }
            let mut paused = store.load_execution(ExecutionId::new(9)).unwrap().unwrap();
            paused.transition(SagaStatus::Paused, 2).unwrap();
            store.save_execution(&paused).unwrap();
        }

        let store = LmdbStore::open(dir.path(), 16).unwrap();
        let ids: Vec<u64> = store
            .list_executions()
            .unwrap()
            .iter()
            .map(|e| e.id.get())
            .collect();
        assert_eq!(ids, vec![2, 9, 10]);
        assert_eq!(
            store.load_execution(ExecutionId::new(9)).unwrap().unwrap().status,
            SagaStatus::Paused
        );
        assert_eq!(store.load_definition("orders").unwrap(), Some(def));
        assert!(store.load_definition("missing").unwrap().is_none());
    }
}
