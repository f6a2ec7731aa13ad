//! Step registry
//!
//! Holds the saved definitions as immutable `Arc` snapshots. An execution
//! clones the `Arc` when it starts, so later edits only reach executions
//! triggered after the save.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::definition::SagaDefinition;
use crate::journal::{DefinitionStore, StoreError};
use crate::validation::{validate_definition, DefinitionValidationError};
use crate::EngineError;

pub struct DefinitionRegistry {
    definitions: RwLock<HashMap<String, Arc<SagaDefinition>>>,
    store: Arc<dyn DefinitionStore>,
}

impl DefinitionRegistry {
    /// Load every persisted definition into memory
    pub fn load(store: Arc<dyn DefinitionStore>) -> Result<Self, StoreError> {
        let mut definitions = HashMap::new();
        for definition in store.list_definitions()? {
            if let Err(error) = validate_definition(&definition) {
                tracing::warn!(definition = %definition.id, error = %error, "Skipping invalid stored definition");
                continue;
            }
            definitions.insert(definition.id.clone(), Arc::new(definition));
        }
        tracing::debug!(count = definitions.len(), "Loaded saga definitions");

        Ok(Self {
            definitions: RwLock::new(definitions),
            store,
        })
    }

    /// Validate, persist and publish a definition
    pub fn save(&self, definition: SagaDefinition) -> Result<Arc<SagaDefinition>, EngineError> {
        validate_definition(&definition)?;
        self.store.save_definition(&definition)?;

        let definition = Arc::new(definition);
        self.definitions
            .write()
            .insert(definition.id.clone(), Arc::clone(&definition));
        tracing::info!(definition = %definition.id, steps = definition.step_count(), "Definition saved");
        Ok(definition)
    }

    /// Import a JSON document; `id` overrides the document's own id when given
    pub fn import(&self, document: &str, id: Option<&str>) -> Result<Arc<SagaDefinition>, EngineError> {
        let mut definition = SagaDefinition::from_json(document).map_err(|e| {
            DefinitionValidationError::invalid_document(id.unwrap_or_default(), &e)
        })?;
        if let Some(id) = id {
            definition.id = id.to_string();
        }
        self.save(definition)
    }

    pub fn get(&self, id: &str) -> Option<Arc<SagaDefinition>> {
        self.definitions.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<SagaDefinition>> {
        let mut definitions: Vec<_> = self.definitions.read().values().cloned().collect();
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        definitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::InMemoryStore;
    use serde_json::json;

    fn document(name: &str) -> String {
        json!({
            "id": "orders",
            "name": name,
            "stepGroups": [{"id": "g", "steps": [{"id": "a", "operation": "a"}]}]
        })
        .to_string()
    }

    #[test]
    fn test_saved_snapshots_are_immutable() {
        let store = Arc::new(InMemoryStore::new());
        let registry = DefinitionRegistry::load(store.clone()).unwrap();

        let first = registry.import(&document("v1"), None).unwrap();
        registry.import(&document("v2"), None).unwrap();

        assert_eq!(first.name, "v1");
        assert_eq!(registry.get("orders").unwrap().name, "v2");
        assert_eq!(store.load_definition("orders").unwrap().unwrap().name, "v2");
    }

    #[test]
    fn test_invalid_documents_are_not_saved() {
        let registry = DefinitionRegistry::load(Arc::new(InMemoryStore::new())).unwrap();

        let err = registry.import("{ not json", Some("broken")).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = registry
            .import(&json!({"id": "x", "name": "X"}).to_string(), None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(registry.list().is_empty());
    }
}
