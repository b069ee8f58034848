// SPDX-License-Identifier: Apache-2.0

//! In-memory metadata catalog.
//!
//! Names are matched case-insensitively; the spelling used at registration is
//! what `full_name` reports.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use tessera_core::command::MetadataId;
use tessera_core::{EngineError, EngineResult, MetadataService, VdbRef};

/// Model reported for temporary objects.
pub const TEMPORARY_MODEL: &str = "__temp__";

struct ModelEntry {
    name: String,
    binding: String,
    private_in: HashSet<VdbRef>,
}

struct ObjectEntry {
    full_name: String,
    model: String,
}

#[derive(Default)]
pub struct InMemoryCatalog {
    models: RwLock<HashMap<String, ModelEntry>>,
    objects: RwLock<HashMap<String, ObjectEntry>>,
}

fn key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model served by `binding`. Models are public by default.
    pub fn add_model(&self, name: &str, binding: &str) -> MetadataId {
        self.models.write().insert(
            key(name),
            ModelEntry {
                name: name.to_string(),
                binding: binding.to_string(),
                private_in: HashSet::new(),
            },
        );
        MetadataId::catalog(name)
    }

    pub fn set_model_public(&self, vdb: &VdbRef, model: &str, public: bool) -> EngineResult<()> {
        let mut models = self.models.write();
        let entry = models
            .get_mut(&key(model))
            .ok_or_else(|| EngineError::invalid_argument(format!("unknown model {model}")))?;
        if public {
            entry.private_in.remove(vdb);
        } else {
            entry.private_in.insert(vdb.clone());
        }
        Ok(())
    }

    /// Registers a group (table, view or procedure) named `model.name`.
    pub fn add_group(&self, model: &str, name: &str) -> EngineResult<MetadataId> {
        let model_name = self.model_name(model)?;
        let full_name = format!("{model_name}.{name}");
        self.objects.write().insert(
            key(&full_name),
            ObjectEntry {
                full_name: full_name.clone(),
                model: model_name,
            },
        );
        Ok(MetadataId::catalog(full_name))
    }

    /// Registers an element `name` of an existing group.
    pub fn add_element(&self, group: &MetadataId, name: &str) -> EngineResult<MetadataId> {
        let (group_name, model) = {
            let objects = self.objects.read();
            let entry = objects.get(&key(group.key())).ok_or_else(|| {
                EngineError::invalid_argument(format!("unknown group {}", group.key()))
            })?;
            (entry.full_name.clone(), entry.model.clone())
        };
        let full_name = format!("{group_name}.{name}");
        self.objects.write().insert(
            key(&full_name),
            ObjectEntry {
                full_name: full_name.clone(),
                model,
            },
        );
        Ok(MetadataId::catalog(full_name))
    }

    fn model_name(&self, model: &str) -> EngineResult<String> {
        self.models
            .read()
            .get(&key(model))
            .map(|m| m.name.clone())
            .ok_or_else(|| EngineError::invalid_argument(format!("unknown model {model}")))
    }

    fn object<T>(&self, id: &str, f: impl FnOnce(&ObjectEntry) -> T) -> EngineResult<T> {
        let objects = self.objects.read();
        objects
            .get(&key(id))
            .map(f)
            .ok_or_else(|| EngineError::invalid_argument(format!("no metadata for {id}")))
    }
}

impl MetadataService for InMemoryCatalog {
    fn full_name(&self, id: &MetadataId) -> EngineResult<String> {
        match id {
            MetadataId::Temporary(name) => Ok(name.clone()),
            MetadataId::Catalog(name) => {
                if let Some(model) = self.models.read().get(&key(name)) {
                    return Ok(model.name.clone());
                }
                self.object(name, |o| o.full_name.clone())
            }
        }
    }

    fn model_of(&self, id: &MetadataId) -> EngineResult<MetadataId> {
        match id {
            MetadataId::Temporary(_) => Ok(MetadataId::temporary(TEMPORARY_MODEL)),
            MetadataId::Catalog(name) => {
                if self.models.read().contains_key(&key(name)) {
                    return Ok(id.clone());
                }
                self.object(name, |o| MetadataId::catalog(o.model.clone()))
            }
        }
    }

    fn resolve_group(&self, name: &str) -> EngineResult<MetadataId> {
        self.object(name, |o| MetadataId::catalog(o.full_name.clone()))
    }

    fn resolve_element(&self, group: &MetadataId, name: &str) -> EngineResult<MetadataId> {
        let group_name = self.full_name(group)?;
        self.object(&format!("{group_name}.{name}"), |o| {
            MetadataId::catalog(o.full_name.clone())
        })
    }

    fn is_model_public(&self, vdb: &VdbRef, model: &MetadataId) -> EngineResult<bool> {
        if model.is_temporary() {
            return Ok(true);
        }
        self.models
            .read()
            .get(&key(model.key()))
            .map(|m| !m.private_in.contains(vdb))
            .ok_or_else(|| EngineError::invalid_argument(format!("unknown model {}", model.key())))
    }

    fn connector_binding(&self, _vdb: &VdbRef, model: &MetadataId) -> EngineResult<String> {
        self.models
            .read()
            .get(&key(model.key()))
            .map(|m| m.binding.clone())
            .ok_or_else(|| EngineError::invalid_argument(format!("unknown model {}", model.key())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_names_and_models() {
        let catalog = InMemoryCatalog::new();
        catalog.add_model("modelA", "pg");
        let t1 = catalog.add_group("modelA", "t1").unwrap();
        let e1 = catalog.add_element(&t1, "e1").unwrap();

        assert_eq!(catalog.full_name(&e1).unwrap(), "modelA.t1.e1");
        assert_eq!(catalog.model_of(&e1).unwrap(), MetadataId::catalog("modelA"));
        assert_eq!(catalog.resolve_group("MODELA.T1").unwrap(), t1);
        assert_eq!(catalog.resolve_element(&t1, "E1").unwrap(), e1);
        assert!(catalog.resolve_group("modelA.missing").is_err());
    }

    #[test]
    fn visibility_is_per_vdb_version() {
        let catalog = InMemoryCatalog::new();
        let model = catalog.add_model("modelB", "mongo");
        let v1 = VdbRef::new("sales", 1);
        let v2 = VdbRef::new("sales", 2);
        catalog.set_model_public(&v2, "modelB", false).unwrap();

        assert!(catalog.is_model_public(&v1, &model).unwrap());
        assert!(!catalog.is_model_public(&v2, &model).unwrap());
        assert_eq!(catalog.connector_binding(&v2, &model).unwrap(), "mongo");
    }
}
