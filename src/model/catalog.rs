//! Cape Catalog
//!
//! Holds the immutable cape definitions assignments refer to by id. Editing a
//! cape swaps in a new `Arc<CapeDefinition>`; readers holding the old one keep a
//! consistent view.

use super::types::CapeId;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Cape types known to every node out of the box: `(id, display name)`.
const BUILTIN_CAPES: &[(&str, &str)] = &[
    ("vanilla", "Vanilla"),
    ("minecon_2011", "Minecon 2011"),
    ("minecon_2012", "Minecon 2012"),
    ("minecon_2013", "Minecon 2013"),
    ("minecon_2015", "Minecon 2015"),
    ("minecon_2016", "Minecon 2016"),
    ("mojang", "Mojang"),
    ("mojang_classic", "Mojang Classic"),
    ("mojang_studios", "Mojang Studios"),
    ("realms_mapmaker", "Realms Mapmaker"),
    ("cobalt", "Cobalt"),
    ("scrolls", "Scrolls"),
    ("translator", "Translator"),
    ("millionth_customer", "Millionth Customer"),
    ("prismarine", "Prismarine"),
    ("birthday", "Birthday"),
    ("migrator", "Migrator"),
    ("cherry_blossom", "Cherry Blossom"),
    ("anniversary_15th", "15th Anniversary"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapeDefinition {
    pub id: CapeId,
    pub display_name: String,
    /// Reference handed to the texture pipeline; opaque to this crate.
    pub asset: String,
}

impl CapeDefinition {
    pub fn new(id: impl AsRef<str>, display_name: impl Into<String>, asset: impl Into<String>) -> Self {
        Self {
            id: CapeId::new(id),
            display_name: display_name.into(),
            asset: asset.into(),
        }
    }
}

pub struct CapeCatalog {
    definitions: DashMap<CapeId, Arc<CapeDefinition>>,
}

impl CapeCatalog {
    /// An empty catalog.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            definitions: DashMap::new(),
        })
    }

    /// A catalog seeded with the built-in cape types.
    pub fn builtin() -> Arc<Self> {
        let catalog = Self::new();
        for (id, name) in BUILTIN_CAPES {
            catalog.replace(CapeDefinition::new(id, *name, format!("capes/{}", id)));
        }
        catalog
    }

    /// Lookup is case-insensitive.
    pub fn get(&self, id: &str) -> Option<Arc<CapeDefinition>> {
        self.definitions
            .get(&CapeId::new(id))
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &CapeId) -> bool {
        self.definitions.contains_key(id)
    }

    /// Installs a definition, replacing any previous one with the same id.
    /// Returns the definition that was replaced.
    pub fn replace(&self, definition: CapeDefinition) -> Option<Arc<CapeDefinition>> {
        let id = definition.id.clone();
        let previous = self.definitions.insert(id.clone(), Arc::new(definition));
        if previous.is_some() {
            tracing::info!("Replaced cape definition {}", id);
        }
        previous
    }

    /// All definitions sorted by id.
    pub fn list(&self) -> Vec<Arc<CapeDefinition>> {
        let mut all: Vec<Arc<CapeDefinition>> = self
            .definitions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
