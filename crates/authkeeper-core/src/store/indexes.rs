//! Index definitions.
//!
//! Index internals live elsewhere; this module only keeps the definitions
//! so they can be listed, dumped and restored.

use std::collections::BTreeSet;
use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::IndexError;

/// One component of an index key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IndexKey {
    pub field: String,
    /// `1` ascending, `-1` descending.
    pub order: i32,
}

/// An index definition on a namespace (`db.collection`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IndexDefinition {
    pub name: String,
    pub ns: String,
    pub key: Vec<IndexKey>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDefinition {
    /// Database part of the namespace.
    #[must_use]
    pub fn db(&self) -> &str {
        self.ns.split_once('.').map_or(self.ns.as_str(), |(db, _)| db)
    }

    /// Collection part of the namespace.
    #[must_use]
    pub fn collection(&self) -> &str {
        self.ns.split_once('.').map_or("", |(_, coll)| coll)
    }

    /// Conventional name for a key: `a_1_b_-1`.
    #[must_use]
    pub fn default_name(key: &[IndexKey]) -> String {
        key.iter()
            .map(|k| format!("{}_{}", k.field, k.order))
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Parse the `{key: {a: 1}, name?, unique?}` form used by commands.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is missing, empty or has a non-integer order.
    pub fn from_spec(
        db: &str,
        collection: &str,
        spec: &Map<String, Value>,
    ) -> Result<Self, IndexError> {
        let key_doc = spec.get("key").and_then(Value::as_object).ok_or_else(|| {
            IndexError::InvalidDefinition("index spec requires a key document".into())
        })?;

        let key = key_doc
            .iter()
            .map(|(field, order)| {
                order
                    .as_i64()
                    .and_then(|o| i32::try_from(o).ok())
                    .filter(|o| *o == 1 || *o == -1)
                    .map(|order| IndexKey {
                        field: field.clone(),
                        order,
                    })
                    .ok_or_else(|| {
                        IndexError::InvalidDefinition(format!("bad order for key field '{field}'"))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let name = match spec.get("name") {
            Some(Value::String(name)) => name.clone(),
            Some(_) => {
                return Err(IndexError::InvalidDefinition(
                    "index name must be a string".into(),
                ))
            }
            None => Self::default_name(&key),
        };

        let def = Self {
            name,
            ns: format!("{db}.{collection}"),
            key,
            unique: spec.get("unique").and_then(Value::as_bool).unwrap_or(false),
        };
        def.validate()?;
        Ok(def)
    }

    /// Check the definition is usable.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty name, key or collection.
    pub fn validate(&self) -> Result<(), IndexError> {
        if self.name.is_empty() {
            return Err(IndexError::InvalidDefinition("index name is empty".into()));
        }
        if self.key.is_empty() {
            return Err(IndexError::InvalidDefinition("index key is empty".into()));
        }
        if self.collection().is_empty() {
            return Err(IndexError::InvalidDefinition(format!(
                "namespace '{}' has no collection",
                self.ns
            )));
        }
        Ok(())
    }

    /// Same definition in another database.
    #[must_use]
    pub fn rehome(mut self, db: &str) -> Self {
        self.ns = format!("{db}.{}", self.collection());
        self
    }

    /// Command-facing view.
    #[must_use]
    pub fn to_info(&self) -> Value {
        let mut key = Map::new();
        for k in &self.key {
            key.insert(k.field.clone(), Value::from(k.order));
        }
        let mut info = Map::new();
        info.insert("name".into(), Value::String(self.name.clone()));
        info.insert("ns".into(), Value::String(self.ns.clone()));
        info.insert("key".into(), Value::Object(key));
        if self.unique {
            info.insert("unique".into(), Value::Bool(true));
        }
        Value::Object(info)
    }
}

/// Collaborator owning index definitions.
pub trait IndexCatalog: Send + Sync + fmt::Debug {
    /// All definitions in a database.
    fn list_indexes(&self, db: &str) -> Vec<IndexDefinition>;

    /// Create or replace a definition. Returns true if it did not exist before.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition is invalid or belongs to another database.
    fn create_index(&self, db: &str, def: IndexDefinition) -> Result<bool, IndexError>;

    /// Remove every definition in a database. Returns how many were removed.
    fn drop_indexes(&self, db: &str) -> usize;

    /// Databases with at least one definition.
    fn databases(&self) -> BTreeSet<String>;
}

/// In-memory catalog keyed by `(ns, name)`.
#[derive(Debug, Default)]
pub struct InMemoryIndexCatalog {
    indexes: DashMap<(String, String), IndexDefinition>,
}

impl InMemoryIndexCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }
}

impl IndexCatalog for InMemoryIndexCatalog {
    fn list_indexes(&self, db: &str) -> Vec<IndexDefinition> {
        let mut defs: Vec<_> = self
            .indexes
            .iter()
            .filter(|entry| entry.value().db() == db)
            .map(|entry| entry.value().clone())
            .collect();
        defs.sort_by(|a, b| (&a.ns, &a.name).cmp(&(&b.ns, &b.name)));
        defs
    }

    fn create_index(&self, db: &str, def: IndexDefinition) -> Result<bool, IndexError> {
        def.validate()?;
        if def.db() != db {
            return Err(IndexError::InvalidDefinition(format!(
                "namespace '{}' is not in database '{db}'",
                def.ns
            )));
        }
        let key = (def.ns.clone(), def.name.clone());
        Ok(self.indexes.insert(key, def).is_none())
    }

    fn drop_indexes(&self, db: &str) -> usize {
        let before = self.indexes.len();
        self.indexes.retain(|_, def| def.db() != db);
        before.saturating_sub(self.indexes.len())
    }

    fn databases(&self) -> BTreeSet<String> {
        self.indexes
            .iter()
            .map(|entry| entry.value().db().to_string())
            .collect()
    }
}
