//! Per-run snapshot of the model catalog and project credentials.
//!
//! Both are pure lookups, read once at run start and immutable for the
//! run's duration so every step sees the same provider/credential view.

use crate::model::ModelCatalogEntry;
use crate::storage::{Store, StoreError};
use std::collections::HashMap;

pub struct ProjectSnapshot {
    credentials: HashMap<String, String>,
    catalog: HashMap<String, ModelCatalogEntry>,
}

impl ProjectSnapshot {
    pub fn load(store: &Store, project_id: &str) -> Result<Self, StoreError> {
        Ok(Self {
            credentials: store.credentials_for_project(project_id)?,
            catalog: store.model_catalog()?,
        })
    }

    #[cfg(test)]
    pub fn from_parts(
        credentials: HashMap<String, String>,
        catalog: HashMap<String, ModelCatalogEntry>,
    ) -> Self {
        Self {
            credentials,
            catalog,
        }
    }

    /// Token for a provider, if the project has one configured.
    pub fn credential(&self, provider: &str) -> Option<&str> {
        self.credentials.get(provider).map(String::as_str)
    }

    /// Catalog entry for a model name; `None` means the model is not
    /// supported.
    pub fn model(&self, name: &str) -> Option<&ModelCatalogEntry> {
        self.catalog.get(name)
    }
}
