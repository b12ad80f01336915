//! API template lookup.

use crate::model::ApiTemplate;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Source of API templates, usually backed by persistent storage.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// `Ok(None)` when no template has this id.
    async fn get_template(&self, id: &str) -> Result<Option<ApiTemplate>>;
}

/// Template store held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTemplateStore {
    templates: HashMap<String, ApiTemplate>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_templates(
        templates: impl IntoIterator<Item = ApiTemplate>,
    ) -> Self {
        let mut store = Self::new();
        for template in templates {
            store.insert(template);
        }
        store
    }

    /// Insert or replace a template under its own id.
    pub fn insert(&mut self, template: ApiTemplate) {
        self.templates.insert(template.id.clone(), template);
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn get_template(&self, id: &str) -> Result<Option<ApiTemplate>> {
        Ok(self.templates.get(id).cloned())
    }
}
