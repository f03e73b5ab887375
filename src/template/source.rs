use async_trait::async_trait;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::path::mangle;
use crate::core::error::CoreResult;
use crate::core::shared::schema::message_templates;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = message_templates)]
pub struct MessageTemplate {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub content: String,
    pub content_type: String,
}

impl MessageTemplate {
    /// A reference matches the slug itself or its `UPPER_SNAKE` mangling.
    pub fn answers_to(&self, reference: &str) -> bool {
        self.slug == reference || mangle(&self.slug) == reference
    }
}

#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn find_by_reference(&self, reference: &str) -> CoreResult<Option<MessageTemplate>>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTemplateSource {
    templates: Vec<MessageTemplate>,
}

impl MemoryTemplateSource {
    pub fn new(templates: Vec<MessageTemplate>) -> Self {
        Self { templates }
    }

    pub fn insert(&mut self, slug: &str, content: &str) {
        let id = self.templates.len() as i64 + 1;
        self.templates.push(MessageTemplate {
            id,
            slug: slug.to_string(),
            name: slug.to_string(),
            content: content.to_string(),
            content_type: "text/plain".to_string(),
        });
    }
}

#[async_trait]
impl TemplateSource for MemoryTemplateSource {
    async fn find_by_reference(&self, reference: &str) -> CoreResult<Option<MessageTemplate>> {
        Ok(self
            .templates
            .iter()
            .find(|t| t.answers_to(reference))
            .cloned())
    }
}
