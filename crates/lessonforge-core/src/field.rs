use serde::{Deserialize, Serialize};
use std::fmt;

use crate::generation_config::GenerationConfig;

/// Stable identifier of a field within a lesson template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldId(String);

impl FieldId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FieldId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for FieldId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Template section a field belongs to. Designer fields are always generated
/// before builder fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Designer,
    Builder,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Section::Designer => write!(f, "designer"),
            Section::Builder => write!(f, "builder"),
        }
    }
}

/// Shape of a multi-item field (e.g. a five question multiple-choice set).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSetSpec {
    /// Exact number of items the AI service must return
    #[serde(default = "default_item_count")]
    pub item_count: usize,
    /// Labels of the choices every item must carry, in display order
    #[serde(default = "default_choice_labels")]
    pub choice_labels: Vec<String>,
}

impl Default for ItemSetSpec {
    fn default() -> Self {
        Self {
            item_count: default_item_count(),
            choice_labels: default_choice_labels(),
        }
    }
}

fn default_item_count() -> usize {
    5
}

fn default_choice_labels() -> Vec<String> {
    ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect()
}

/// Closed set of field kinds. Per-kind behaviour is selected by matching on
/// this enum, never by comparing type strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldType {
    Text,
    RichText,
    ItemSet(ItemSetSpec),
    Image,
}

impl FieldType {
    pub fn label(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::RichText => "rich_text",
            FieldType::ItemSet(_) => "item_set",
            FieldType::Image => "image",
        }
    }
}

/// Static description of one content field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub id: FieldId,
    /// Display name, also used as the label in prompt context lines
    pub name: String,
    pub field_type: FieldType,
    pub section: Section,
    #[serde(default)]
    pub ai_enabled: bool,
    /// Fields that consume this one refuse to start while it is empty
    #[serde(default)]
    pub required_for_generation: bool,
    /// Declared dependencies, in prompt order
    #[serde(default)]
    pub context_field_ids: Vec<FieldId>,
    /// Position within the section
    #[serde(default)]
    pub order: u32,
    /// Template-level generation defaults
    #[serde(default)]
    pub template_config: GenerationConfig,
}

impl Field {
    pub fn new(id: impl Into<FieldId>, name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            field_type,
            section: Section::Designer,
            ai_enabled: false,
            required_for_generation: false,
            context_field_ids: Vec::new(),
            order: 0,
            template_config: GenerationConfig::default(),
        }
    }

    pub fn in_section(mut self, section: Section, order: u32) -> Self {
        self.section = section;
        self.order = order;
        self
    }

    pub fn ai_enabled(mut self, task_prompt: impl Into<String>) -> Self {
        self.ai_enabled = true;
        self.template_config.task_prompt = task_prompt.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required_for_generation = true;
        self
    }

    /// Declares dependencies and seeds the template config with the same ids.
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<FieldId>,
    {
        self.context_field_ids = ids.into_iter().map(Into::into).collect();
        self.template_config.context_field_ids = self.context_field_ids.clone();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_type_serde_tagging() {
        let ty = FieldType::ItemSet(ItemSetSpec::default());
        let json = serde_json::to_value(&ty).unwrap();
        assert_eq!(json["kind"], "item_set");
        assert_eq!(json["item_count"], 5);

        let back: FieldType = serde_json::from_value(json).unwrap();
        assert_eq!(back, ty);
    }

    #[test]
    fn test_builder_seeds_template_context() {
        let field = Field::new("b", "B", FieldType::Text)
            .ai_enabled("Write B")
            .depends_on(["a"]);
        assert_eq!(field.context_field_ids, vec![FieldId::from("a")]);
        assert_eq!(field.template_config.context_field_ids, field.context_field_ids);
        assert!(field.ai_enabled);
    }
}
