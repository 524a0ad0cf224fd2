use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::field::{FieldId, FieldType};
use crate::richtext::html_to_markdown;

/// One entry of an item-set field.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SetItem {
    /// Canonical content, the only part the model ever sees
    pub text: String,
    /// Standard tags extracted for the editor
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub standards: Vec<String>,
    /// Cached annotation of where the item came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl SetItem {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Stored reference to an uploaded image.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub url: String,
    #[serde(default)]
    pub alt_text: Option<String>,
    #[serde(default)]
    pub model_used: Option<String>,
}

/// Current content of a field. The variant follows the field's type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    /// HTML produced by the rich text editor
    RichText(String),
    Items(Vec<SetItem>),
    Image(ImageDescriptor),
}

impl FieldValue {
    /// Type-aware emptiness: blank strings, empty lists and item-sets whose
    /// every item is blank all count as empty.
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::RichText(html) => html_to_markdown(html).trim().is_empty(),
            FieldValue::Items(items) => items.iter().all(SetItem::is_empty),
            FieldValue::Image(image) => image.url.trim().is_empty(),
        }
    }

    /// Serialize the value for inclusion in a prompt's CONTEXT block.
    /// Item bookkeeping (standards tags, source annotations) is left out.
    pub fn render_for_prompt(&self) -> String {
        match self {
            FieldValue::Text(s) => s.trim().to_string(),
            FieldValue::RichText(html) => html_to_markdown(html),
            FieldValue::Items(items) => items
                .iter()
                .filter(|item| !item.is_empty())
                .map(|item| item.text.trim())
                .collect::<Vec<_>>()
                .join("\n"),
            FieldValue::Image(image) => match image.alt_text.as_deref() {
                Some(alt) if !alt.trim().is_empty() => format!("[Image: {}]", alt.trim()),
                _ => "[Image]".to_string(),
            },
        }
    }

    /// Whether this value has the shape the field type expects.
    pub fn matches_type(&self, field_type: &FieldType) -> bool {
        matches!(
            (self, field_type),
            (FieldValue::Text(_), FieldType::Text)
                | (FieldValue::RichText(_), FieldType::RichText)
                | (FieldValue::Items(_), FieldType::ItemSet(_))
                | (FieldValue::Image(_), FieldType::Image)
        )
    }
}

/// Explicit value context for one lesson, passed by the caller into every
/// generation step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldValues {
    values: BTreeMap<FieldId, FieldValue>,
}

impl FieldValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &FieldId) -> Option<&FieldValue> {
        self.values.get(id)
    }

    /// Returns the previous value, if any.
    pub fn set(&mut self, id: FieldId, value: FieldValue) -> Option<FieldValue> {
        self.values.insert(id, value)
    }

    pub fn remove(&mut self, id: &FieldId) -> Option<FieldValue> {
        self.values.remove(id)
    }

    /// Missing and empty values are treated the same.
    pub fn is_filled(&self, id: &FieldId) -> bool {
        self.values.get(id).is_some_and(|v| !v.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldId, &FieldValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(FieldId, FieldValue)> for FieldValues {
    fn from_iter<T: IntoIterator<Item = (FieldId, FieldValue)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_aware_emptiness() {
        assert!(FieldValue::Text("   ".into()).is_empty());
        assert!(FieldValue::RichText("<p></p>".into()).is_empty());
        assert!(FieldValue::Items(vec![]).is_empty());
        assert!(FieldValue::Items(vec![SetItem::new(""), SetItem::new("  ")]).is_empty());
        assert!(!FieldValue::Items(vec![SetItem::new(""), SetItem::new("Q")]).is_empty());
        assert!(FieldValue::Image(ImageDescriptor::default()).is_empty());
    }

    #[test]
    fn test_items_render_without_bookkeeping() {
        let value = FieldValue::Items(vec![
            SetItem {
                text: "1. What is light?".into(),
                standards: vec!["NGSS.1".into()],
                source: Some("cached".into()),
            },
            SetItem::new(""),
            SetItem::new("2. Why?"),
        ]);
        let rendered = value.render_for_prompt();
        assert_eq!(rendered, "1. What is light?\n2. Why?");
        assert!(!rendered.contains("NGSS.1"));
        assert!(!rendered.contains("cached"));
    }

    #[test]
    fn test_image_render_uses_alt_text() {
        let value = FieldValue::Image(ImageDescriptor {
            url: "mem://1".into(),
            alt_text: Some("A leaf".into()),
            model_used: None,
        });
        assert_eq!(value.render_for_prompt(), "[Image: A leaf]");
    }

    #[test]
    fn test_missing_counts_as_unfilled() {
        let mut values = FieldValues::new();
        let id = FieldId::from("a");
        assert!(!values.is_filled(&id));
        values.set(id.clone(), FieldValue::Text("".into()));
        assert!(!values.is_filled(&id));
        values.set(id.clone(), FieldValue::Text("x".into()));
        assert!(values.is_filled(&id));
    }
}
