use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::field::{Field, FieldId};
use crate::generation_config::GenerationConfig;
use crate::graph::FieldGraph;
use crate::overrides::ConfigOverrideStore;
use crate::staleness::{StaleReport, StalenessTracker};
use crate::store::LessonResponses;
use crate::value::{FieldValue, FieldValues};
use crate::{LessonForgeError, Result};

/// Serialized form of a lesson: template fields, current values and the
/// per-lesson state that outlives a generation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonDocument {
    pub lesson_id: String,
    pub fields: Vec<Field>,
    #[serde(default)]
    pub values: FieldValues,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<ConfigOverrideStore>,
    #[serde(default, alias = "snapshots", skip_serializing_if = "Option::is_none")]
    pub staleness: Option<StalenessTracker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<GenerationCheckpoint>,
}

/// Where a paused generation session stopped. Stored with the lesson so a
/// later run continues at `resume_index` instead of regenerating the fields
/// before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationCheckpoint {
    /// Generation order fixed when the session started
    pub queue: Vec<FieldId>,
    pub resume_index: usize,
    #[serde(default)]
    pub missing_fields: Vec<FieldId>,
}

impl GenerationCheckpoint {
    pub fn remaining(&self) -> &[FieldId] {
        self.queue.get(self.resume_index..).unwrap_or_default()
    }
}

/// One lesson with everything a generation step reads or writes.
#[derive(Debug, Clone)]
pub struct LessonInstance {
    pub lesson_id: String,
    pub graph: FieldGraph,
    pub values: FieldValues,
    pub overrides: ConfigOverrideStore,
    pub staleness: StalenessTracker,
    pub checkpoint: Option<GenerationCheckpoint>,
}

impl LessonInstance {
    pub fn new(lesson_id: impl Into<String>, graph: FieldGraph) -> Self {
        let lesson_id = lesson_id.into();
        Self {
            overrides: ConfigOverrideStore::new(lesson_id.clone()),
            lesson_id,
            graph,
            values: FieldValues::new(),
            staleness: StalenessTracker::new(),
            checkpoint: None,
        }
    }

    pub fn with_values(mut self, values: FieldValues) -> Self {
        self.values = values;
        self
    }

    pub fn from_document(doc: LessonDocument) -> Result<Self> {
        let graph = FieldGraph::new(doc.fields)?;
        let overrides = match doc.overrides {
            Some(store) if store.lesson_id() != doc.lesson_id => {
                return Err(LessonForgeError::InvalidOperation(format!(
                    "override store belongs to lesson {}, not {}",
                    store.lesson_id(),
                    doc.lesson_id
                )))
            }
            Some(store) => store,
            None => ConfigOverrideStore::new(doc.lesson_id.clone()),
        };
        debug!(
            "Loaded lesson {} ({} fields, {} values)",
            doc.lesson_id,
            graph.fields().len(),
            doc.values.len()
        );
        Ok(Self {
            lesson_id: doc.lesson_id,
            graph,
            values: doc.values,
            overrides,
            staleness: doc.staleness.unwrap_or_default(),
            checkpoint: doc.checkpoint,
        })
    }

    pub fn to_document(&self) -> LessonDocument {
        LessonDocument {
            lesson_id: self.lesson_id.clone(),
            fields: self.graph.fields().to_vec(),
            values: self.values.clone(),
            overrides: Some(self.overrides.clone()),
            staleness: Some(self.staleness.clone()),
            checkpoint: self.checkpoint.clone(),
        }
    }

    /// Values split by section, as persisted by a `ResponseStore`.
    pub fn responses(&self) -> LessonResponses {
        LessonResponses::from_values(&self.graph, &self.values)
    }

    /// Fill fields that have no value from previously persisted responses.
    /// Values already in the lesson win. Unknown fields and values of the
    /// wrong type are skipped. Returns how many values were taken over.
    pub fn merge_responses(&mut self, responses: LessonResponses) -> usize {
        let mut merged = 0;
        for (id, value) in responses.designer.into_iter().chain(responses.builder) {
            if self.values.is_filled(&id) || value.is_empty() {
                continue;
            }
            let fits = self
                .graph
                .field(&id)
                .is_some_and(|f| value.matches_type(&f.field_type));
            if !fits {
                debug!("Skipping persisted value for {} in lesson {}", id, self.lesson_id);
                continue;
            }
            self.values.set(id, value);
            merged += 1;
        }
        merged
    }

    /// Hand edit of a field value. The value must match the field's type.
    pub fn set_value(&mut self, field_id: &FieldId, value: FieldValue) -> Result<Option<FieldValue>> {
        let field = self.graph.require(field_id)?;
        if !value.matches_type(&field.field_type) {
            return Err(LessonForgeError::InvalidOperation(format!(
                "value does not fit {} field {}",
                field.field_type.label(),
                field_id
            )));
        }
        Ok(self.values.set(field_id.clone(), value))
    }

    pub fn effective_config(&self, field_id: &FieldId) -> Result<GenerationConfig> {
        self.overrides.effective_config(&self.graph, field_id)
    }

    /// Customize generation for this lesson only; the template is untouched.
    pub fn edit_config(&mut self, field_id: &FieldId, config: GenerationConfig) -> Result<()> {
        self.overrides.apply_edit(&self.graph, field_id, config)
    }

    pub fn stale_report(&self, field_id: &FieldId) -> StaleReport {
        self.staleness.check_stale(&self.graph, field_id, &self.values)
    }

    pub fn stale_fields(&self) -> Vec<FieldId> {
        self.staleness.stale_fields(&self.graph, &self.values)
    }

    pub fn dismiss_stale(&mut self, field_id: &FieldId) -> bool {
        self.staleness.dismiss(field_id, &self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldType, Section};

    fn fields() -> Vec<Field> {
        vec![
            Field::new("topic", "Topic", FieldType::Text).in_section(Section::Designer, 0),
            Field::new("objective", "Objective", FieldType::Text)
                .in_section(Section::Designer, 1)
                .ai_enabled("Write an objective")
                .depends_on(["topic"]),
        ]
    }

    #[test]
    fn test_document_round_trip_keeps_lesson_state() {
        let mut lesson = LessonInstance::new("l1", FieldGraph::new(fields()).unwrap());
        lesson
            .set_value(&"topic".into(), FieldValue::Text("Volcanoes".into()))
            .unwrap();
        lesson
            .edit_config(&"objective".into(), GenerationConfig::with_task("Custom"))
            .unwrap();

        let json = serde_json::to_string(&lesson.to_document()).unwrap();
        let doc: LessonDocument = serde_json::from_str(&json).unwrap();
        let restored = LessonInstance::from_document(doc).unwrap();

        assert!(restored.overrides.is_materialized());
        assert_eq!(
            restored.effective_config(&"objective".into()).unwrap().task_prompt,
            "Custom"
        );
        assert!(restored.values.is_filled(&"topic".into()));
    }

    #[test]
    fn test_minimal_document_gets_fresh_state() {
        let doc: LessonDocument = serde_json::from_value(serde_json::json!({
            "lesson_id": "l2",
            "fields": [
                { "id": "topic", "name": "Topic", "field_type": { "kind": "text" }, "section": "designer" }
            ]
        }))
        .unwrap();
        let lesson = LessonInstance::from_document(doc).unwrap();
        assert_eq!(lesson.overrides.lesson_id(), "l2");
        assert!(!lesson.overrides.is_materialized());
        assert!(lesson.stale_fields().is_empty());
    }

    #[test]
    fn test_merge_responses_fills_only_gaps() {
        let mut lesson = LessonInstance::new("l1", FieldGraph::new(fields()).unwrap());
        lesson
            .set_value(&"topic".into(), FieldValue::Text("Volcanoes".into()))
            .unwrap();

        let mut responses = LessonResponses::default();
        responses
            .designer
            .insert("topic".into(), FieldValue::Text("Glaciers".into()));
        responses
            .designer
            .insert("objective".into(), FieldValue::Text("Explain eruptions".into()));
        responses
            .builder
            .insert("ghost".into(), FieldValue::Text("dropped".into()));

        assert_eq!(lesson.merge_responses(responses), 1);
        assert_eq!(
            lesson.values.get(&"topic".into()),
            Some(&FieldValue::Text("Volcanoes".into()))
        );
        assert_eq!(
            lesson.values.get(&"objective".into()),
            Some(&FieldValue::Text("Explain eruptions".into()))
        );
        assert!(lesson.values.get(&"ghost".into()).is_none());
    }

    #[test]
    fn test_checkpoint_survives_document_round_trip() {
        let mut lesson = LessonInstance::new("l1", FieldGraph::new(fields()).unwrap());
        lesson.checkpoint = Some(GenerationCheckpoint {
            queue: vec!["objective".into(), "topic".into()],
            resume_index: 1,
            missing_fields: Vec::new(),
        });

        let json = serde_json::to_string(&lesson.to_document()).unwrap();
        let restored = LessonInstance::from_document(serde_json::from_str(&json).unwrap()).unwrap();

        let checkpoint = restored.checkpoint.unwrap();
        assert_eq!(checkpoint.remaining(), &[FieldId::from("topic")]);
    }

    #[test]
    fn test_set_value_checks_type() {
        let mut lesson = LessonInstance::new("l1", FieldGraph::new(fields()).unwrap());
        let err = lesson.set_value(&"topic".into(), FieldValue::Items(vec![]));
        assert!(err.is_err());
        assert!(lesson
            .set_value(&"ghost".into(), FieldValue::Text("x".into()))
            .is_err());
    }
}
