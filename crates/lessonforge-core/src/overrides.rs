use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::field::FieldId;
use crate::generation_config::GenerationConfig;
use crate::graph::FieldGraph;
use crate::Result;

/// Lesson-scoped copy-on-write store of generation configuration.
///
/// Until the first edit the store is empty and every lookup falls through to
/// the template. The first edit materializes a snapshot of every AI-enabled
/// field's template configuration, so later template edits cannot change a
/// lesson that has started customizing itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigOverrideStore {
    lesson_id: String,
    #[serde(default)]
    entries: BTreeMap<FieldId, GenerationConfig>,
    /// Set once the template snapshot has been taken; persisted so that a
    /// store emptied later does not snapshot again.
    #[serde(default)]
    materialized: bool,
}

impl ConfigOverrideStore {
    pub fn new(lesson_id: impl Into<String>) -> Self {
        Self {
            lesson_id: lesson_id.into(),
            entries: BTreeMap::new(),
            materialized: false,
        }
    }

    pub fn lesson_id(&self) -> &str {
        &self.lesson_id
    }

    pub fn is_materialized(&self) -> bool {
        self.materialized
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Instance-level entry only, without template fallback.
    pub fn get(&self, field_id: &FieldId) -> Option<&GenerationConfig> {
        self.entries.get(field_id)
    }

    /// Instance entry if present, else the field's template config.
    pub fn effective_config(
        &self,
        graph: &FieldGraph,
        field_id: &FieldId,
    ) -> Result<GenerationConfig> {
        if let Some(config) = self.entries.get(field_id) {
            return Ok(config.clone());
        }
        Ok(graph.require(field_id)?.template_config.clone())
    }

    /// Store `new_config` for `field_id`, materializing the template snapshot
    /// first if this lesson has never been customized.
    ///
    /// Validation happens before anything changes, and the snapshot plus the
    /// edit are swapped in together.
    pub fn apply_edit(
        &mut self,
        graph: &FieldGraph,
        field_id: &FieldId,
        new_config: GenerationConfig,
    ) -> Result<()> {
        graph.require(field_id)?;
        graph.check_references(field_id, &new_config.context_field_ids)?;

        let mut next = self.entries.clone();
        if !self.materialized {
            for field in graph.ordered_generation_queue() {
                next.entry(field.id.clone())
                    .or_insert_with(|| field.template_config.clone());
            }
            info!(
                "Materialized {} template configs for lesson {}",
                next.len(),
                self.lesson_id
            );
        }
        next.insert(field_id.clone(), new_config);

        self.entries = next;
        self.materialized = true;
        debug!("Override stored for field {} in lesson {}", field_id, self.lesson_id);
        Ok(())
    }

    /// Drop an instance entry so the field reads the template again.
    pub fn revert(&mut self, field_id: &FieldId) -> Option<GenerationConfig> {
        self.entries.remove(field_id)
    }

    /// Remove every entry but remember that the lesson was materialized.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Forget everything, including the materialized flag.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.materialized = false;
    }
}
