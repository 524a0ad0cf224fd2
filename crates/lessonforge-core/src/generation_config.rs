use serde::{Deserialize, Serialize};

use crate::field::FieldId;

/// Per-field generation configuration, either the template default or a
/// lesson-level override.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub system_instructions: String,
    #[serde(default)]
    pub task_prompt: String,
    #[serde(default)]
    pub format_requirements: String,
    /// How the model should use the CONTEXT block
    #[serde(default)]
    pub context_instructions: String,
    /// Dependencies actually fed to the prompt at generation time
    #[serde(default)]
    pub context_field_ids: Vec<FieldId>,
}

impl GenerationConfig {
    pub fn with_task(task_prompt: impl Into<String>) -> Self {
        Self {
            task_prompt: task_prompt.into(),
            ..Default::default()
        }
    }

    pub fn has_context(&self) -> bool {
        !self.context_field_ids.is_empty()
    }
}
