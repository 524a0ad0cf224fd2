use thiserror::Error;

use crate::field::FieldId;

#[derive(Error, Debug)]
pub enum LessonForgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Field not found: {0}")]
    FieldNotFound(FieldId),

    #[error("Duplicate field id: {0}")]
    DuplicateField(FieldId),

    #[error("Field {field} depends on unknown field {missing}")]
    DanglingDependency { field: FieldId, missing: FieldId },

    #[error("Dependency cycle detected: {}", format_cycle(.0))]
    CyclicDependency(Vec<FieldId>),

    #[error("Malformed canonical item: {0}")]
    CanonicalFormat(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

fn format_cycle(ids: &[FieldId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, LessonForgeError>;
