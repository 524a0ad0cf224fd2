use lessonforge_ai::{AiError, ImageError};
use lessonforge_core::{FieldId, LessonForgeError, SchemaViolation};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GenerationError {
    /// Required context is empty. Recorded as the cause of a pause; the
    /// session never fails with it.
    #[error("Field {field} is missing context: {}", join_ids(.missing))]
    Validation {
        field: FieldId,
        missing: Vec<FieldId>,
    },

    #[error("Schema violation for {field}: {violation}")]
    SchemaViolation {
        field: FieldId,
        violation: SchemaViolation,
    },

    #[error("AI service error for {field}: {message}")]
    Transport { field: FieldId, message: String },

    #[error("Failed to persist responses: {0}")]
    Persistence(String),

    #[error("Cannot {action} while {state}")]
    InvalidTransition { action: &'static str, state: String },

    #[error(transparent)]
    Graph(#[from] LessonForgeError),
}

impl GenerationError {
    pub(crate) fn from_ai(field: &FieldId, error: AiError) -> Self {
        GenerationError::Transport {
            field: field.clone(),
            message: error.to_string(),
        }
    }

    /// A structured call that got an answer it could not read is a schema
    /// violation; only a missing answer is a transport failure.
    pub(crate) fn from_structured(field: &FieldId, error: AiError) -> Self {
        match error {
            AiError::MalformedResponse(message) => GenerationError::SchemaViolation {
                field: field.clone(),
                violation: SchemaViolation::Unparseable(message),
            },
            other => Self::from_ai(field, other),
        }
    }

    pub(crate) fn from_image(field: &FieldId, error: ImageError) -> Self {
        GenerationError::Transport {
            field: field.clone(),
            message: error.to_string(),
        }
    }
}

fn join_ids(ids: &[FieldId]) -> String {
    ids.iter()
        .map(FieldId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, GenerationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_errors_split_by_cause() {
        let field = FieldId::from("quiz");
        let unreadable = GenerationError::from_structured(
            &field,
            AiError::MalformedResponse("response is not valid JSON".into()),
        );
        assert!(matches!(
            unreadable,
            GenerationError::SchemaViolation {
                violation: SchemaViolation::Unparseable(_),
                ..
            }
        ));

        let offline =
            GenerationError::from_structured(&field, AiError::Transport("timed out".into()));
        assert!(matches!(offline, GenerationError::Transport { .. }));
    }

    #[test]
    fn test_validation_message_lists_missing_fields() {
        let error = GenerationError::Validation {
            field: "quiz".into(),
            missing: vec!["topic".into(), "grade".into()],
        };
        assert_eq!(error.to_string(), "Field quiz is missing context: topic, grade");
    }
}
