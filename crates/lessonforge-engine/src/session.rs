use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lessonforge_core::FieldId;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Pre-flight found empty fields marked required for generation
    MissingRequiredContext,
    /// The next field's own dependencies are not filled yet
    MissingContext,
    /// A pause was requested through the session handle
    UserRequested,
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseReason::MissingRequiredContext => write!(f, "missing required context"),
            PauseReason::MissingContext => write!(f, "missing context"),
            PauseReason::UserRequested => write!(f, "paused by user"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Validating,
    Generating,
    Paused {
        reason: PauseReason,
        resume_index: usize,
    },
    Completed,
    Failed {
        field_id: FieldId,
        index: usize,
        total: usize,
        message: String,
    },
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, SessionStatus::Paused { .. })
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Validating => "validating",
            SessionStatus::Generating => "generating",
            SessionStatus::Paused { .. } => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Paused {
                reason,
                resume_index,
            } => write!(f, "paused ({reason}) at {resume_index}"),
            SessionStatus::Failed {
                field_id,
                index,
                total,
                message,
            } => write!(f, "failed at {field_id} ({}/{total}): {message}", index + 1),
            other => f.write_str(other.name()),
        }
    }
}

/// State of one generation run over a lesson. The orchestrator keeps it
/// after `Completed` or `Failed` so callers can report what the run did;
/// the next `start` replaces it and `cancel` drops it.
#[derive(Debug, Clone)]
pub struct GenerationSession {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Field ids in generation order, fixed when the session starts
    pub queue: Vec<FieldId>,
    /// Next index to generate
    pub current_index: usize,
    pub missing_fields: Vec<FieldId>,
    pub persistence_errors: Vec<String>,
    /// Fields generated by this session, in order
    pub generated: Vec<FieldId>,
}

impl GenerationSession {
    pub(crate) fn new(queue: Vec<FieldId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            queue,
            current_index: 0,
            missing_fields: Vec::new(),
            persistence_errors: Vec::new(),
            generated: Vec::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.queue.len()
    }

    pub fn current_field(&self) -> Option<&FieldId> {
        self.queue.get(self.current_index)
    }
}

/// Snapshot published to observers after every transition and step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub status: SessionStatus,
    pub current_index: usize,
    pub total: usize,
    pub current_field: Option<FieldId>,
    pub pause_reason: Option<PauseReason>,
    /// Readable cause of a pause for missing context
    pub pause_cause: Option<String>,
    pub missing_fields: Vec<FieldId>,
    pub stale_fields: Vec<FieldId>,
    pub persistence_errors: Vec<String>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            status: SessionStatus::Idle,
            current_index: 0,
            total: 0,
            current_field: None,
            pause_reason: None,
            pause_cause: None,
            missing_fields: Vec::new(),
            stale_fields: Vec::new(),
            persistence_errors: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ControlFlags {
    pause: AtomicBool,
    cancel: AtomicBool,
}

impl ControlFlags {
    pub(crate) fn take_cancel(&self) -> bool {
        self.cancel.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn take_pause(&self) -> bool {
        self.pause.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn clear(&self) {
        self.pause.store(false, Ordering::SeqCst);
        self.cancel.store(false, Ordering::SeqCst);
    }
}

/// Cloneable handle for observing a running orchestrator and asking it to
/// pause or cancel. Requests are honoured between fields only.
#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) flags: Arc<ControlFlags>,
    pub(crate) progress: watch::Receiver<Progress>,
}

impl SessionHandle {
    pub fn request_pause(&self) {
        self.flags.pause.store(true, Ordering::SeqCst);
    }

    pub fn request_cancel(&self) {
        self.flags.cancel.store(true, Ordering::SeqCst);
    }

    /// Latest published progress.
    pub fn progress(&self) -> Progress {
        self.progress.borrow().clone()
    }

    /// A receiver that can `changed().await` on progress updates.
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        let paused = SessionStatus::Paused {
            reason: PauseReason::MissingContext,
            resume_index: 2,
        };
        assert_eq!(paused.to_string(), "paused (missing context) at 2");

        let failed = SessionStatus::Failed {
            field_id: "quiz".into(),
            index: 1,
            total: 3,
            message: "bad".into(),
        };
        assert_eq!(failed.to_string(), "failed at quiz (2/3): bad");
        assert!(failed.is_terminal());
    }

    #[test]
    fn test_control_flags_are_consumed() {
        let flags = ControlFlags::default();
        flags.pause.store(true, Ordering::SeqCst);
        assert!(flags.take_pause());
        assert!(!flags.take_pause());
    }
}
