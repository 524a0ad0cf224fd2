pub mod error;
pub mod orchestrator;
pub mod session;

pub use error::{GenerationError, Result};
pub use orchestrator::{FieldOutcome, GenerationOrchestrator};
pub use session::{GenerationSession, PauseReason, Progress, SessionHandle, SessionStatus};
