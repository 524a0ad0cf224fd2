pub mod config;
pub mod error;
pub mod field;
pub mod generation_config;
pub mod graph;
pub mod lesson;
pub mod logging;
pub mod overrides;
pub mod prompt;
pub mod richtext;
pub mod staleness;
pub mod store;
pub mod structured;
pub mod value;

pub use config::*;
pub use error::*;
pub use field::*;
pub use generation_config::*;
pub use graph::*;
pub use lesson::*;
pub use logging::init_tracing;
pub use overrides::*;
pub use prompt::DependencyValue;
pub use staleness::{ContextSnapshot, StaleReport, StalenessTracker};
pub use store::*;
pub use structured::{OutputSchema, QuestionItem, SchemaViolation};
pub use value::*;
