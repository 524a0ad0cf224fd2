//! Deterministic prompt assembly from a generation config and the current
//! values of the selected context fields.

use std::fmt::Write as _;

use crate::field::{FieldId, FieldType};
use crate::generation_config::GenerationConfig;
use crate::graph::FieldGraph;
use crate::value::{FieldValue, FieldValues};
use crate::Result;

pub const NO_FORMAT_REQUIREMENTS: &str = "No specific format requirements.";
pub const DEFAULT_CONTEXT_INSTRUCTIONS: &str =
    "Use the following context to inform your response.";
pub const NOT_FILLED: &str = "[Not filled]";

/// One selected dependency and its value at compile time.
#[derive(Debug, Clone, Copy)]
pub struct DependencyValue<'a> {
    pub id: &'a FieldId,
    pub name: &'a str,
    pub field_type: &'a FieldType,
    pub value: Option<&'a FieldValue>,
}

impl DependencyValue<'_> {
    pub fn is_filled(&self) -> bool {
        self.value.is_some_and(|v| !v.is_empty())
    }

    fn render(&self) -> String {
        match self.value {
            Some(value) if !value.is_empty() => value.render_for_prompt(),
            _ => NOT_FILLED.to_string(),
        }
    }
}

/// Resolve `ids` against the graph and the value context, keeping order.
pub fn collect_dependency_values<'a>(
    graph: &'a FieldGraph,
    ids: &'a [FieldId],
    values: &'a FieldValues,
) -> Result<Vec<DependencyValue<'a>>> {
    ids.iter()
        .map(|id| -> Result<DependencyValue<'a>> {
            let field = graph.require(id)?;
            Ok(DependencyValue {
                id,
                name: field.name.as_str(),
                field_type: &field.field_type,
                value: values.get(id),
            })
        })
        .collect()
}

/// Build the request string for one field.
///
/// Sections always appear in the same order; CONTEXT only when at least one
/// dependency is selected. Equal inputs yield byte-identical output.
pub fn compile(config: &GenerationConfig, dependencies: &[DependencyValue<'_>]) -> String {
    let mut out = String::new();

    push_section(&mut out, "SYSTEM INSTRUCTIONS", config.system_instructions.trim());
    push_section(&mut out, "TASK", config.task_prompt.trim());

    let format = config.format_requirements.trim();
    push_section(
        &mut out,
        "FORMAT REQUIREMENTS",
        if format.is_empty() {
            NO_FORMAT_REQUIREMENTS
        } else {
            format
        },
    );

    if !dependencies.is_empty() {
        let instructions = config.context_instructions.trim();
        let mut body = String::from(if instructions.is_empty() {
            DEFAULT_CONTEXT_INSTRUCTIONS
        } else {
            instructions
        });
        for dep in dependencies {
            let _ = write!(body, "\n{}: {}", dep.name, dep.render());
        }
        push_section(&mut out, "CONTEXT", &body);
    }

    out.trim_end().to_string()
}

fn push_section(out: &mut String, header: &str, body: &str) {
    let _ = write!(out, "{header}:\n{body}\n\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Field;
    use crate::value::SetItem;

    fn graph() -> FieldGraph {
        FieldGraph::new(vec![
            Field::new("topic", "Topic", FieldType::Text),
            Field::new("overview", "Overview", FieldType::RichText),
            Field::new("quiz", "Quiz", FieldType::ItemSet(Default::default())),
            Field::new("empty", "Empty", FieldType::Text),
        ])
        .unwrap()
    }

    fn values() -> FieldValues {
        let mut values = FieldValues::new();
        values.set("topic".into(), FieldValue::Text("Photosynthesis".into()));
        values.set(
            "overview".into(),
            FieldValue::RichText("<p>Plants make <b>sugar</b>.</p>".into()),
        );
        values.set(
            "quiz".into(),
            FieldValue::Items(vec![SetItem {
                text: "1. What do plants make?".into(),
                standards: vec!["LS1.C".into()],
                source: Some("bank:42".into()),
            }]),
        );
        values
    }

    #[test]
    fn test_full_prompt_layout() {
        let graph = graph();
        let values = values();
        let ids: Vec<FieldId> = vec!["topic".into(), "overview".into(), "quiz".into(), "empty".into()];
        let deps = collect_dependency_values(&graph, &ids, &values).unwrap();

        let config = GenerationConfig {
            system_instructions: "You are a teacher.".into(),
            task_prompt: "Write an objective.".into(),
            format_requirements: String::new(),
            context_instructions: String::new(),
            context_field_ids: ids.clone(),
        };

        let prompt = compile(&config, &deps);
        let expected = "SYSTEM INSTRUCTIONS:\nYou are a teacher.\n\n\
TASK:\nWrite an objective.\n\n\
FORMAT REQUIREMENTS:\nNo specific format requirements.\n\n\
CONTEXT:\nUse the following context to inform your response.\n\
Topic: Photosynthesis\n\
Overview: Plants make **sugar**.\n\
Quiz: 1. What do plants make?\n\
Empty: [Not filled]";
        assert_eq!(prompt, expected);
        assert!(!prompt.contains("LS1.C"));
        assert!(!prompt.contains("bank:42"));
    }

    #[test]
    fn test_context_omitted_without_dependencies() {
        let config = GenerationConfig {
            task_prompt: "Write".into(),
            format_requirements: "Two sentences.".into(),
            context_instructions: "ignored".into(),
            ..Default::default()
        };
        let prompt = compile(&config, &[]);
        assert!(!prompt.contains("CONTEXT"));
        assert!(prompt.ends_with("FORMAT REQUIREMENTS:\nTwo sentences."));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let graph = graph();
        let values = values();
        let ids: Vec<FieldId> = vec!["quiz".into(), "topic".into()];
        let deps = collect_dependency_values(&graph, &ids, &values).unwrap();
        let config = GenerationConfig {
            task_prompt: "Summarize".into(),
            context_instructions: "Stay on topic.".into(),
            context_field_ids: ids.clone(),
            ..Default::default()
        };
        assert_eq!(compile(&config, &deps), compile(&config, &deps));
        assert!(compile(&config, &deps).contains("CONTEXT:\nStay on topic.\nQuiz:"));
    }

    #[test]
    fn test_unknown_dependency_is_an_error() {
        let graph = graph();
        let values = values();
        let ids: Vec<FieldId> = vec!["ghost".into()];
        assert!(collect_dependency_values(&graph, &ids, &values).is_err());
    }
}
