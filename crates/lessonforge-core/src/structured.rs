//! Structured output for item-set fields: the schema sent to the AI service,
//! validation of what comes back, and the canonical text each accepted item
//! is stored as.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::field::ItemSetSpec;
use crate::value::SetItem;
use crate::{LessonForgeError, Result};

/// One multiple-choice question as returned by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct QuestionItem {
    /// The question stem
    pub question: String,
    /// Answer choices keyed by label
    pub choices: BTreeMap<String, String>,
    /// Standards the question assesses
    pub standards: Vec<String>,
    /// Label of the correct choice
    pub correct_choice: String,
}

/// Schema-constrained output request: an `items` array of exactly
/// `min_items == max_items` entries shaped like `item_shape`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSchema {
    pub name: String,
    pub description: String,
    pub item_shape: Value,
    pub min_items: usize,
    pub max_items: usize,
}

impl OutputSchema {
    /// Question-set schema for `count` items, choices fixed to the item set's
    /// labels.
    pub fn for_item_set(spec: &ItemSetSpec, count: usize) -> Self {
        let mut shape = schema_for!(QuestionItem).to_value();
        if let Some(obj) = shape.as_object_mut() {
            obj.remove("$schema");
            obj.remove("title");
            obj.insert("additionalProperties".into(), Value::Bool(false));
        }

        let labels = &spec.choice_labels;
        let choice_props: Map<String, Value> = labels
            .iter()
            .map(|l| (l.clone(), json!({ "type": "string" })))
            .collect();
        if let Some(props) = shape.get_mut("properties").and_then(Value::as_object_mut) {
            props.insert(
                "choices".into(),
                json!({
                    "type": "object",
                    "description": "Answer choices keyed by label",
                    "properties": choice_props,
                    "required": labels,
                    "additionalProperties": false,
                }),
            );
            props.insert(
                "correct_choice".into(),
                json!({
                    "type": "string",
                    "description": "Label of the correct choice",
                    "enum": labels,
                }),
            );
        }

        Self {
            name: "question_set".into(),
            description: format!(
                "Exactly {count} multiple-choice question(s), each with choices {}",
                labels.join(", ")
            ),
            item_shape: shape,
            min_items: count,
            max_items: count,
        }
    }

    /// Full JSON schema wrapping the item array in an object.
    pub fn to_json_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "items": self.item_shape,
                    "minItems": self.min_items,
                    "maxItems": self.max_items,
                }
            },
            "required": ["items"],
            "additionalProperties": false,
        })
    }
}

/// A response that arrived but does not have the required shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaViolation {
    #[error("response is not an object with an `items` array")]
    NotAnItemList,

    #[error("expected exactly {expected} items, got {actual}")]
    ItemCount { expected: usize, actual: usize },

    #[error("item {index}: missing or empty `{key}`")]
    MissingKey { index: usize, key: String },

    #[error("item {index}: correct choice `{label}` is not one of the choices")]
    UnknownAnswer { index: usize, label: String },

    #[error("item {index}: standard `{standard}` contains a comma")]
    InvalidStandard { index: usize, standard: String },

    #[error("response could not be read as JSON: {0}")]
    Unparseable(String),
}

/// Validate a structured response and turn it into stored items.
///
/// Either all `count` items are accepted and returned, or nothing is.
/// Items are numbered from `first_number`, which lets a single regenerated
/// item keep its position.
pub fn adapt(
    response: &Value,
    spec: &ItemSetSpec,
    count: usize,
    first_number: usize,
) -> std::result::Result<Vec<SetItem>, SchemaViolation> {
    let raw = match response {
        Value::Array(items) => items,
        Value::Object(obj) => obj
            .get("items")
            .and_then(Value::as_array)
            .ok_or(SchemaViolation::NotAnItemList)?,
        _ => return Err(SchemaViolation::NotAnItemList),
    };

    if raw.len() != count {
        return Err(SchemaViolation::ItemCount {
            expected: count,
            actual: raw.len(),
        });
    }

    let items = raw
        .iter()
        .enumerate()
        .map(|(index, item)| validate_item(index, item, spec))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(items
        .iter()
        .enumerate()
        .map(|(i, item)| SetItem {
            text: canonicalize(first_number + i, item, spec),
            standards: item.standards.clone(),
            source: None,
        })
        .collect())
}

fn validate_item(
    index: usize,
    item: &Value,
    spec: &ItemSetSpec,
) -> std::result::Result<QuestionItem, SchemaViolation> {
    let missing = |key: &str| SchemaViolation::MissingKey {
        index,
        key: key.to_string(),
    };

    let question = item
        .get("question")
        .and_then(Value::as_str)
        .map(single_line)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| missing("question"))?;

    let raw_choices = item
        .get("choices")
        .and_then(Value::as_object)
        .ok_or_else(|| missing("choices"))?;
    let mut choices = BTreeMap::new();
    for label in &spec.choice_labels {
        let text = raw_choices
            .get(label)
            .and_then(Value::as_str)
            .map(single_line)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| missing(&format!("choices.{label}")))?;
        choices.insert(label.clone(), text);
    }

    let standards = item
        .get("standards")
        .and_then(Value::as_array)
        .ok_or_else(|| missing("standards"))?
        .iter()
        .map(|s| s.as_str().map(single_line).ok_or_else(|| missing("standards")))
        .collect::<std::result::Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    // The canonical text lists standards comma-separated.
    if let Some(standard) = standards.iter().find(|s| s.contains(',')) {
        return Err(SchemaViolation::InvalidStandard {
            index,
            standard: standard.clone(),
        });
    }

    let answer = item
        .get("correct_choice")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| missing("correct_choice"))?;
    let normalized = answer.trim_end_matches([')', '.', ':']).trim();
    let correct_choice = spec
        .choice_labels
        .iter()
        .find(|l| l.eq_ignore_ascii_case(normalized))
        .cloned()
        .ok_or_else(|| SchemaViolation::UnknownAnswer {
            index,
            label: answer.to_string(),
        })?;

    Ok(QuestionItem {
        question,
        choices,
        standards,
        correct_choice,
    })
}

fn single_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fixed human-readable encoding of one item; `parse_canonical` reads it
/// back.
pub fn canonicalize(number: usize, item: &QuestionItem, spec: &ItemSetSpec) -> String {
    let mut lines = Vec::with_capacity(spec.choice_labels.len() + 3);
    lines.push(format!("{number}. {}", item.question));
    for label in &spec.choice_labels {
        if let Some(choice) = item.choices.get(label) {
            lines.push(format!("{label}) {choice}"));
        }
    }
    let standards = if item.standards.is_empty() {
        "none".to_string()
    } else {
        item.standards.join(", ")
    };
    lines.push(format!("[Standards: {standards}]"));
    lines.push(format!("Answer: {}", item.correct_choice));
    lines.join("\n")
}

static QUESTION_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)\.\s+(.+)$").unwrap());
static CHOICE_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([A-Za-z0-9]+)\)\s*(.*)$").unwrap());
static STANDARDS_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[Standards:\s*(.*)\]$").unwrap());
static ANSWER_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Answer:\s*(\S+)$").unwrap());

/// Parse one canonical item back into its number and content, for export.
pub fn parse_canonical(text: &str) -> Result<(usize, QuestionItem)> {
    let bad = |why: &str| LessonForgeError::CanonicalFormat(why.to_string());
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

    let head = lines.next().ok_or_else(|| bad("empty item"))?;
    let caps = QUESTION_LINE
        .captures(head)
        .ok_or_else(|| bad("first line is not a numbered question"))?;
    let number = caps[1].parse().map_err(|_| bad("invalid question number"))?;
    let question = caps[2].to_string();

    let mut choices = BTreeMap::new();
    let mut standards = None;
    let mut correct_choice = None;
    for line in lines {
        if let Some(caps) = STANDARDS_LINE.captures(line) {
            let list = caps[1].trim();
            standards = Some(if list == "none" || list.is_empty() {
                Vec::new()
            } else {
                list.split(',').map(|s| s.trim().to_string()).collect()
            });
        } else if let Some(caps) = ANSWER_LINE.captures(line) {
            correct_choice = Some(caps[1].to_string());
        } else if let Some(caps) = CHOICE_LINE.captures(line) {
            choices.insert(caps[1].to_string(), caps[2].trim().to_string());
        } else {
            return Err(bad(&format!("unrecognized line: {line}")));
        }
    }

    let correct_choice = correct_choice.ok_or_else(|| bad("missing answer line"))?;
    if !choices.contains_key(&correct_choice) {
        return Err(bad("answer does not match any choice"));
    }

    Ok((
        number,
        QuestionItem {
            question,
            choices,
            standards: standards.ok_or_else(|| bad("missing standards line"))?,
            correct_choice,
        },
    ))
}

/// Parse every non-empty item of an item-set value.
pub fn parse_item_set(items: &[SetItem]) -> Result<Vec<QuestionItem>> {
    items
        .iter()
        .filter(|item| !item.is_empty())
        .map(|item| parse_canonical(&item.text).map(|(_, q)| q))
        .collect()
}
