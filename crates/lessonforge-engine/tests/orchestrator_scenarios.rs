mod common;

use std::sync::Arc;

use common::*;
use lessonforge_ai::AiError;
use lessonforge_core::{
    Field, FieldGraph, FieldId, FieldType, FieldValue, GenerationConfig, InMemoryResponseStore,
    ItemSetSpec, JsonFileResponseStore, LessonInstance, ResponseStore, SchemaViolation, Section,
    SetItem, StaleReport,
};
use lessonforge_engine::{GenerationError, GenerationOrchestrator, PauseReason, SessionStatus};
use serde_json::json;

fn orchestrator(llm: Arc<ScriptedLlm>) -> GenerationOrchestrator {
    GenerationOrchestrator::new(llm, Arc::new(InMemoryResponseStore::new()))
}

fn id(s: &str) -> FieldId {
    FieldId::from(s)
}

#[tokio::test]
async fn test_preflight_pauses_on_empty_required_field() {
    let llm = ScriptedLlm::new();
    let mut orch = orchestrator(llm.clone());
    let mut lesson = two_field_lesson();

    let status = orch.start(&mut lesson).await.unwrap();

    assert_eq!(
        status,
        SessionStatus::Paused {
            reason: PauseReason::MissingRequiredContext,
            resume_index: 0,
        }
    );
    assert_eq!(orch.session().unwrap().missing_fields, vec![id("a")]);
    assert_eq!(llm.calls(), 0);
    assert!(matches!(
        orch.last_error(),
        Some(GenerationError::Validation { field, missing })
            if field == &id("b") && missing == &vec![id("a")]
    ));
    assert_eq!(
        orch.handle().progress().pause_cause.as_deref(),
        Some("Field b is missing context: a")
    );
}

#[tokio::test]
async fn test_resume_generates_in_order_with_context() {
    let llm = ScriptedLlm::new();
    let mut orch = orchestrator(llm.clone());
    let mut lesson = two_field_lesson();
    orch.start(&mut lesson).await.unwrap();

    lesson
        .set_value(&id("a"), FieldValue::Text("Photosynthesis unit".into()))
        .unwrap();
    llm.reply("A's AI result");
    llm.reply("B's AI result");

    let status = orch.resume(&mut lesson).await.unwrap();

    assert_eq!(status, SessionStatus::Completed);
    assert_eq!(
        lesson.values.get(&id("a")),
        Some(&FieldValue::Text("A's AI result".into()))
    );
    let prompts = llm.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("CONTEXT:"));
    assert!(prompts[1].contains("CONTEXT:"));
    assert!(prompts[1].contains("A: A's AI result"));
    assert!(lesson.staleness.has_generated(&id("a")));
    assert!(lesson.staleness.has_generated(&id("b")));
}

#[tokio::test]
async fn test_editing_dependency_marks_consumer_stale() {
    let llm = ScriptedLlm::new();
    let mut orch = orchestrator(llm.clone());
    let mut lesson = two_field_lesson();
    lesson
        .set_value(&id("a"), FieldValue::Text("Photosynthesis unit".into()))
        .unwrap();
    orch.start(&mut lesson).await.unwrap();
    assert!(lesson.stale_fields().is_empty());

    lesson
        .set_value(&id("a"), FieldValue::Text("Cell respiration".into()))
        .unwrap();

    assert_eq!(
        lesson.stale_report(&id("b")),
        StaleReport {
            stale: true,
            changed: vec!["A".to_string()],
            dismissed: false,
        }
    );
    assert!(!lesson.stale_report(&id("a")).stale);

    // Hand edits happen outside the orchestrator; progress catches up on refresh.
    assert!(orch.handle().progress().stale_fields.is_empty());
    orch.refresh_progress(&lesson);
    assert_eq!(orch.handle().progress().stale_fields, vec![id("b")]);
}

#[tokio::test]
async fn test_short_item_set_fails_without_partial_write() {
    let graph = FieldGraph::new(vec![Field::new(
        "quiz",
        "Quiz",
        FieldType::ItemSet(ItemSetSpec::default()),
    )
    .ai_enabled("Write five questions")])
    .unwrap();
    let mut lesson = LessonInstance::new("lesson-q", graph);
    let llm = ScriptedLlm::new();
    llm.reply_structured(question_set(4));
    let mut orch = orchestrator(llm.clone());

    let status = orch.start(&mut lesson).await.unwrap();

    assert!(matches!(
        status,
        SessionStatus::Failed { ref field_id, index: 0, total: 1, .. } if field_id.as_str() == "quiz"
    ));
    assert!(matches!(
        orch.last_error(),
        Some(GenerationError::SchemaViolation { .. })
    ));
    assert!(lesson.values.get(&id("quiz")).is_none());
    assert!(!lesson.staleness.has_generated(&id("quiz")));
}

#[tokio::test]
async fn test_unreadable_structured_reply_is_schema_violation() {
    let graph = FieldGraph::new(vec![Field::new(
        "quiz",
        "Quiz",
        FieldType::ItemSet(ItemSetSpec::default()),
    )
    .ai_enabled("Write five questions")])
    .unwrap();
    let mut lesson = LessonInstance::new("lesson-q", graph);
    let previous = FieldValue::Items(vec![SetItem::new("1. Kept?")]);
    lesson.set_value(&id("quiz"), previous.clone()).unwrap();
    let mut orch = orchestrator(ScriptedLlm::new()).with_structured_provider(Arc::new(
        ChatOnlyLlm("Sure! Here are five questions: 1. What do plants need?".into()),
    ));

    let status = orch.start(&mut lesson).await.unwrap();

    assert!(matches!(status, SessionStatus::Failed { index: 0, .. }));
    assert!(matches!(
        orch.last_error(),
        Some(GenerationError::SchemaViolation {
            violation: SchemaViolation::Unparseable(_),
            ..
        })
    ));
    assert_eq!(lesson.values.get(&id("quiz")), Some(&previous));
}

#[tokio::test]
async fn test_lesson_overrides_survive_template_edits() {
    let graph = FieldGraph::new(vec![
        Field::new("a", "A", FieldType::Text).ai_enabled("Write A"),
        Field::new("b", "B", FieldType::Text).ai_enabled("Write B"),
        Field::new("c", "C", FieldType::Text).ai_enabled("Write C"),
        Field::new("notes", "Notes", FieldType::Text),
    ])
    .unwrap();
    let mut lesson = LessonInstance::new("lesson-5", graph);
    assert!(lesson.overrides.is_empty());

    lesson
        .edit_config(&id("c"), GenerationConfig::with_task("Write a better C"))
        .unwrap();

    assert_eq!(lesson.overrides.len(), 3);
    assert_eq!(
        lesson.overrides.get(&id("c")).unwrap().task_prompt,
        "Write a better C"
    );
    assert_eq!(lesson.overrides.get(&id("a")).unwrap().task_prompt, "Write A");

    lesson
        .graph
        .update_template_config(&id("a"), GenerationConfig::with_task("New template A"))
        .unwrap();
    assert_eq!(lesson.effective_config(&id("a")).unwrap().task_prompt, "Write A");
}

#[tokio::test]
async fn test_transport_error_fails_and_keeps_previous_value() {
    let llm = ScriptedLlm::new();
    llm.reply("A's AI result");
    llm.reply_err(AiError::Transport("connection reset".into()));
    let mut orch = orchestrator(llm.clone());
    let mut lesson = two_field_lesson();
    lesson
        .set_value(&id("a"), FieldValue::Text("Photosynthesis unit".into()))
        .unwrap();
    lesson
        .set_value(&id("b"), FieldValue::Text("hand written".into()))
        .unwrap();

    let status = orch.start(&mut lesson).await.unwrap();

    assert!(matches!(status, SessionStatus::Failed { index: 1, .. }));
    assert_eq!(
        lesson.values.get(&id("b")),
        Some(&FieldValue::Text("hand written".into()))
    );
    assert!(lesson.staleness.has_generated(&id("a")));
    assert!(!lesson.staleness.has_generated(&id("b")));

    // A failed session can be started again.
    llm.reply("A again");
    llm.reply("B again");
    assert_eq!(orch.start(&mut lesson).await.unwrap(), SessionStatus::Completed);
}

#[tokio::test]
async fn test_structured_values_are_canonical() {
    let graph = FieldGraph::new(vec![Field::new(
        "quiz",
        "Quiz",
        FieldType::ItemSet(ItemSetSpec {
            item_count: 2,
            ..Default::default()
        }),
    )
    .ai_enabled("Write questions")])
    .unwrap();
    let mut lesson = LessonInstance::new("lesson-q", graph);
    let llm = ScriptedLlm::new();
    llm.reply_structured(question_set(2));
    let mut orch = orchestrator(llm);

    orch.start(&mut lesson).await.unwrap();

    let Some(FieldValue::Items(items)) = lesson.values.get(&id("quiz")) else {
        panic!("expected items");
    };
    assert_eq!(items.len(), 2);
    assert_eq!(
        items[1].text,
        "2. Question 2?\nA) one\nB) two\nC) three\nD) four\n[Standards: LS1.C]\nAnswer: B"
    );
    assert_eq!(items[0].standards, vec!["LS1.C".to_string()]);
}

#[tokio::test]
async fn test_regenerate_item_keeps_other_items() {
    let graph = FieldGraph::new(vec![Field::new(
        "quiz",
        "Quiz",
        FieldType::ItemSet(ItemSetSpec {
            item_count: 3,
            ..Default::default()
        }),
    )
    .ai_enabled("Write questions")])
    .unwrap();
    let mut lesson = LessonInstance::new("lesson-q", graph);
    let llm = ScriptedLlm::new();
    llm.reply_structured(question_set(3));
    llm.reply_structured(json!({
        "items": [{
            "question": "Which gas do plants release?",
            "choices": { "A": "Oxygen", "B": "Helium", "C": "Neon", "D": "Argon" },
            "standards": [],
            "correct_choice": "A"
        }]
    }));
    let mut orch = orchestrator(llm.clone());
    orch.start(&mut lesson).await.unwrap();
    let before = lesson.values.get(&id("quiz")).cloned();

    let outcome = orch
        .regenerate_item(&mut lesson, &id("quiz"), 1)
        .await
        .unwrap();

    let (Some(FieldValue::Items(old)), FieldValue::Items(new)) = (before, outcome.value) else {
        panic!("expected items");
    };
    assert_eq!(new.len(), 3);
    assert_eq!(new[0], old[0]);
    assert_eq!(new[2], old[2]);
    assert!(new[1].text.starts_with("2. Which gas do plants release?"));
    assert!(new[1].text.ends_with("[Standards: none]\nAnswer: A"));
    assert!(llm.prompts()[1].contains("REGENERATE ITEM:"));
    assert!(outcome.persistence_error.is_none());
}

#[tokio::test]
async fn test_generate_field_ignores_required_gate() {
    let llm = ScriptedLlm::new();
    llm.reply("B from scratch");
    let mut orch = orchestrator(llm.clone());
    let mut lesson = two_field_lesson();

    let outcome = orch.generate_field(&mut lesson, &id("b")).await.unwrap();

    assert_eq!(outcome.value, FieldValue::Text("B from scratch".into()));
    assert!(llm.prompts()[0].contains("A: [Not filled]"));
    assert!(lesson.staleness.has_generated(&id("b")));
    assert_eq!(orch.status(), &SessionStatus::Idle);
}

#[tokio::test]
async fn test_rich_text_is_stored_as_html() {
    let graph = FieldGraph::new(vec![Field::new("overview", "Overview", FieldType::RichText)
        .in_section(Section::Designer, 0)
        .ai_enabled("Write an overview")])
    .unwrap();
    let mut lesson = LessonInstance::new("lesson-r", graph);
    let llm = ScriptedLlm::new();
    llm.reply("Plants need light.\n\nThey also need water.");
    let mut orch = orchestrator(llm);

    orch.start(&mut lesson).await.unwrap();

    assert_eq!(
        lesson.values.get(&id("overview")),
        Some(&FieldValue::RichText(
            "<p>Plants need light.</p><p>They also need water.</p>".into()
        ))
    );
}

#[tokio::test]
async fn test_json_file_store_receives_sections() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonFileResponseStore::new(dir.path()));
    let llm = ScriptedLlm::new();
    let mut orch = GenerationOrchestrator::new(llm, store.clone());
    let mut lesson = two_field_lesson();
    lesson
        .set_value(&id("a"), FieldValue::Text("Photosynthesis unit".into()))
        .unwrap();

    assert_eq!(orch.start(&mut lesson).await.unwrap(), SessionStatus::Completed);

    let saved = store.load("lesson-1").await.unwrap().unwrap();
    assert!(saved.designer.contains_key(&id("a")));
    assert!(saved.builder.contains_key(&id("b")));
}
