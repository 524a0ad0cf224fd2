#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use lessonforge_ai::{
    AiError, CompletionOptions, GeneratedImage, ImageError, ImageProvider, LLMProvider,
    LLMResponse, LLMResult, Message, ProviderCharacteristics, VisionProvider,
};
use lessonforge_core::{
    Field, FieldGraph, FieldType, LessonForgeError, LessonInstance, LessonResponses,
    OutputSchema, ResponseStore, Section,
};
use lessonforge_engine::SessionHandle;
use parking_lot::Mutex;
use serde_json::{json, Value};

/// LLM fake that answers from scripted queues and records every prompt.
#[derive(Default)]
pub struct ScriptedLlm {
    text: Mutex<VecDeque<LLMResult<String>>>,
    structured: Mutex<VecDeque<LLMResult<Value>>>,
    prompts: Mutex<Vec<String>>,
    /// Request a pause or cancel through the handle after the n-th call
    interrupt: Mutex<Option<(usize, SessionHandle, Interrupt)>>,
}

#[derive(Clone, Copy)]
pub enum Interrupt {
    Pause,
    Cancel,
}

impl ScriptedLlm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, text: &str) {
        self.text.lock().push_back(Ok(text.to_string()));
    }

    pub fn reply_err(&self, error: AiError) {
        self.text.lock().push_back(Err(error));
    }

    pub fn reply_structured(&self, value: Value) {
        self.structured.lock().push_back(Ok(value));
    }

    pub fn interrupt_after(&self, calls: usize, handle: SessionHandle, kind: Interrupt) {
        *self.interrupt.lock() = Some((calls, handle, kind));
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    fn record(&self, messages: &[Message]) {
        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let calls = {
            let mut prompts = self.prompts.lock();
            prompts.push(prompt);
            prompts.len()
        };
        if let Some((after, handle, kind)) = self.interrupt.lock().as_ref() {
            if *after == calls {
                match kind {
                    Interrupt::Pause => handle.request_pause(),
                    Interrupt::Cancel => handle.request_cancel(),
                }
            }
        }
    }
}

#[async_trait]
impl LLMProvider for ScriptedLlm {
    async fn generate_chat(
        &self,
        messages: &[Message],
        _options: &CompletionOptions,
    ) -> LLMResult<LLMResponse> {
        self.record(messages);
        let content = self
            .text
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok("generated text".to_string()))?;
        Ok(LLMResponse {
            content,
            total_tokens: None,
            finish_reason: Some("stop".into()),
            model: "scripted".into(),
        })
    }

    async fn generate_structured(
        &self,
        messages: &[Message],
        schema: &OutputSchema,
        _options: &CompletionOptions,
    ) -> LLMResult<Value> {
        self.record(messages);
        self.structured
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(question_set(schema.min_items)))
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted"
    }

    fn characteristics(&self) -> ProviderCharacteristics {
        ProviderCharacteristics {
            max_tokens: 8192,
            avg_latency_ms: 0,
            rpm_limit: None,
            supports_structured_output: true,
        }
    }
}

/// Provider that only implements chat and always answers with the same
/// text, so structured calls go through the trait's JSON extraction.
pub struct ChatOnlyLlm(pub String);

#[async_trait]
impl LLMProvider for ChatOnlyLlm {
    async fn generate_chat(
        &self,
        _messages: &[Message],
        _options: &CompletionOptions,
    ) -> LLMResult<LLMResponse> {
        Ok(LLMResponse {
            content: self.0.clone(),
            total_tokens: None,
            finish_reason: Some("stop".into()),
            model: "chat-only".into(),
        })
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn provider_name(&self) -> &str {
        "chat-only"
    }

    fn model_name(&self) -> &str {
        "chat-only"
    }

    fn characteristics(&self) -> ProviderCharacteristics {
        ProviderCharacteristics {
            max_tokens: 8192,
            avg_latency_ms: 0,
            rpm_limit: None,
            supports_structured_output: false,
        }
    }
}

/// Structured answer with `n` well-formed questions.
pub fn question_set(n: usize) -> Value {
    let items: Vec<Value> = (1..=n)
        .map(|i| {
            json!({
                "question": format!("Question {i}?"),
                "choices": { "A": "one", "B": "two", "C": "three", "D": "four" },
                "standards": ["LS1.C"],
                "correct_choice": "B"
            })
        })
        .collect();
    json!({ "items": items })
}

/// Store whose saves always fail.
#[derive(Default)]
pub struct FailingStore {
    pub attempts: Mutex<usize>,
}

#[async_trait]
impl ResponseStore for FailingStore {
    async fn save(
        &self,
        _lesson_id: &str,
        _responses: &LessonResponses,
    ) -> lessonforge_core::Result<()> {
        *self.attempts.lock() += 1;
        Err(LessonForgeError::Storage("disk full".into()))
    }

    async fn load(&self, _lesson_id: &str) -> lessonforge_core::Result<Option<LessonResponses>> {
        Ok(None)
    }
}

pub struct ScriptedImages {
    pub script: Mutex<VecDeque<Result<GeneratedImage, ImageError>>>,
    pub calls: Mutex<usize>,
}

impl ScriptedImages {
    pub fn new(script: Vec<Result<GeneratedImage, ImageError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(0),
        })
    }
}

#[async_trait]
impl ImageProvider for ScriptedImages {
    async fn generate_image(&self, _prompt: &str) -> Result<GeneratedImage, ImageError> {
        *self.calls.lock() += 1;
        self.script.lock().pop_front().unwrap_or_else(|| Ok(png("primary")))
    }

    fn model_name(&self) -> &str {
        "scripted-image"
    }
}

pub struct FixedVision(pub String);

#[async_trait]
impl VisionProvider for FixedVision {
    async fn describe_image(&self, _bytes: &[u8], _content_type: &str) -> LLMResult<String> {
        Ok(self.0.clone())
    }
}

pub fn png(model: &str) -> GeneratedImage {
    GeneratedImage {
        bytes: vec![0x89, b'P', b'N', b'G'],
        content_type: "image/png".into(),
        model_used: model.into(),
        alt_text: None,
    }
}

/// A (required, no dependencies) and B (depends on A), both AI-enabled.
pub fn two_field_lesson() -> LessonInstance {
    let graph = FieldGraph::new(vec![
        Field::new("a", "A", FieldType::Text)
            .in_section(Section::Designer, 0)
            .ai_enabled("Write A")
            .required(),
        Field::new("b", "B", FieldType::Text)
            .in_section(Section::Builder, 0)
            .ai_enabled("Write B")
            .depends_on(["a"]),
    ])
    .expect("valid graph");
    LessonInstance::new("lesson-1", graph)
}
