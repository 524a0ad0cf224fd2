//! Ordered, resumable generation of every AI-enabled field of a lesson.
//!
//! One orchestrator drives one session at a time. Each field is generated,
//! written, snapshotted and persisted before the next one starts, so later
//! fields always see the values produced earlier in the same run.

use std::sync::Arc;

use lessonforge_ai::{CompletionOptions, ImagePipeline, LLMProvider, Message};
use lessonforge_core::prompt::{self, collect_dependency_values};
use lessonforge_core::richtext::text_to_html;
use lessonforge_core::structured::{self, OutputSchema};
use lessonforge_core::{
    AssetStore, Field, FieldId, FieldType, FieldValue, GenerationCheckpoint, ImageDescriptor,
    InMemoryAssetStore, ItemSetSpec, LessonForgeError, LessonInstance, ResponseStore, SetItem,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{GenerationError, Result};
use crate::session::{
    ControlFlags, GenerationSession, PauseReason, Progress, SessionHandle, SessionStatus,
};

/// Result of generating a single field or item outside a session.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldOutcome {
    pub value: FieldValue,
    /// Set when the value was produced but saving it failed
    pub persistence_error: Option<String>,
}

pub struct GenerationOrchestrator {
    text: Arc<dyn LLMProvider>,
    structured: Arc<dyn LLMProvider>,
    images: Option<Arc<ImagePipeline>>,
    responses: Arc<dyn ResponseStore>,
    assets: Arc<dyn AssetStore>,
    options: CompletionOptions,
    status: SessionStatus,
    session: Option<GenerationSession>,
    last_error: Option<GenerationError>,
    flags: Arc<ControlFlags>,
    progress: watch::Sender<Progress>,
}

impl GenerationOrchestrator {
    /// Orchestrator using `text` for every text-like field and for item sets
    /// until a dedicated structured provider is set.
    pub fn new(text: Arc<dyn LLMProvider>, responses: Arc<dyn ResponseStore>) -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            structured: text.clone(),
            text,
            images: None,
            responses,
            assets: Arc::new(InMemoryAssetStore::new()),
            options: CompletionOptions::default(),
            status: SessionStatus::Idle,
            session: None,
            last_error: None,
            flags: Arc::new(ControlFlags::default()),
            progress,
        }
    }

    pub fn with_structured_provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.structured = provider;
        self
    }

    pub fn with_image_pipeline(mut self, pipeline: ImagePipeline) -> Self {
        self.images = Some(Arc::new(pipeline));
        self
    }

    pub fn with_asset_store(mut self, assets: Arc<dyn AssetStore>) -> Self {
        self.assets = assets;
        self
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            flags: self.flags.clone(),
            progress: self.progress.subscribe(),
        }
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// The current session, or the last finished one. A `Completed` or
    /// `Failed` session stays here for reporting until the next `start` or
    /// `resume_from`.
    pub fn session(&self) -> Option<&GenerationSession> {
        self.session.as_ref()
    }

    /// Typed cause of the last `Failed` transition, or `Validation` while
    /// paused for missing context.
    pub fn last_error(&self) -> Option<&GenerationError> {
        self.last_error.as_ref()
    }

    /// Where the paused session stopped, to be stored with the lesson.
    pub fn checkpoint(&self) -> Option<GenerationCheckpoint> {
        let SessionStatus::Paused { resume_index, .. } = self.status else {
            return None;
        };
        self.session.as_ref().map(|s| GenerationCheckpoint {
            queue: s.queue.clone(),
            resume_index,
            missing_fields: s.missing_fields.clone(),
        })
    }

    /// Republish progress after the lesson changed outside a session, e.g.
    /// a hand edit that makes generated fields stale.
    pub fn refresh_progress(&self, lesson: &LessonInstance) {
        self.publish(lesson);
    }

    /// Start a new session over the lesson's generation queue.
    pub async fn start(&mut self, lesson: &mut LessonInstance) -> Result<SessionStatus> {
        match self.status {
            SessionStatus::Idle | SessionStatus::Completed | SessionStatus::Failed { .. } => {}
            _ => return Err(self.invalid("start")),
        }

        self.flags.clear();
        self.last_error = None;
        let queue: Vec<FieldId> = lesson
            .graph
            .ordered_generation_queue()
            .into_iter()
            .map(|f| f.id.clone())
            .collect();
        let session = GenerationSession::new(queue);
        info!(
            "Starting generation session {} for lesson {} ({} fields)",
            session.id,
            lesson.lesson_id,
            session.total()
        );
        self.session = Some(session);

        self.validate_and_run(lesson).await
    }

    /// Continue a paused session at its resume index.
    pub async fn resume(&mut self, lesson: &mut LessonInstance) -> Result<SessionStatus> {
        let SessionStatus::Paused {
            reason,
            resume_index,
        } = self.status
        else {
            return Err(self.invalid("resume"));
        };
        let Some(session) = self.session.as_mut() else {
            return Err(self.invalid("resume"));
        };

        session.current_index = resume_index;
        session.missing_fields.clear();
        self.flags.clear();
        self.last_error = None;
        info!(
            "Resuming session {} at {}/{}",
            session.id,
            resume_index + 1,
            session.total()
        );

        match reason {
            PauseReason::MissingRequiredContext => self.validate_and_run(lesson).await,
            PauseReason::MissingContext | PauseReason::UserRequested => self.run(lesson).await,
        }
    }

    /// Continue a session that was paused in an earlier process. Fields
    /// before the checkpoint's resume index are not generated again;
    /// pre-flight runs over the remaining ones.
    pub async fn resume_from(
        &mut self,
        lesson: &mut LessonInstance,
        checkpoint: GenerationCheckpoint,
    ) -> Result<SessionStatus> {
        match self.status {
            SessionStatus::Idle | SessionStatus::Completed | SessionStatus::Failed { .. } => {}
            _ => return Err(self.invalid("resume")),
        }
        if checkpoint.resume_index > checkpoint.queue.len() {
            return Err(LessonForgeError::InvalidOperation(format!(
                "checkpoint index {} is past the end of its {} field queue",
                checkpoint.resume_index,
                checkpoint.queue.len()
            ))
            .into());
        }
        for field_id in checkpoint.remaining() {
            lesson.graph.require(field_id)?;
        }

        self.flags.clear();
        self.last_error = None;
        let mut session = GenerationSession::new(checkpoint.queue);
        session.current_index = checkpoint.resume_index;
        info!(
            "Resuming lesson {} from checkpoint at {}/{} (session {})",
            lesson.lesson_id,
            session.current_index + 1,
            session.total(),
            session.id
        );
        self.session = Some(session);

        self.validate_and_run(lesson).await
    }

    /// Drop the current session. Values already generated and saved stay.
    pub fn cancel(&mut self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.invalid("cancel"));
        }
        if let Some(session) = self.session.take() {
            info!(
                "Cancelled session {} after {} generated fields",
                session.id,
                session.generated.len()
            );
        }
        self.flags.clear();
        self.last_error = None;
        self.status = SessionStatus::Idle;
        self.progress.send_replace(Progress::default());
        Ok(())
    }

    /// Regenerate one field outside a session. Empty dependencies render as
    /// `[Not filled]` instead of blocking.
    pub async fn generate_field(
        &mut self,
        lesson: &mut LessonInstance,
        field_id: &FieldId,
    ) -> Result<FieldOutcome> {
        self.ensure_not_running("generate a field")?;
        let field = lesson.graph.require(field_id)?;
        if !field.ai_enabled {
            return Err(LessonForgeError::InvalidOperation(format!(
                "field {field_id} is not AI-enabled"
            ))
            .into());
        }

        let persistence_error = self.generate_into(lesson, field_id).await?;
        let value = lesson
            .values
            .get(field_id)
            .cloned()
            .ok_or_else(|| LessonForgeError::FieldNotFound(field_id.clone()))?;
        self.publish(lesson);
        Ok(FieldOutcome {
            value,
            persistence_error,
        })
    }

    /// Replace item `index` of an item-set field with a freshly generated
    /// one, keeping every other item and the item's number.
    pub async fn regenerate_item(
        &mut self,
        lesson: &mut LessonInstance,
        field_id: &FieldId,
        index: usize,
    ) -> Result<FieldOutcome> {
        self.ensure_not_running("regenerate an item")?;
        let field = lesson.graph.require(field_id)?;
        let FieldType::ItemSet(spec) = &field.field_type else {
            return Err(LessonForgeError::InvalidOperation(format!(
                "field {field_id} is not an item set"
            ))
            .into());
        };
        let spec = spec.clone();

        let mut items = match lesson.values.get(field_id) {
            Some(FieldValue::Items(items)) if index < items.len() => items.clone(),
            _ => {
                return Err(LessonForgeError::InvalidOperation(format!(
                    "field {field_id} has no item at index {index}"
                ))
                .into())
            }
        };

        let prompt = {
            let config = lesson.effective_config(field_id)?;
            let dep_ids = lesson.graph.dependencies_of(field_id, &lesson.overrides)?;
            let deps = collect_dependency_values(&lesson.graph, &dep_ids, &lesson.values)?;
            single_item_prompt(&prompt::compile(&config, &deps), &items, index)
        };

        debug!("Regenerating item {} of {}", index + 1, field_id);
        let replacement = self
            .request_items(field_id, &spec, &prompt, 1, index + 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GenerationError::SchemaViolation {
                field: field_id.clone(),
                violation: structured::SchemaViolation::ItemCount {
                    expected: 1,
                    actual: 0,
                },
            })?;
        items[index] = replacement;

        let value = FieldValue::Items(items);
        lesson.values.set(field_id.clone(), value.clone());
        let persistence_error = self.persist(lesson).await;
        self.publish(lesson);
        Ok(FieldOutcome {
            value,
            persistence_error,
        })
    }

    async fn validate_and_run(&mut self, lesson: &mut LessonInstance) -> Result<SessionStatus> {
        self.status = SessionStatus::Validating;
        self.publish(lesson);

        let from = self.session.as_ref().map_or(0, |s| s.current_index);
        let missing = match self.preflight(lesson, from) {
            Ok(missing) => missing,
            Err(e) => {
                self.fail(lesson, from, e);
                return Ok(self.status.clone());
            }
        };
        if !missing.is_empty() {
            self.pause(lesson, PauseReason::MissingRequiredContext, from, missing);
            return Ok(self.status.clone());
        }

        self.run(lesson).await
    }

    /// Required dependencies of queued fields that are still empty.
    fn preflight(&self, lesson: &LessonInstance, from: usize) -> Result<Vec<FieldId>> {
        let Some(session) = self.session.as_ref() else {
            return Ok(Vec::new());
        };
        let mut missing = Vec::new();
        for field_id in session.queue.iter().skip(from) {
            for dep in lesson.graph.dependencies_of(field_id, &lesson.overrides)? {
                let required = lesson
                    .graph
                    .field(&dep)
                    .is_some_and(|f| f.required_for_generation);
                if required && !lesson.values.is_filled(&dep) && !missing.contains(&dep) {
                    missing.push(dep);
                }
            }
        }
        Ok(missing)
    }

    async fn run(&mut self, lesson: &mut LessonInstance) -> Result<SessionStatus> {
        self.status = SessionStatus::Generating;
        self.publish(lesson);

        loop {
            let Some(session) = self.session.as_ref() else {
                return Err(self.invalid("generate"));
            };
            let index = session.current_index;
            let Some(field_id) = session.queue.get(index).cloned() else {
                info!(
                    "Session {} completed: {} fields generated",
                    session.id,
                    session.generated.len()
                );
                self.status = SessionStatus::Completed;
                self.publish(lesson);
                return Ok(self.status.clone());
            };

            if self.flags.take_cancel() {
                self.cancel()?;
                return Ok(self.status.clone());
            }
            if self.flags.take_pause() {
                self.pause(lesson, PauseReason::UserRequested, index, Vec::new());
                return Ok(self.status.clone());
            }

            let dep_ids = match lesson.graph.dependencies_of(&field_id, &lesson.overrides) {
                Ok(ids) => ids,
                Err(e) => {
                    self.fail(lesson, index, e.into());
                    return Ok(self.status.clone());
                }
            };
            let missing: Vec<FieldId> = dep_ids
                .into_iter()
                .filter(|dep| !lesson.values.is_filled(dep))
                .collect();
            if !missing.is_empty() {
                self.pause(lesson, PauseReason::MissingContext, index, missing);
                return Ok(self.status.clone());
            }

            debug!(
                "Generating field {} ({}/{})",
                field_id,
                index + 1,
                self.session.as_ref().map_or(0, GenerationSession::total)
            );
            match self.generate_into(lesson, &field_id).await {
                Ok(persistence_error) => {
                    if let Some(session) = self.session.as_mut() {
                        if let Some(message) = persistence_error {
                            session.persistence_errors.push(message);
                        }
                        session.generated.push(field_id);
                        session.current_index = index + 1;
                    }
                    self.publish(lesson);
                }
                Err(e) => {
                    self.fail(lesson, index, e);
                    return Ok(self.status.clone());
                }
            }
        }
    }

    /// Compile, call, write, snapshot, persist. Returns the persistence
    /// error message if saving failed; the generated value is kept either way.
    async fn generate_into(
        &self,
        lesson: &mut LessonInstance,
        field_id: &FieldId,
    ) -> Result<Option<String>> {
        let field = lesson.graph.require(field_id)?.clone();
        let dep_ids = lesson.graph.dependencies_of(field_id, &lesson.overrides)?;
        let prompt = {
            let config = lesson.effective_config(field_id)?;
            let deps = collect_dependency_values(&lesson.graph, &dep_ids, &lesson.values)?;
            prompt::compile(&config, &deps)
        };

        let value = self.call_service(&lesson.lesson_id, &field, &prompt).await?;
        let previous = lesson.values.set(field_id.clone(), value);
        if let Some(previous) = previous {
            self.release_replaced_asset(previous, lesson.values.get(field_id))
                .await;
        }

        let deps = collect_dependency_values(&lesson.graph, &dep_ids, &lesson.values)?;
        lesson.staleness.record_snapshot(field_id, &deps);

        Ok(self.persist(lesson).await)
    }

    async fn call_service(
        &self,
        lesson_id: &str,
        field: &Field,
        prompt: &str,
    ) -> Result<FieldValue> {
        match &field.field_type {
            FieldType::Text => Ok(FieldValue::Text(self.complete_text(&field.id, prompt).await?)),
            FieldType::RichText => Ok(FieldValue::RichText(text_to_html(
                &self.complete_text(&field.id, prompt).await?,
            ))),
            FieldType::ItemSet(spec) => Ok(FieldValue::Items(
                self.request_items(&field.id, spec, prompt, spec.item_count, 1)
                    .await?,
            )),
            FieldType::Image => self.generate_image(lesson_id, &field.id, prompt).await,
        }
    }

    async fn complete_text(&self, field_id: &FieldId, prompt: &str) -> Result<String> {
        let response = self
            .text
            .generate_chat(&[Message::user(prompt)], &self.options)
            .await
            .map_err(|e| GenerationError::from_ai(field_id, e))?;
        let content = response.content.trim();
        if content.is_empty() {
            return Err(GenerationError::Transport {
                field: field_id.clone(),
                message: format!("{} returned an empty response", self.text.provider_name()),
            });
        }
        Ok(content.to_string())
    }

    async fn request_items(
        &self,
        field_id: &FieldId,
        spec: &ItemSetSpec,
        prompt: &str,
        count: usize,
        first_number: usize,
    ) -> Result<Vec<SetItem>> {
        let schema = OutputSchema::for_item_set(spec, count);
        let raw = self
            .structured
            .generate_structured(&[Message::user(prompt)], &schema, &self.options)
            .await
            .map_err(|e| GenerationError::from_structured(field_id, e))?;

        structured::adapt(&raw, spec, count, first_number).map_err(|violation| {
            GenerationError::SchemaViolation {
                field: field_id.clone(),
                violation,
            }
        })
    }

    async fn generate_image(
        &self,
        lesson_id: &str,
        field_id: &FieldId,
        prompt: &str,
    ) -> Result<FieldValue> {
        let pipeline = self.images.as_ref().ok_or_else(|| GenerationError::Transport {
            field: field_id.clone(),
            message: "image generation is not configured".to_string(),
        })?;

        let image = pipeline
            .generate(prompt)
            .await
            .map_err(|e| GenerationError::from_image(field_id, e))?;
        let url = self
            .assets
            .upload(lesson_id, image.bytes, &image.content_type)
            .await
            .map_err(|e| GenerationError::Transport {
                field: field_id.clone(),
                message: format!("image upload failed: {e}"),
            })?;

        Ok(FieldValue::Image(ImageDescriptor {
            url,
            alt_text: image.alt_text,
            model_used: Some(image.model_used),
        }))
    }

    async fn release_replaced_asset(&self, previous: FieldValue, current: Option<&FieldValue>) {
        let FieldValue::Image(old) = previous else {
            return;
        };
        let still_used = matches!(current, Some(FieldValue::Image(new)) if new.url == old.url);
        if old.url.trim().is_empty() || still_used {
            return;
        }
        if let Err(e) = self.assets.delete(&old.url).await {
            warn!("Failed to delete replaced image {}: {}", old.url, e);
        }
    }

    async fn persist(&self, lesson: &LessonInstance) -> Option<String> {
        let responses = lesson.responses();
        match self.responses.save(&lesson.lesson_id, &responses).await {
            Ok(()) => None,
            Err(e) => {
                let error = GenerationError::Persistence(e.to_string());
                error!("Lesson {}: {}", lesson.lesson_id, error);
                Some(error.to_string())
            }
        }
    }

    fn pause(
        &mut self,
        lesson: &LessonInstance,
        reason: PauseReason,
        resume_index: usize,
        missing: Vec<FieldId>,
    ) {
        if let Some(session) = self.session.as_mut() {
            let field = session
                .queue
                .get(resume_index)
                .cloned()
                .unwrap_or_else(|| FieldId::new(""));
            warn!(
                "Session {} paused ({}) at {} ({}/{}); missing: {:?}",
                session.id,
                reason,
                field,
                resume_index + 1,
                session.total(),
                missing.iter().map(FieldId::as_str).collect::<Vec<_>>()
            );
            self.last_error = match reason {
                PauseReason::UserRequested => None,
                PauseReason::MissingContext | PauseReason::MissingRequiredContext => {
                    let blocked = blocked_field(
                        lesson,
                        session.queue.get(resume_index..).unwrap_or_default(),
                        &missing,
                    );
                    Some(GenerationError::Validation {
                        field: blocked.unwrap_or(field),
                        missing: missing.clone(),
                    })
                }
            };
            session.current_index = resume_index;
            session.missing_fields = missing;
        }
        self.status = SessionStatus::Paused {
            reason,
            resume_index,
        };
        self.publish(lesson);
    }

    fn fail(&mut self, lesson: &LessonInstance, index: usize, error: GenerationError) {
        let (field_id, total) = self
            .session
            .as_ref()
            .map(|s| (s.queue.get(index).cloned(), s.total()))
            .unwrap_or((None, 0));
        let field_id = field_id.unwrap_or_else(|| FieldId::new(""));
        error!(
            "Generation failed at {} ({}/{}): {}",
            field_id,
            index + 1,
            total,
            error
        );
        self.status = SessionStatus::Failed {
            field_id,
            index,
            total,
            message: error.to_string(),
        };
        self.last_error = Some(error);
        self.publish(lesson);
    }

    fn publish(&self, lesson: &LessonInstance) {
        let session = self.session.as_ref();
        let (pause_reason, pause_cause) = match &self.status {
            SessionStatus::Paused { reason, .. } => (
                Some(*reason),
                self.last_error.as_ref().map(GenerationError::to_string),
            ),
            _ => (None, None),
        };
        self.progress.send_replace(Progress {
            status: self.status.clone(),
            current_index: session.map_or(0, |s| s.current_index),
            total: session.map_or(0, GenerationSession::total),
            current_field: session.and_then(|s| s.current_field().cloned()),
            pause_reason,
            pause_cause,
            missing_fields: session.map(|s| s.missing_fields.clone()).unwrap_or_default(),
            stale_fields: lesson.stale_fields(),
            persistence_errors: session
                .map(|s| s.persistence_errors.clone())
                .unwrap_or_default(),
        });
    }

    fn ensure_not_running(&self, action: &'static str) -> Result<()> {
        match self.status {
            SessionStatus::Validating | SessionStatus::Generating => Err(self.invalid(action)),
            _ => Ok(()),
        }
    }

    fn invalid(&self, action: &'static str) -> GenerationError {
        GenerationError::InvalidTransition {
            action,
            state: self.status.to_string(),
        }
    }
}

/// First queued field that depends on one of the missing fields.
fn blocked_field(
    lesson: &LessonInstance,
    queue: &[FieldId],
    missing: &[FieldId],
) -> Option<FieldId> {
    queue
        .iter()
        .find(|id| {
            lesson
                .graph
                .dependencies_of(id, &lesson.overrides)
                .is_ok_and(|deps| deps.iter().any(|dep| missing.contains(dep)))
        })
        .cloned()
}

/// The field's normal prompt plus the position to replace and the items to
/// keep distinct from.
fn single_item_prompt(base: &str, items: &[SetItem], index: usize) -> String {
    let others: Vec<&str> = items
        .iter()
        .enumerate()
        .filter(|(i, item)| *i != index && !item.is_empty())
        .map(|(_, item)| item.text.as_str())
        .collect();
    let mut prompt = format!(
        "{base}\n\nREGENERATE ITEM:\nWrite only item {} as a single replacement.",
        index + 1
    );
    if !others.is_empty() {
        prompt.push_str(" Do not repeat these existing items:\n");
        prompt.push_str(&others.join("\n"));
    }
    prompt
}
