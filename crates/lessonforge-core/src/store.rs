use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::field::{FieldId, Section};
use crate::graph::FieldGraph;
use crate::value::FieldValues;
use crate::{FieldValue, LessonForgeError, Result};

/// Persisted responses of one lesson, split by template section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LessonResponses {
    #[serde(default)]
    pub designer: BTreeMap<FieldId, FieldValue>,
    #[serde(default)]
    pub builder: BTreeMap<FieldId, FieldValue>,
}

impl LessonResponses {
    /// Split the current values by the section of their field. Values of
    /// fields unknown to the graph are not persisted.
    pub fn from_values(graph: &FieldGraph, values: &FieldValues) -> Self {
        let mut responses = Self::default();
        for (id, value) in values.iter() {
            match graph.field(id).map(|f| f.section) {
                Some(Section::Designer) => {
                    responses.designer.insert(id.clone(), value.clone());
                }
                Some(Section::Builder) => {
                    responses.builder.insert(id.clone(), value.clone());
                }
                None => {}
            }
        }
        responses
    }

    pub fn into_values(self) -> FieldValues {
        self.designer.into_iter().chain(self.builder).collect()
    }
}

/// Persistence collaborator. `save` is an idempotent upsert keyed by lesson.
#[async_trait]
pub trait ResponseStore: Send + Sync {
    async fn save(&self, lesson_id: &str, responses: &LessonResponses) -> Result<()>;
    async fn load(&self, lesson_id: &str) -> Result<Option<LessonResponses>>;
}

#[derive(Default)]
pub struct InMemoryResponseStore {
    lessons: DashMap<String, LessonResponses>,
}

impl InMemoryResponseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResponseStore for InMemoryResponseStore {
    async fn save(&self, lesson_id: &str, responses: &LessonResponses) -> Result<()> {
        self.lessons.insert(lesson_id.to_string(), responses.clone());
        Ok(())
    }

    async fn load(&self, lesson_id: &str) -> Result<Option<LessonResponses>> {
        Ok(self.lessons.get(lesson_id).map(|r| r.clone()))
    }
}

/// One JSON document per lesson under a data directory.
pub struct JsonFileResponseStore {
    root: PathBuf,
}

impl JsonFileResponseStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, lesson_id: &str) -> Result<PathBuf> {
        let valid = !lesson_id.is_empty()
            && lesson_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(LessonForgeError::Storage(format!(
                "invalid lesson id for file storage: {lesson_id:?}"
            )));
        }
        Ok(self.root.join(format!("{lesson_id}.responses.json")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ResponseStore for JsonFileResponseStore {
    async fn save(&self, lesson_id: &str, responses: &LessonResponses) -> Result<()> {
        let path = self.path_for(lesson_id)?;
        tokio::fs::create_dir_all(&self.root).await?;
        let body = serde_json::to_vec_pretty(responses)?;

        // Temp file then rename; readers never see a partial document.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Saved responses for lesson {} to {}", lesson_id, path.display());
        Ok(())
    }

    async fn load(&self, lesson_id: &str) -> Result<Option<LessonResponses>> {
        let path = self.path_for(lesson_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Upload/delete contract for generated binary assets.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Store the bytes and return the URL they are reachable at.
    async fn upload(&self, lesson_id: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;
    async fn delete(&self, url: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct StoredAsset {
    pub lesson_id: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
pub struct InMemoryAssetStore {
    assets: Mutex<BTreeMap<String, StoredAsset>>,
}

impl InMemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &str) -> Option<StoredAsset> {
        self.assets.lock().get(url).cloned()
    }

    pub fn len(&self) -> usize {
        self.assets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.lock().is_empty()
    }
}

#[async_trait]
impl AssetStore for InMemoryAssetStore {
    async fn upload(&self, lesson_id: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let url = format!("memory://{}/{}", lesson_id, Uuid::new_v4());
        self.assets.lock().insert(
            url.clone(),
            StoredAsset {
                lesson_id: lesson_id.to_string(),
                content_type: content_type.to_string(),
                bytes,
            },
        );
        Ok(url)
    }

    async fn delete(&self, url: &str) -> Result<()> {
        self.assets
            .lock()
            .remove(url)
            .map(|_| ())
            .ok_or_else(|| LessonForgeError::Storage(format!("no asset at {url}")))
    }
}

/// Assets written under `<root>/<lesson_id>/`; the returned URL is the
/// file path.
pub struct FileAssetStore {
    root: PathBuf,
}

impl FileAssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn extension_for(content_type: &str) -> &'static str {
        match content_type {
            "image/png" => "png",
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "bin",
        }
    }
}

#[async_trait]
impl AssetStore for FileAssetStore {
    async fn upload(&self, lesson_id: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        if lesson_id.is_empty() || lesson_id.contains(['/', '\\', '.']) {
            return Err(LessonForgeError::Storage(format!(
                "invalid lesson id for asset storage: {lesson_id:?}"
            )));
        }
        let dir = self.root.join(lesson_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!(
            "{}.{}",
            Uuid::new_v4(),
            Self::extension_for(content_type)
        ));
        tokio::fs::write(&path, bytes).await?;
        debug!("Stored {} asset at {}", content_type, path.display());
        Ok(path.display().to_string())
    }

    /// Only plain paths below the root are removed; `..`, `.` and other
    /// non-normal components are rejected before touching the filesystem.
    async fn delete(&self, url: &str) -> Result<()> {
        let path = Path::new(url);
        let inside = path.strip_prefix(&self.root).is_ok_and(|rest| {
            rest.components().next().is_some()
                && rest.components().all(|c| matches!(c, Component::Normal(_)))
        });
        if !inside {
            return Err(LessonForgeError::Storage(format!(
                "asset {url} is outside {}",
                self.root.display()
            )));
        }
        tokio::fs::remove_file(path).await?;
        Ok(())
    }
}
