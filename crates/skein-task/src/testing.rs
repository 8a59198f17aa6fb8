//! Scripted provider and in-memory workspace for tests

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use skein_ai::{ApiHandler, ApiStream, ApiStreamChunk, Message, Model, RequestMetadata, Usage};

use crate::checkpoint::{CheckpointService, FileChange};

/// One scripted response
pub(crate) enum Script {
    /// Stream these chunks and finish
    Chunks(Vec<ApiStreamChunk>),
    /// Fail before any chunk is produced
    OpenError(skein_ai::Error),
    /// Stream these chunks, then fail
    ChunksThenError(Vec<ApiStreamChunk>, skein_ai::Error),
    /// Stream these chunks, then never finish
    Hang(Vec<ApiStreamChunk>),
}

impl Script {
    pub(crate) fn text(text: &str) -> Self {
        Script::Chunks(vec![
            ApiStreamChunk::text(text),
            ApiStreamChunk::Usage(Usage {
                input: 100,
                output: 20,
                ..Default::default()
            }),
        ])
    }

    pub(crate) fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> Self {
        Script::Chunks(vec![
            ApiStreamChunk::ToolCallPartial {
                index: 0,
                id: Some(id.to_string()),
                name: Some(name.to_string()),
                arguments: Some(arguments.to_string()),
            },
            ApiStreamChunk::Usage(Usage {
                input: 100,
                output: 20,
                ..Default::default()
            }),
        ])
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub metadata: RequestMetadata,
}

#[derive(Clone)]
pub(crate) struct ScriptedApi {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    model: Model,
}

impl ScriptedApi {
    pub(crate) fn new(scripts: Vec<Script>) -> Self {
        Self::with_model(scripts, Model::anthropic("claude-test"))
    }

    pub(crate) fn with_model(scripts: Vec<Script>, model: Model) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
            model,
        }
    }

    pub(crate) fn push(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl ApiHandler for ScriptedApi {
    async fn create_message(
        &self,
        system_prompt: &str,
        messages: &[Message],
        metadata: &RequestMetadata,
    ) -> skein_ai::Result<ApiStream> {
        self.requests.lock().push(RecordedRequest {
            system_prompt: system_prompt.to_string(),
            messages: messages.to_vec(),
            metadata: metadata.clone(),
        });
        let script = self
            .scripts
            .lock()
            .pop_front()
            .ok_or_else(|| skein_ai::Error::UnexpectedResponse("no scripted response left".into()))?;

        let stream: ApiStream = match script {
            Script::Chunks(chunks) => Box::pin(async_stream::stream! {
                for chunk in chunks {
                    yield Ok::<_, skein_ai::Error>(chunk);
                }
            }),
            Script::OpenError(error) => return Err(error),
            Script::ChunksThenError(chunks, error) => Box::pin(async_stream::stream! {
                for chunk in chunks {
                    yield Ok::<_, skein_ai::Error>(chunk);
                }
                yield Err(error);
            }),
            Script::Hang(chunks) => Box::pin(async_stream::stream! {
                for chunk in chunks {
                    yield Ok::<_, skein_ai::Error>(chunk);
                }
                futures::future::pending::<()>().await;
            }),
        };
        Ok(stream)
    }

    fn model(&self) -> Model {
        self.model.clone()
    }
}

#[derive(Default)]
struct Workspace {
    files: BTreeMap<String, String>,
    snapshots: HashMap<String, BTreeMap<String, String>>,
    next_commit: u32,
    fail_saves: bool,
}

impl Workspace {
    fn snapshot(&mut self) -> String {
        self.next_commit += 1;
        let commit = format!("commit-{}", self.next_commit);
        self.snapshots.insert(commit.clone(), self.files.clone());
        commit
    }

    fn files_at(&self, commit: &str) -> crate::error::Result<BTreeMap<String, String>> {
        self.snapshots
            .get(commit)
            .cloned()
            .ok_or_else(|| crate::error::Error::Checkpoint(format!("unknown commit {commit}")))
    }
}

/// In-memory workspace with snapshot support
#[derive(Clone, Default)]
pub(crate) struct MemoryCheckpointService {
    inner: Arc<Mutex<Workspace>>,
}

impl MemoryCheckpointService {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn write(&self, path: &str, content: &str) {
        self.inner.lock().files.insert(path.to_string(), content.to_string());
    }

    pub(crate) fn read(&self, path: &str) -> Option<String> {
        self.inner.lock().files.get(path).cloned()
    }

    /// Take a snapshot without going through a task
    pub(crate) fn snapshot(&self) -> String {
        self.inner.lock().snapshot()
    }

    pub(crate) fn fail_saves(&self, fail: bool) {
        self.inner.lock().fail_saves = fail;
    }
}

#[async_trait]
impl CheckpointService for MemoryCheckpointService {
    async fn save_checkpoint(&self, _label: &str) -> crate::error::Result<String> {
        let mut workspace = self.inner.lock();
        if workspace.fail_saves {
            return Err(crate::error::Error::Checkpoint("simulated save failure".into()));
        }
        Ok(workspace.snapshot())
    }

    async fn restore(&self, commit: &str) -> crate::error::Result<()> {
        let mut workspace = self.inner.lock();
        workspace.files = workspace.files_at(commit)?;
        Ok(())
    }

    async fn diff(&self, from: &str, to: Option<&str>) -> crate::error::Result<Vec<FileChange>> {
        let workspace = self.inner.lock();
        let before = workspace.files_at(from)?;
        let after = match to {
            Some(commit) => workspace.files_at(commit)?,
            None => workspace.files.clone(),
        };
        let paths: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
        Ok(paths
            .into_iter()
            .filter(|path| before.get(*path) != after.get(*path))
            .map(|path| FileChange {
                path: path.clone(),
                before: before.get(path).cloned().unwrap_or_default(),
                after: after.get(path).cloned().unwrap_or_default(),
            })
            .collect())
    }
}
