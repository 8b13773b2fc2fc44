//! Document-store abstraction and batch write orchestration for ScanTrack.
//!
//! Two backends: an in-memory store for tests and callers that flush
//! elsewhere, and a JSON-file store with atomic create-new semantics. The
//! orchestrator chunks pending writes, commits chunks strictly sequentially
//! with a pacing pause, and reports uniform per-key outcomes regardless of
//! which write strategy the backend offers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "scantrack-storage";

/// Default chunk size for many small documents (scan rows).
pub const CHUNK_MANY_SMALL: usize = 400;
/// Default chunk size for fewer, larger documents (latest state).
pub const CHUNK_FEW_LARGE: usize = 150;
/// Default chunk size for aggregated documents (history buckets, indices).
pub const CHUNK_AGGREGATED: usize = 100;

/// Default pause between committed chunks.
pub const DEFAULT_CHUNK_PAUSE: Duration = Duration::from_millis(150);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document already exists: {collection}/{key}")]
    AlreadyExists { collection: String, key: String },
    #[error("permission denied: {collection}/{key}")]
    PermissionDenied { collection: String, key: String },
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("document serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Backend(String),
}

impl StoreError {
    /// A conflict signature: the key already holds a protected document.
    /// Create-only paths report this as `AlreadyExists`; write paths without
    /// an atomic create surface it as `PermissionDenied` instead.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::AlreadyExists { .. } | StoreError::PermissionDenied { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fails with a conflict if the key already exists.
    Create,
    /// Shallow-merges top-level object fields into any existing document.
    Merge,
    /// Replaces the document wholesale.
    Set,
}

/// One pending document write.
#[derive(Debug, Clone)]
pub struct WriteOp {
    pub collection: String,
    pub key: String,
    pub doc: Value,
    pub mode: WriteMode,
}

impl WriteOp {
    pub fn new(
        collection: impl Into<String>,
        key: impl Into<String>,
        doc: Value,
        mode: WriteMode,
    ) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            doc,
            mode,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteStatus {
    Created,
    Duplicate,
    Error,
}

/// Per-key result of a write, uniform across both strategies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub key: String,
    pub status: WriteStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WriteOutcome {
    pub fn created(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            status: WriteStatus::Created,
            message: None,
        }
    }

    pub fn duplicate(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            status: WriteStatus::Duplicate,
            message: None,
        }
    }

    pub fn error(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            status: WriteStatus::Error,
            message: Some(message.into()),
        }
    }

    pub fn from_store_error(key: impl Into<String>, err: &StoreError) -> Self {
        if err.is_conflict() {
            Self::duplicate(key)
        } else {
            Self::error(key, err.to_string())
        }
    }
}

/// High-throughput per-document write strategy: every op gets its own
/// outcome, a failure affects only that document.
#[async_trait]
pub trait StreamingWriter: Send + Sync {
    async fn write_all(&self, ops: Vec<WriteOp>) -> Vec<WriteOutcome>;
}

/// Backing document store. `create` must be conflict-detectable;
/// `commit_batch` treats the whole op list as one unit. `streaming` is an
/// optional capability the orchestrator prefers when present.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError>;
    async fn create(&self, collection: &str, key: &str, doc: Value) -> Result<(), StoreError>;
    async fn merge(&self, collection: &str, key: &str, doc: Value) -> Result<(), StoreError>;
    async fn set(&self, collection: &str, key: &str, doc: Value) -> Result<(), StoreError>;
    async fn commit_batch(&self, ops: Vec<WriteOp>) -> Result<(), StoreError>;

    fn streaming(&self) -> Option<Arc<dyn StreamingWriter>> {
        None
    }
}

/// Shallow merge: top-level fields of `incoming` replace those of `existing`;
/// non-object documents are replaced wholesale.
pub fn merge_values(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Object(base), Value::Object(update)) => {
            for (key, value) in update {
                base.insert(key, value);
            }
        }
        (slot, incoming) => *slot = incoming,
    }
}

#[derive(Default)]
struct MemoryState {
    collections: HashMap<String, BTreeMap<String, Value>>,
}

/// In-memory store. Collections marked create-only reject overwrites of
/// existing documents with a permission-denied signature, mirroring a store
/// whose rules protect persisted scans. Configuration lives on the store
/// itself; clones share documents but carry the configuration they were
/// cloned with.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    create_only: HashSet<String>,
    fail_marker: Option<String>,
    streaming_enabled: bool,
}

impl MemoryStore {
    fn check_op(
        state: &MemoryState,
        create_only: &HashSet<String>,
        fail_marker: &Option<String>,
        op: &WriteOp,
    ) -> Result<(), StoreError> {
        if let Some(marker) = fail_marker {
            if op.key.contains(marker.as_str()) {
                return Err(StoreError::Backend(format!(
                    "injected write failure for key {}",
                    op.key
                )));
            }
        }
        let exists = state
            .collections
            .get(&op.collection)
            .is_some_and(|docs| docs.contains_key(&op.key));
        match op.mode {
            WriteMode::Create if exists => Err(StoreError::AlreadyExists {
                collection: op.collection.clone(),
                key: op.key.clone(),
            }),
            WriteMode::Merge | WriteMode::Set if exists && create_only.contains(&op.collection) => {
                Err(StoreError::PermissionDenied {
                    collection: op.collection.clone(),
                    key: op.key.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    fn apply_op(state: &mut MemoryState, op: WriteOp) {
        let docs = state.collections.entry(op.collection).or_default();
        match op.mode {
            WriteMode::Create | WriteMode::Set => {
                docs.insert(op.key, op.doc);
            }
            WriteMode::Merge => match docs.get_mut(&op.key) {
                Some(existing) => merge_values(existing, op.doc),
                None => {
                    docs.insert(op.key, op.doc);
                }
            },
        }
    }

    async fn write_one(&self, op: WriteOp) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        Self::check_op(&state, &self.create_only, &self.fail_marker, &op)?;
        Self::apply_op(&mut state, op);
        Ok(())
    }

    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            create_only: HashSet::new(),
            fail_marker: None,
            streaming_enabled: true,
        }
    }

    /// Marks collections that refuse `set`/`merge` on an existing document.
    pub fn with_create_only(collections: &[&str]) -> Self {
        Self {
            create_only: collections.iter().map(|c| c.to_string()).collect(),
            ..Self::new()
        }
    }

    /// Drops the streaming capability so the orchestrator exercises the
    /// batched-transaction fallback.
    pub fn without_streaming(mut self) -> Self {
        self.streaming_enabled = false;
        self
    }

    /// Any write whose key contains the marker fails with a backend error.
    pub fn with_write_failure(mut self, key_marker: impl Into<String>) -> Self {
        self.fail_marker = Some(key_marker.into());
        self
    }

    pub async fn document_count(&self, collection: &str) -> usize {
        let state = self.state.lock().await;
        state
            .collections
            .get(collection)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .collections
            .get(collection)
            .and_then(|docs| docs.get(key))
            .cloned())
    }

    async fn create(&self, collection: &str, key: &str, doc: Value) -> Result<(), StoreError> {
        self.write_one(WriteOp::new(collection, key, doc, WriteMode::Create))
            .await
    }

    async fn merge(&self, collection: &str, key: &str, doc: Value) -> Result<(), StoreError> {
        self.write_one(WriteOp::new(collection, key, doc, WriteMode::Merge))
            .await
    }

    async fn set(&self, collection: &str, key: &str, doc: Value) -> Result<(), StoreError> {
        self.write_one(WriteOp::new(collection, key, doc, WriteMode::Set))
            .await
    }

    /// Atomic: every op is validated against the current state, then all are
    /// applied to a staged copy that replaces the state in one swap.
    async fn commit_batch(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut staged = MemoryState {
            collections: state.collections.clone(),
        };
        for op in ops {
            Self::check_op(&staged, &self.create_only, &self.fail_marker, &op)?;
            Self::apply_op(&mut staged, op);
        }
        state.collections = staged.collections;
        Ok(())
    }

    fn streaming(&self) -> Option<Arc<dyn StreamingWriter>> {
        if self.streaming_enabled {
            Some(Arc::new(MemoryStreaming {
                store: self.clone(),
            }))
        } else {
            None
        }
    }
}

struct MemoryStreaming {
    store: MemoryStore,
}

#[async_trait]
impl StreamingWriter for MemoryStreaming {
    async fn write_all(&self, ops: Vec<WriteOp>) -> Vec<WriteOutcome> {
        let mut outcomes = Vec::with_capacity(ops.len());
        for op in ops {
            let key = op.key.clone();
            match self.store.write_one(op).await {
                Ok(()) => outcomes.push(WriteOutcome::created(key)),
                Err(err) => outcomes.push(WriteOutcome::from_store_error(key, &err)),
            }
        }
        outcomes
    }
}

struct FsInner {
    root: PathBuf,
}

impl FsInner {
    fn document_path(&self, collection: &str, key: &str) -> PathBuf {
        self.root.join(collection).join(file_name_for_key(key))
    }

    async fn ensure_collection_dir(&self, collection: &str) -> Result<PathBuf, StoreError> {
        let dir = self.root.join(collection);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn write_atomic(&self, collection: &str, key: &str, doc: &Value) -> Result<(), StoreError> {
        let dir = self.ensure_collection_dir(collection).await?;
        let path = self.document_path(collection, key);
        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(doc)?;
        fs::write(&temp_path, &bytes).await?;
        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err.into())
            }
        }
    }

    async fn apply_one(&self, op: WriteOp) -> Result<(), StoreError> {
        match op.mode {
            WriteMode::Create => self.create_new(&op.collection, &op.key, &op.doc).await,
            WriteMode::Set => self.write_atomic(&op.collection, &op.key, &op.doc).await,
            WriteMode::Merge => {
                let mut merged = self
                    .read(&op.collection, &op.key)
                    .await?
                    .unwrap_or(Value::Object(Default::default()));
                merge_values(&mut merged, op.doc);
                self.write_atomic(&op.collection, &op.key, &merged).await
            }
        }
    }

    async fn create_new(&self, collection: &str, key: &str, doc: &Value) -> Result<(), StoreError> {
        self.ensure_collection_dir(collection).await?;
        let path = self.document_path(collection, key);
        let bytes = serde_json::to_vec_pretty(doc)?;
        let open_result = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await;
        let mut file = match open_result {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists {
                    collection: collection.to_string(),
                    key: key.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        file.write_all(&bytes).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.document_path(collection, key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes the op's final document to a temp file next to its target and
    /// returns `(temp, target)` without renaming.
    async fn stage_op(&self, op: WriteOp) -> Result<(PathBuf, PathBuf), StoreError> {
        let dir = self.ensure_collection_dir(&op.collection).await?;
        let path = self.document_path(&op.collection, &op.key);
        let doc = match op.mode {
            WriteMode::Merge => {
                let mut merged = self
                    .read(&op.collection, &op.key)
                    .await?
                    .unwrap_or(Value::Object(Default::default()));
                merge_values(&mut merged, op.doc);
                merged
            }
            WriteMode::Create | WriteMode::Set => op.doc,
        };
        let temp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(&doc)?;
        if let Err(err) = fs::write(&temp, &bytes).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err.into());
        }
        Ok((temp, path))
    }
}

/// One JSON file per document under `root/collection/`. Creates are atomic
/// via `create_new`; replaces go through a temp file and rename. Keys unsafe
/// for file names are addressed by their SHA-256.
#[derive(Clone)]
pub struct FsDocumentStore {
    inner: Arc<FsInner>,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(FsInner { root: root.into() }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }
}

fn file_name_for_key(key: &str) -> String {
    let safe = !key.is_empty()
        && key.len() <= 120
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if safe {
        format!("{key}.json")
    } else {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        format!("{}.json", hex::encode(hasher.finalize()))
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.read(collection, key).await
    }

    async fn create(&self, collection: &str, key: &str, doc: Value) -> Result<(), StoreError> {
        self.inner.create_new(collection, key, &doc).await
    }

    async fn merge(&self, collection: &str, key: &str, doc: Value) -> Result<(), StoreError> {
        self.inner
            .apply_one(WriteOp::new(collection, key, doc, WriteMode::Merge))
            .await
    }

    async fn set(&self, collection: &str, key: &str, doc: Value) -> Result<(), StoreError> {
        self.inner.write_atomic(collection, key, &doc).await
    }

    /// Creates are validated and every document is staged to a temp file
    /// before the first rename, so validation, read and write failures leave
    /// the store untouched. Only a failure inside the final rename sequence
    /// can leave a partially applied chunk.
    async fn commit_batch(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        for op in &ops {
            if op.mode == WriteMode::Create {
                let path = self.inner.document_path(&op.collection, &op.key);
                if fs::try_exists(&path).await? {
                    return Err(StoreError::AlreadyExists {
                        collection: op.collection.clone(),
                        key: op.key.clone(),
                    });
                }
            }
        }
        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(ops.len());
        for op in ops {
            match self.inner.stage_op(op).await {
                Ok(pair) => staged.push(pair),
                Err(err) => {
                    for (temp, _) in &staged {
                        let _ = fs::remove_file(temp).await;
                    }
                    return Err(err);
                }
            }
        }
        for (index, (temp, path)) in staged.iter().enumerate() {
            if let Err(err) = fs::rename(temp, path).await {
                for (temp, _) in &staged[index..] {
                    let _ = fs::remove_file(temp).await;
                }
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn streaming(&self) -> Option<Arc<dyn StreamingWriter>> {
        Some(Arc::new(FsStreaming {
            inner: self.inner.clone(),
        }))
    }
}

struct FsStreaming {
    inner: Arc<FsInner>,
}

#[async_trait]
impl StreamingWriter for FsStreaming {
    async fn write_all(&self, ops: Vec<WriteOp>) -> Vec<WriteOutcome> {
        let mut tasks = JoinSet::new();
        for (index, op) in ops.into_iter().enumerate() {
            let inner = self.inner.clone();
            tasks.spawn(async move {
                let key = op.key.clone();
                let outcome = match inner.apply_one(op).await {
                    Ok(()) => WriteOutcome::created(key),
                    Err(err) => WriteOutcome::from_store_error(key, &err),
                };
                (index, outcome)
            });
        }
        let mut indexed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(pair) => indexed.push(pair),
                Err(err) => {
                    // A panicked write task has no key to report against.
                    debug!(error = %err, "streaming write task failed to join");
                }
            }
        }
        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, outcome)| outcome).collect()
    }
}

/// Chunk sizes per document profile; larger documents get smaller chunks.
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub many_small: usize,
    pub few_large: usize,
    pub aggregated: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            many_small: CHUNK_MANY_SMALL,
            few_large: CHUNK_FEW_LARGE,
            aggregated: CHUNK_AGGREGATED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Prepare,
    Write,
    Done,
}

/// Progress snapshot emitted before, during and after a flush. `current` is
/// the cumulative processed count; the status counters track outcomes so far.
#[derive(Debug, Clone, Copy)]
pub struct BatchProgress {
    pub phase: BatchPhase,
    pub current: usize,
    pub total: usize,
    pub created: usize,
    pub duplicate: usize,
    pub error: usize,
}

/// Serializes chunked writes against one store. Never more than one chunk in
/// flight; a pacing pause between chunks keeps the backing store's rate
/// limiter quiet. Prefers the streaming strategy when the store offers one
/// and falls back to atomic batch commits otherwise.
pub struct BatchOrchestrator {
    store: Arc<dyn DocumentStore>,
    pause: Duration,
}

impl BatchOrchestrator {
    pub fn new(store: Arc<dyn DocumentStore>, pause: Duration) -> Self {
        Self { store, pause }
    }

    pub async fn flush<F>(
        &self,
        ops: Vec<WriteOp>,
        chunk_size: usize,
        mut progress: F,
    ) -> Vec<WriteOutcome>
    where
        F: FnMut(BatchProgress),
    {
        let total = ops.len();
        let chunk_size = chunk_size.max(1);
        let mut snapshot = BatchProgress {
            phase: BatchPhase::Prepare,
            current: 0,
            total,
            created: 0,
            duplicate: 0,
            error: 0,
        };
        progress(snapshot);

        let streaming = self.store.streaming();
        let chunks = chunk_ops(ops, chunk_size);
        let chunk_count = chunks.len();
        debug!(total, chunks = chunk_count, streaming = streaming.is_some(), "flushing write batch");

        let mut outcomes: Vec<WriteOutcome> = Vec::with_capacity(total);
        for (index, chunk) in chunks.into_iter().enumerate() {
            let chunk_len = chunk.len();
            let chunk_outcomes = match &streaming {
                Some(writer) => writer.write_all(chunk).await,
                None => {
                    let keys: Vec<String> = chunk.iter().map(|op| op.key.clone()).collect();
                    match self.store.commit_batch(chunk).await {
                        Ok(()) => keys.into_iter().map(WriteOutcome::created).collect(),
                        // the whole chunk shares one fate under the fallback
                        Err(err) => keys
                            .into_iter()
                            .map(|key| WriteOutcome::from_store_error(key, &err))
                            .collect(),
                    }
                }
            };

            for outcome in &chunk_outcomes {
                match outcome.status {
                    WriteStatus::Created => snapshot.created += 1,
                    WriteStatus::Duplicate => snapshot.duplicate += 1,
                    WriteStatus::Error => snapshot.error += 1,
                }
            }
            outcomes.extend(chunk_outcomes);

            snapshot.current += chunk_len;
            snapshot.phase = BatchPhase::Write;
            progress(snapshot);

            if index + 1 < chunk_count && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
        }

        snapshot.phase = BatchPhase::Done;
        progress(snapshot);
        outcomes
    }
}

fn chunk_ops(ops: Vec<WriteOp>, chunk_size: usize) -> Vec<Vec<WriteOp>> {
    let mut chunks = Vec::new();
    let mut current = Vec::with_capacity(chunk_size.min(ops.len()));
    for op in ops {
        current.push(op);
        if current.len() == chunk_size {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
