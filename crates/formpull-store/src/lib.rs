//! Record and blob persistence for formpull: trait seams plus file-backed
//! implementations with atomic temp-file-and-rename writes.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use async_trait::async_trait;
use formpull_core::{FieldDef, TargetRecord, TargetSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const CRATE_NAME: &str = "formpull-store";

/// Durable store of target records keyed by external UID. Commits are
/// all-or-nothing per record; readers never observe a half-written record.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load(&self, uid: &str) -> anyhow::Result<Option<TargetRecord>>;

    /// Atomically replaces (or creates) the record.
    async fn commit(&self, record: &TargetRecord) -> anyhow::Result<()>;

    /// Writes one field on an existing record without touching its
    /// modification timestamp. Used for attachment-locator backfill, which
    /// must not look like a content edit.
    async fn set_field_untracked(
        &self,
        uid: &str,
        field: &str,
        value: JsonValue,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub locator: String,
    pub content_hash: String,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Stores attachment bytes under the owning record's identity and returns a
/// locator string to persist back onto the record.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn store_blob(
        &self,
        owner_uid: &str,
        filename: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredBlob>;
}

fn sanitize_component(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "record".to_string()
    } else {
        cleaned
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("no parent directory for {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err)
                .with_context(|| format!("renaming {} -> {}", temp_path.display(), path.display()))
        }
    }
}

/// One JSON document per record, replaced atomically on every commit.
#[derive(Debug, Clone)]
pub struct FileRecordStore {
    root: PathBuf,
}

impl FileRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, uid: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize_component(uid)))
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn load(&self, uid: &str) -> anyhow::Result<Option<TargetRecord>> {
        let path = self.record_path(uid);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading record {}", path.display()))
            }
        };
        let record: TargetRecord = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing record {}", path.display()))?;
        Ok(Some(record))
    }

    async fn commit(&self, record: &TargetRecord) -> anyhow::Result<()> {
        let path = self.record_path(&record.uid);
        let bytes = serde_json::to_vec_pretty(record)
            .with_context(|| format!("serializing record {}", record.uid))?;
        write_atomic(&path, &bytes).await
    }

    async fn set_field_untracked(
        &self,
        uid: &str,
        field: &str,
        value: JsonValue,
    ) -> anyhow::Result<()> {
        let Some(mut record) = self.load(uid).await? else {
            bail!("no record with uid {uid}");
        };
        record.set(field, value);
        self.commit(&record).await
    }
}

/// In-memory record store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<String, TargetRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load(&self, uid: &str) -> anyhow::Result<Option<TargetRecord>> {
        Ok(self.records.lock().await.get(uid).cloned())
    }

    async fn commit(&self, record: &TargetRecord) -> anyhow::Result<()> {
        self.records
            .lock()
            .await
            .insert(record.uid.clone(), record.clone());
        Ok(())
    }

    async fn set_field_untracked(
        &self,
        uid: &str,
        field: &str,
        value: JsonValue,
    ) -> anyhow::Result<()> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(uid) else {
            bail!("no record with uid {uid}");
        };
        record.set(field, value);
        Ok(())
    }
}

/// Hash-addressed blob store rooted on the local filesystem. Blobs are
/// immutable; re-storing identical bytes for the same owner is a no-op.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn blob_relative_path(owner_uid: &str, filename: &str, content_hash: &str) -> PathBuf {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty())
            .unwrap_or("bin");
        PathBuf::from(sanitize_component(owner_uid)).join(format!(
            "{}.{}",
            content_hash,
            sanitize_component(ext)
        ))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn store_blob(
        &self,
        owner_uid: &str,
        filename: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredBlob> {
        let content_hash = Self::sha256_hex(bytes);
        let relative = Self::blob_relative_path(owner_uid, filename, &content_hash);
        let absolute = self.root.join(&relative);
        let locator = relative.display().to_string();

        if fs::try_exists(&absolute)
            .await
            .with_context(|| format!("checking blob path {}", absolute.display()))?
        {
            return Ok(StoredBlob {
                locator,
                content_hash,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        write_atomic(&absolute, bytes).await?;
        Ok(StoredBlob {
            locator,
            content_hash,
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }
}

/// In-memory blob store for tests.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.lock().await.len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn store_blob(
        &self,
        owner_uid: &str,
        filename: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredBlob> {
        let content_hash = FileBlobStore::sha256_hex(bytes);
        let locator = format!("{owner_uid}/{content_hash}/{filename}");
        let deduplicated = self
            .blobs
            .lock()
            .await
            .insert(locator.clone(), bytes.to_vec())
            .is_some();
        Ok(StoredBlob {
            locator,
            content_hash,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// Target-schema introspection backed by a plain field-name -> definition map,
/// loadable from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaMap {
    fields: BTreeMap<String, FieldDef>,
}

impl SchemaMap {
    pub fn from_fields(fields: impl IntoIterator<Item = (impl Into<String>, FieldDef)>) -> Self {
        Self {
            fields: fields
                .into_iter()
                .map(|(name, def)| (name.into(), def))
                .collect(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl TargetSchema for SchemaMap {
    fn field(&self, name: &str) -> Option<FieldDef> {
        self.fields.get(name).cloned()
    }
}
