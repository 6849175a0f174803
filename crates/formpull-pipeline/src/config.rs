//! Sync configuration from the environment plus YAML mapping tables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use formpull_client::ClientConfig;
use formpull_core::{AttachmentMappingTable, FieldMappingTable};
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: String,
    pub asset_uid: String,
    pub api_token: Option<String>,
    pub records_dir: PathBuf,
    pub blobs_dir: PathBuf,
    pub mapping_path: PathBuf,
    pub schema_path: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("FORMPULL_BASE_URL")
                .unwrap_or_else(|_| "https://kobo.example.org".to_string()),
            asset_uid: std::env::var("FORMPULL_ASSET_UID").unwrap_or_default(),
            api_token: std::env::var("FORMPULL_API_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
            records_dir: std::env::var("FORMPULL_RECORDS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/records")),
            blobs_dir: std::env::var("FORMPULL_BLOBS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/blobs")),
            mapping_path: std::env::var("FORMPULL_MAPPING_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./config/mappings.yaml")),
            schema_path: std::env::var("FORMPULL_SCHEMA_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./config/schema.yaml")),
            http_timeout_secs: std::env::var("FORMPULL_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
            user_agent: std::env::var("FORMPULL_USER_AGENT")
                .unwrap_or_else(|_| "formpull/0.1".to_string()),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.base_url.clone(), self.asset_uid.clone());
        config.api_token = self.api_token.clone();
        config.timeout = Duration::from_secs(self.http_timeout_secs);
        config.user_agent = Some(self.user_agent.clone());
        config
    }
}

/// Static mapping tables plus the optional counter field defaulted on record
/// creation. Loaded once per run.
#[derive(Debug, Clone, Default)]
pub struct MappingConfig {
    pub fields: FieldMappingTable,
    pub attachments: AttachmentMappingTable,
    pub counter_field: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MappingFile {
    #[serde(default)]
    fields: BTreeMap<String, String>,
    #[serde(default)]
    attachments: BTreeMap<String, String>,
    #[serde(default)]
    counter_field: Option<String>,
}

impl MappingConfig {
    pub fn parse(text: &str) -> Result<Self> {
        let file: MappingFile = serde_yaml::from_str(text).context("parsing mapping tables")?;
        Ok(Self {
            fields: FieldMappingTable::new(file.fields),
            attachments: AttachmentMappingTable::new(file.attachments),
            counter_field: file.counter_field,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }
}
