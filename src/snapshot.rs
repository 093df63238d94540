//! Import payloads.
//!
//! Two shapes are accepted:
//! - [`TableSnapshot`]: a table-keyed dump (`{version, data: {entity: [rows]}, schemaHash}`),
//!   imported through the generic table-driven path.
//! - [`LegacySnapshot`]: the older client export with typed session groups,
//!   sessions, topics and messages, imported through the fine-grained path.
//!
//! Files may be plain JSON or gzip-compressed JSON.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Highest snapshot version this importer understands.
pub const SUPPORTED_VERSION: u32 = 7;

/// Table-keyed snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSnapshot {
    pub version: u32,

    /// Rows keyed by entity type (dataset key, e.g. `sessionGroups`).
    #[serde(default)]
    pub data: BTreeMap<String, Vec<Value>>,

    /// Upstream schema fingerprint. Compatibility is checked before import.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_hash: Option<String>,
}

impl TableSnapshot {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            data: BTreeMap::new(),
            schema_hash: None,
        }
    }

    /// Builder-style helper for adding an entity's rows.
    pub fn with_rows(mut self, entity: &str, rows: Vec<Value>) -> Self {
        self.data.insert(entity.to_string(), rows);
        self
    }

    pub fn rows(&self, entity: &str) -> &[Value] {
        self.data.get(entity).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Older client export.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacySnapshot {
    pub version: u32,
    #[serde(default)]
    pub session_groups: Vec<LegacySessionGroup>,
    #[serde(default)]
    pub sessions: Vec<LegacySession>,
    #[serde(default)]
    pub topics: Vec<LegacyTopic>,
    #[serde(default)]
    pub messages: Vec<LegacyMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacySessionGroup {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sort: Option<i64>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacySession {
    pub id: String,
    /// Local id of the owning session group.
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub pinned: Option<bool>,
    /// Display metadata (title, description, avatar, ...).
    #[serde(default)]
    pub meta: Map<String, Value>,
    /// Agent configuration (model, provider, systemRole, ...).
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyTopic {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Exported as either a boolean or 0/1.
    #[serde(default)]
    pub favorite: Option<Value>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyMessage {
    pub id: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub topic_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub favorite: Option<bool>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub plugin: Option<LegacyPlugin>,
    #[serde(default)]
    pub plugin_state: Option<Value>,
    #[serde(default, rename = "tool_call_id")]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub extra: Option<LegacyMessageExtra>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyPlugin {
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub api_name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyMessageExtra {
    #[serde(default)]
    pub from_model: Option<String>,
    #[serde(default)]
    pub from_provider: Option<String>,
    #[serde(default)]
    pub translate: Option<Map<String, Value>>,
}

/// Either payload shape.
#[derive(Debug, Clone)]
pub enum Payload {
    Tables(TableSnapshot),
    Legacy(LegacySnapshot),
}

/// Requested payload format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFormat {
    /// Detect from the document: a top-level `data` object means [`TableSnapshot`].
    #[default]
    Auto,
    Tables,
    Legacy,
}

impl Payload {
    pub fn version(&self) -> u32 {
        match self {
            Payload::Tables(s) => s.version,
            Payload::Legacy(s) => s.version,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Tables(_) => "tables",
            Payload::Legacy(_) => "legacy",
        }
    }

    /// Parse a payload from a JSON value.
    pub fn from_value(value: Value, format: PayloadFormat) -> Result<Self> {
        let format = match format {
            PayloadFormat::Auto => {
                if value.get("data").is_some_and(Value::is_object) {
                    PayloadFormat::Tables
                } else {
                    PayloadFormat::Legacy
                }
            }
            other => other,
        };
        match format {
            PayloadFormat::Tables => Ok(Payload::Tables(
                serde_json::from_value(value).context("invalid table snapshot")?,
            )),
            PayloadFormat::Legacy => Ok(Payload::Legacy(
                serde_json::from_value(value).context("invalid legacy snapshot")?,
            )),
            PayloadFormat::Auto => Err(anyhow!("payload format could not be determined")),
        }
    }

    /// Parse a payload from JSON text.
    pub fn from_json(json: &str, format: PayloadFormat) -> Result<Self> {
        let value: Value = serde_json::from_str(json).context("snapshot is not valid JSON")?;
        Self::from_value(value, format)
    }

    /// Load a payload from a file (supports both plain JSON and gzip).
    pub fn from_file(path: &Path, format: PayloadFormat) -> Result<Self> {
        use std::fs::File;
        use std::io::{BufReader, Read};

        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut reader = BufReader::new(file);

        // Check for gzip magic bytes
        let mut magic = [0u8; 2];
        let peeked = reader.read(&mut magic)?;

        let file = File::open(path)?;
        let reader = BufReader::new(file);

        let value: Value = if peeked == 2 && magic == [0x1f, 0x8b] {
            let decoder = flate2::read::GzDecoder::new(reader);
            serde_json::from_reader(decoder)
                .with_context(|| format!("{} is not valid gzip JSON", path.display()))?
        } else {
            serde_json::from_reader(reader)
                .with_context(|| format!("{} is not valid JSON", path.display()))?
        };

        Self::from_value(value, format)
    }
}
