//! # Event I/O
//!
//! Everything between event files and a batch of parsed samples, plus the
//! per-event output writer.
//!
//! ```text
//! DataSource ──read(i)──▶ RawEvent ──Parser per label──▶ Sample
//!      ▲                                                   │
//!  Sampler (index batches)          Loader (worker pool) ──┴──▶ Collate ──▶ Batch
//! ```
//!
//! A raw event is one JSON object keyed by product name
//! (`cluster3d_pcluster`, `particle_corrected`, ...). Parsers pick the
//! products they are configured with out of it.

pub mod collate;
pub mod dataset;
pub mod loader;
pub mod parse;
pub mod sampler;
pub mod writer;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::config::{ConfigNode, Kind, Schema};
use crate::registry::{BuildContext, Registry};
use crate::{Error, Result};

pub use collate::{Batch, Collate};
pub use dataset::DatasetPipeline;
pub use loader::{Loader, LoaderStats};
pub use parse::{ParseError, Parser};
pub use sampler::Sampler;
pub use writer::{EventRecord, Writer};

/// One undecoded event: product name → JSON payload.
pub type RawEvent = serde_json::Map<String, serde_json::Value>;

/// An event together with where it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub index: usize,
    pub file: Option<PathBuf>,
    pub event: RawEvent,
}

// ============================================================================
// DataSource trait
// ============================================================================

/// Indexed, read-only access to raw events.
///
/// Implementations are shared by every loader worker, so reads take `&self`.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Number of events. `0` when nothing was found; drawing from an empty
    /// source is reported by the loader, not here.
    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Read event `index`. A record that is not a JSON object fails with
    /// `SampleParse`.
    async fn read(&self, index: usize) -> Result<RawRecord>;
}

fn out_of_range(index: usize, len: usize) -> Error {
    Error::NoData(format!("event {index} requested from a source of {len}"))
}

fn as_event(index: usize, value: serde_json::Value) -> Result<RawEvent> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(Error::SampleParse {
            index,
            message: format!("event is not a JSON object (got {})", json_type(&other)),
        }),
    }
}

pub(crate) fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ============================================================================
// MemorySource
// ============================================================================

/// Events held inline, usually from `events: [...]` in the config.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    events: Vec<serde_json::Value>,
}

impl MemorySource {
    pub fn new(events: Vec<serde_json::Value>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl DataSource for MemorySource {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.events.len())
    }

    async fn read(&self, index: usize) -> Result<RawRecord> {
        let value = self
            .events
            .get(index)
            .cloned()
            .ok_or_else(|| out_of_range(index, self.events.len()))?;
        Ok(RawRecord { index, file: None, event: as_event(index, value)? })
    }
}

// ============================================================================
// JsonlSource
// ============================================================================

/// Where a JSONL source finds its files.
#[derive(Debug, Clone, PartialEq)]
pub enum FileKeys {
    Listed(Vec<PathBuf>),
    /// `file_keys: null`: every `*.jsonl` under the root, sorted by path.
    Discover { root: PathBuf },
}

/// One non-blank line. A line that is not UTF-8 keeps its decode error so
/// that reading it fails as a single malformed event.
#[derive(Debug)]
struct Line {
    file: usize,
    text: std::result::Result<String, String>,
}

#[derive(Debug, Default)]
struct JsonlIndex {
    files: Vec<PathBuf>,
    lines: Vec<Line>,
}

/// One JSON event per non-blank line, across one or more files.
///
/// Files are located and read on first access, so a pipeline with nothing
/// to discover still builds.
#[derive(Debug)]
pub struct JsonlSource {
    keys: FileKeys,
    limit_num_files: Option<usize>,
    index: OnceCell<JsonlIndex>,
}

impl JsonlSource {
    pub fn new(keys: FileKeys, limit_num_files: Option<usize>) -> Self {
        Self { keys, limit_num_files, index: OnceCell::new() }
    }

    /// Files the source reads, in order. Triggers discovery.
    pub async fn files(&self) -> Result<&[PathBuf]> {
        Ok(&self.index().await?.files)
    }

    async fn index(&self) -> Result<&JsonlIndex> {
        self.index.get_or_try_init(|| self.load()).await
    }

    async fn load(&self) -> Result<JsonlIndex> {
        let mut files = match &self.keys {
            FileKeys::Listed(paths) => paths.clone(),
            FileKeys::Discover { root } => discover(root).await?,
        };
        if let Some(limit) = self.limit_num_files {
            files.truncate(limit);
        }

        let mut lines = Vec::new();
        for (file, path) in files.iter().enumerate() {
            let bytes = tokio::fs::read(path).await?;
            for (n, raw) in bytes.split(|&b| b == b'\n').enumerate() {
                let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
                let text = match std::str::from_utf8(raw) {
                    Ok(l) if l.trim().is_empty() => continue,
                    Ok(l) => Ok(l.to_string()),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), line = n + 1, "line is not valid UTF-8");
                        Err(format!("{}:{}: {e}", path.display(), n + 1))
                    }
                };
                lines.push(Line { file, text });
            }
        }
        tracing::info!(files = files.len(), events = lines.len(), "indexed jsonl events");
        Ok(JsonlIndex { files, lines })
    }
}

/// Every `*.jsonl` file directly under `root`, sorted. A missing root
/// yields nothing.
async fn discover(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dir = match tokio::fs::read_dir(root).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(root = %root.display(), "data root does not exist");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };
    let mut found = Vec::new();
    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "jsonl") && entry.file_type().await?.is_file() {
            found.push(path);
        } else {
            tracing::debug!(path = %path.display(), "skipping non-jsonl entry");
        }
    }
    found.sort();
    Ok(found)
}

#[async_trait]
impl DataSource for JsonlSource {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.index().await?.lines.len())
    }

    async fn read(&self, index: usize) -> Result<RawRecord> {
        let idx = self.index().await?;
        let line = idx.lines.get(index).ok_or_else(|| out_of_range(index, idx.lines.len()))?;
        let text = line.text.as_deref().map_err(|e| Error::SampleParse {
            index,
            message: format!("invalid UTF-8: {e}"),
        })?;
        let value: serde_json::Value = serde_json::from_str(text).map_err(|e| Error::SampleParse {
            index,
            message: format!("invalid JSON: {e}"),
        })?;
        Ok(RawRecord {
            index,
            file: idx.files.get(line.file).cloned(),
            event: as_event(index, value)?,
        })
    }
}

// ============================================================================
// Registration
// ============================================================================

fn build_memory(params: &ConfigNode, _ctx: &BuildContext) -> Result<Box<dyn DataSource>> {
    let events = params
        .field("events")
        .and_then(ConfigNode::as_list)
        .unwrap_or_default()
        .iter()
        .map(serde_json::to_value)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Box::new(MemorySource::new(events)))
}

fn build_jsonl(params: &ConfigNode, _ctx: &BuildContext) -> Result<Box<dyn DataSource>> {
    let keys = match params.field("file_keys") {
        Some(_) => {
            let root = params.field("data_root").and_then(ConfigNode::as_str).map(PathBuf::from);
            let paths = params
                .str_list("file_keys")
                .into_iter()
                .map(|p| match &root {
                    Some(root) => root.join(p),
                    None => PathBuf::from(p),
                })
                .collect();
            FileKeys::Listed(paths)
        }
        None => FileKeys::Discover { root: PathBuf::from(params.str_or("data_root", ".")) },
    };
    let limit = params
        .field("limit_num_files")
        .and_then(ConfigNode::as_int)
        .filter(|&n| n > 0)
        .map(|n| n as usize);
    Ok(Box::new(JsonlSource::new(keys, limit)))
}

pub fn register_datasets(reg: &mut Registry<dyn DataSource>) {
    reg.register("memory", Schema::closed().optional("events", Kind::list_of(Kind::Any)), build_memory)
        .register(
            "jsonl",
            Schema::closed()
                .nullable("file_keys", Kind::Either(vec![Kind::Str, Kind::list_of(Kind::Str)]))
                .optional("data_root", Kind::Str)
                .optional("limit_num_files", Kind::int_min(0)),
            build_jsonl,
        );
}
