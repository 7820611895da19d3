//! Per-event output: one JSON line per processed event.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigNode, Kind, Schema};
use crate::gnn::GraphOutput;
use crate::loss::LossOutput;
use crate::model::{RunInfo, Sample};
use crate::{Error, Result};

/// What to do when the output file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collision {
    Append,
    Overwrite,
    Fail,
}

impl Collision {
    /// `append` wins over `overwrite`; neither means an existing file is an
    /// error.
    pub fn from_flags(overwrite: bool, append: bool) -> Self {
        match (append, overwrite) {
            (true, _) => Collision::Append,
            (false, true) => Collision::Overwrite,
            (false, false) => Collision::Fail,
        }
    }
}

pub fn schema() -> Schema {
    Schema::closed()
        .required("file_name", Kind::Str)
        .optional("overwrite", Kind::Bool)
        .optional("append", Kind::Bool)
        .nullable("name", Kind::Str)
}

/// Everything written for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub index: usize,
    pub run_info: Option<RunInfo>,
    pub node_ids: Vec<i64>,
    pub edges: Vec<(usize, usize)>,
    pub node_pred: Vec<u16>,
    pub edge_on: Vec<bool>,
    pub group_pred: Vec<usize>,
    pub loss: Option<LossOutput>,
}

impl EventRecord {
    pub fn new(out: &GraphOutput, sample: &Sample, loss: Option<&LossOutput>) -> Self {
        Self {
            index: out.index,
            run_info: sample.provenance.run_info,
            node_ids: out.node_ids.clone(),
            edges: out.graph.edges().to_vec(),
            node_pred: out.node_classes().into_iter().map(|c| c.0).collect(),
            edge_on: out.edge_on(),
            group_pred: out.group_pred.clone(),
            loss: loss.copied(),
        }
    }
}

/// Line-oriented JSON writer, shareable across threads.
pub struct Writer {
    path: PathBuf,
    out: Mutex<BufWriter<File>>,
}

impl Writer {
    pub fn open(path: impl AsRef<Path>, collision: Collision) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let exists = path.exists();
        let mut options = OpenOptions::new();
        match (exists, collision) {
            (true, Collision::Fail) => {
                return Err(Error::Config(format!(
                    "{} exists; set `overwrite` or `append`",
                    path.display()
                )));
            }
            (true, Collision::Append) => options.append(true),
            _ => options.write(true).create(true).truncate(true),
        };
        let file = options.open(&path)?;
        tracing::info!(path = %path.display(), ?collision, existed = exists, "opened event writer");
        Ok(Self { path, out: Mutex::new(BufWriter::new(file)) })
    }

    /// Open from an `io.writer` block.
    pub fn from_config(config: &ConfigNode) -> Result<Self> {
        config.validate(&schema())?;
        let collision = Collision::from_flags(config.bool_or("overwrite", false), config.bool_or("append", false));
        Self::open(config.require_str("file_name")?, collision)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write<T: Serialize>(&self, record: &T) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut out = self.out.lock();
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.out.lock().flush()?;
        Ok(())
    }
}
