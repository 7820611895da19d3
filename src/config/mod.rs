//! # Configuration Tree
//!
//! Every stage of the pipeline is described by one nested `ConfigNode`
//! tree. This module owns the tree type, its pure merge operation, dotted
//! path lookup (strict and scoped) and layered loading from YAML/JSON.
//!
//! ## Unset vs absent
//!
//! A key that is missing from a map is *absent*: a child document that
//! does not mention it inherits the base value. A key explicitly set to
//! `null` holds [`ConfigNode::Unset`]: it overrides the base and means
//! "unset / auto-discover" (e.g. `file_keys: null`, `weight_path: null`).
//!
//! ```text
//! base.yaml            child.yaml             merged
//! io:                  parent: base.yaml      io:
//!   loader:            io:                      loader:
//!     batch_size: 32     loader:                  batch_size: 64
//!     shuffle: true        batch_size: 64         shuffle: true
//!     file_keys: [a]       file_keys: null        file_keys: null (Unset)
//! ```

pub mod schema;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};
pub use schema::{Field, Kind, Schema, Violation};

/// Key used by a document to name the document it overrides.
pub const PARENT_KEY: &str = "parent";

/// One node of the configuration tree.
///
/// Maps are key-ordered so serialization is reproducible; lookups do not
/// depend on insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigNode {
    /// Explicit `null`: "unset / auto-discover". Distinct from an absent key.
    Unset,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<ConfigNode>),
    Map(BTreeMap<String, ConfigNode>),
}

impl Default for ConfigNode {
    fn default() -> Self {
        ConfigNode::Map(BTreeMap::new())
    }
}

// ============================================================================
// Merge
// ============================================================================

/// Merge `over` on top of `base`.
///
/// Mapping nodes merge recursively; any other override value (scalar,
/// sequence or `Unset`) replaces the base value wholesale. Keys absent
/// from `over` keep their base value. Pure: neither input is modified.
pub fn merge(base: &ConfigNode, over: &ConfigNode) -> ConfigNode {
    match (base, over) {
        (ConfigNode::Map(b), ConfigNode::Map(o)) => {
            let mut out = b.clone();
            for (key, value) in o {
                let merged = match b.get(key) {
                    Some(existing) => merge(existing, value),
                    None => value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            ConfigNode::Map(out)
        }
        (_, other) => other.clone(),
    }
}

/// Merge a stack of layers, left to right (later layers win).
pub fn merge_all<'a>(layers: impl IntoIterator<Item = &'a ConfigNode>) -> ConfigNode {
    layers
        .into_iter()
        .fold(ConfigNode::default(), |acc, layer| merge(&acc, layer))
}

// ============================================================================
// Lookup
// ============================================================================

fn split_path(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

impl ConfigNode {
    /// Empty mapping node.
    pub fn map() -> Self {
        ConfigNode::Map(BTreeMap::new())
    }

    /// Child of a mapping (by key) or a list (by decimal index).
    pub fn child(&self, segment: &str) -> Option<&ConfigNode> {
        match self {
            ConfigNode::Map(m) => m.get(segment),
            ConfigNode::List(l) => segment.parse::<usize>().ok().and_then(|i| l.get(i)),
            _ => None,
        }
    }

    /// Strict dotted-path lookup. `None` if any segment is absent.
    pub fn get(&self, path: &str) -> Option<&ConfigNode> {
        split_path(path)
            .into_iter()
            .try_fold(self, |node, seg| node.child(seg))
    }

    /// Scoped lookup: the last key of `path` is searched at its own parent
    /// first, then at every ancestor up to the root.
    ///
    /// `resolve("io.loader.sampler.seed")` returns the first of
    /// `io.loader.sampler.seed`, `io.loader.seed`, `io.seed`, `seed`.
    pub fn resolve(&self, path: &str) -> Result<&ConfigNode> {
        let segments = split_path(path);
        let Some((key, parents)) = segments.split_last() else {
            return Ok(self);
        };
        for depth in (0..=parents.len()).rev() {
            let scope = parents[..depth]
                .iter()
                .try_fold(self, |node, seg| node.child(seg));
            if let Some(found) = scope.and_then(|s| s.child(key)) {
                return Ok(found);
            }
        }
        Err(Error::MissingKey { path: path.to_string() })
    }

    /// Insert `value` at `path`, creating intermediate maps.
    /// Non-map intermediates are replaced by maps.
    pub fn set(&mut self, path: &str, value: ConfigNode) {
        let segments = split_path(path);
        let Some((last, parents)) = segments.split_last() else {
            *self = value;
            return;
        };
        let mut node = self;
        for seg in parents {
            node = node
                .ensure_map()
                .entry((*seg).to_string())
                .or_insert_with(ConfigNode::map);
        }
        node.ensure_map().insert((*last).to_string(), value);
    }

    fn ensure_map(&mut self) -> &mut BTreeMap<String, ConfigNode> {
        if !self.is_map() {
            *self = ConfigNode::map();
        }
        match self {
            ConfigNode::Map(m) => m,
            _ => unreachable!("replaced with a map above"),
        }
    }

    /// Remove and return the value under a top-level key.
    pub fn take(&mut self, key: &str) -> Option<ConfigNode> {
        match self {
            ConfigNode::Map(m) => m.remove(key),
            _ => None,
        }
    }

    /// Validate against a schema, reporting every offending path at once.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        let violations = schema.check(self, "");
        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::Schema { violations })
        }
    }
}

// ============================================================================
// Typed access
// ============================================================================

impl ConfigNode {
    pub fn type_name(&self) -> &'static str {
        match self {
            ConfigNode::Unset => "null",
            ConfigNode::Bool(_) => "bool",
            ConfigNode::Int(_) => "int",
            ConfigNode::Float(_) => "float",
            ConfigNode::String(_) => "string",
            ConfigNode::List(_) => "list",
            ConfigNode::Map(_) => "map",
        }
    }

    pub fn is_unset(&self) -> bool { matches!(self, ConfigNode::Unset) }
    pub fn is_map(&self) -> bool { matches!(self, ConfigNode::Map(_)) }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigNode::Int(i) => Some(*i),
            ConfigNode::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ConfigNode::Float(f) => Some(*f),
            ConfigNode::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigNode::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigNode::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ConfigNode]> {
        match self {
            ConfigNode::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ConfigNode>> {
        match self {
            ConfigNode::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Direct child that is present and not `Unset`.
    pub fn field(&self, key: &str) -> Option<&ConfigNode> {
        self.child(key).filter(|v| !v.is_unset())
    }

    pub fn int_or(&self, key: &str, default: i64) -> i64 {
        self.field(key).and_then(ConfigNode::as_int).unwrap_or(default)
    }

    pub fn float_or(&self, key: &str, default: f64) -> f64 {
        self.field(key).and_then(ConfigNode::as_float).unwrap_or(default)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.field(key).and_then(ConfigNode::as_bool).unwrap_or(default)
    }

    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.field(key).and_then(ConfigNode::as_str).unwrap_or(default)
    }

    /// Required integer field; `Config` error naming the key otherwise.
    pub fn require_int(&self, key: &str) -> Result<i64> {
        self.field(key)
            .and_then(ConfigNode::as_int)
            .ok_or_else(|| Error::Config(format!("`{key}` must be an integer")))
    }

    /// Required string field.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.field(key)
            .and_then(ConfigNode::as_str)
            .ok_or_else(|| Error::Config(format!("`{key}` must be a string")))
    }

    /// List of strings, accepting a bare string as a one-element list.
    pub fn str_list(&self, key: &str) -> Vec<String> {
        match self.field(key) {
            Some(ConfigNode::String(s)) => vec![s.clone()],
            Some(ConfigNode::List(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl ConfigNode {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let node: ConfigNode = serde_yaml::from_str(text)?;
        Ok(node)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let node: ConfigNode = serde_json::from_str(text)?;
        Ok(node)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Load one document (no parent resolution). `.json` files are read as
    /// JSON, everything else as YAML.
    pub fn load_document(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_yaml_str(&text),
        }
    }

    /// Load a document and every ancestor it names through `parent:`,
    /// merging child over parent. Relative parent paths are resolved
    /// against the child's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut chain: Vec<ConfigNode> = Vec::new();
        let mut seen: Vec<PathBuf> = Vec::new();
        let mut next = Some(path.as_ref().to_path_buf());

        while let Some(current) = next.take() {
            let canonical = current.canonicalize().unwrap_or_else(|_| current.clone());
            if seen.contains(&canonical) {
                return Err(Error::Config(format!(
                    "config inheritance cycle through {}",
                    current.display()
                )));
            }
            seen.push(canonical);

            let mut doc = Self::load_document(&current)?;
            if let Some(parent) = doc.take(PARENT_KEY) {
                match parent {
                    ConfigNode::String(p) => {
                        let dir = current.parent().unwrap_or_else(|| Path::new("."));
                        next = Some(dir.join(p));
                    }
                    ConfigNode::Unset => {}
                    other => {
                        return Err(Error::Config(format!(
                            "`{PARENT_KEY}` must be a path, got {}",
                            other.type_name()
                        )));
                    }
                }
            }
            tracing::debug!(path = %current.display(), "loaded config layer");
            chain.push(doc);
        }

        Ok(merge_all(chain.iter().rev()))
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<bool> for ConfigNode { fn from(v: bool) -> Self { ConfigNode::Bool(v) } }
impl From<i32> for ConfigNode { fn from(v: i32) -> Self { ConfigNode::Int(v as i64) } }
impl From<i64> for ConfigNode { fn from(v: i64) -> Self { ConfigNode::Int(v) } }
impl From<f64> for ConfigNode { fn from(v: f64) -> Self { ConfigNode::Float(v) } }
impl From<String> for ConfigNode { fn from(v: String) -> Self { ConfigNode::String(v) } }
impl From<&str> for ConfigNode { fn from(v: &str) -> Self { ConfigNode::String(v.to_owned()) } }
impl<T: Into<ConfigNode>> From<Vec<T>> for ConfigNode {
    fn from(v: Vec<T>) -> Self { ConfigNode::List(v.into_iter().map(Into::into).collect()) }
}
impl<T: Into<ConfigNode>> From<Option<T>> for ConfigNode {
    fn from(v: Option<T>) -> Self { v.map(Into::into).unwrap_or(ConfigNode::Unset) }
}

impl fmt::Display for ConfigNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigNode::Unset => write!(f, "null"),
            ConfigNode::Bool(b) => write!(f, "{b}"),
            ConfigNode::Int(i) => write!(f, "{i}"),
            ConfigNode::Float(v) => write!(f, "{v}"),
            ConfigNode::String(s) => write!(f, "{s:?}"),
            ConfigNode::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            ConfigNode::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn yaml(s: &str) -> ConfigNode {
        ConfigNode::from_yaml_str(s).unwrap()
    }

    #[test]
    fn test_merge_recurses_into_maps() {
        let base = yaml("io: {loader: {batch_size: 32, shuffle: true}}");
        let over = yaml("io: {loader: {batch_size: 64}}");
        let merged = merge(&base, &over);
        assert_eq!(merged.get("io.loader.batch_size"), Some(&ConfigNode::Int(64)));
        assert_eq!(merged.get("io.loader.shuffle"), Some(&ConfigNode::Bool(true)));
    }

    #[test]
    fn test_merge_replaces_sequences_wholesale() {
        let base = yaml("max_length: [500, 0, 500]");
        let over = yaml("max_length: [25]");
        assert_eq!(merge(&base, &over), yaml("max_length: [25]"));
    }

    #[test]
    fn test_null_override_clears_to_unset() {
        let base = yaml("dataset: {file_keys: [a.jsonl, b.jsonl]}");
        let over = yaml("dataset: {file_keys: null}");
        let merged = merge(&base, &over);
        assert_eq!(merged.get("dataset.file_keys"), Some(&ConfigNode::Unset));
    }

    #[test]
    fn test_absent_key_inherits() {
        let base = yaml("model: {weight_path: /w.ckpt}");
        let merged = merge(&base, &yaml("model: {}"));
        assert_eq!(merged.get("model.weight_path").and_then(|v| v.as_str()), Some("/w.ckpt"));
    }

    #[test]
    fn test_resolve_walks_up_ancestors() {
        let tree = yaml("seed: 7\nio: {loader: {sampler: {name: sequential}}}");
        assert_eq!(tree.resolve("io.loader.sampler.seed").unwrap(), &ConfigNode::Int(7));
        assert_eq!(
            tree.resolve("io.loader.sampler.name").unwrap().as_str(),
            Some("sequential")
        );
    }

    #[test]
    fn test_resolve_missing_everywhere() {
        let tree = yaml("io: {loader: {}}");
        let err = tree.resolve("io.loader.batch_size").unwrap_err();
        assert!(matches!(err, Error::MissingKey { ref path } if path == "io.loader.batch_size"));
    }

    #[test]
    fn test_get_indexes_lists() {
        let tree = yaml("model: {network_input: [input_data, clust_label]}");
        assert_eq!(
            tree.get("model.network_input.1").and_then(|v| v.as_str()),
            Some("clust_label")
        );
    }

    #[test]
    fn test_set_creates_intermediates() {
        let mut tree = ConfigNode::map();
        tree.set("io.loader.batch_size", ConfigNode::from(8));
        assert_eq!(tree.get("io.loader.batch_size"), Some(&ConfigNode::Int(8)));
    }

    #[test]
    fn test_json_and_yaml_agree() {
        let a = ConfigNode::from_json_str(r#"{"a": {"b": [1, 2.5, null, "x"]}}"#).unwrap();
        let b = yaml("a: {b: [1, 2.5, null, x]}");
        assert_eq!(a, b);
    }

    #[test]
    fn test_load_follows_parent_chain() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("base.yaml"),
            "io: {loader: {batch_size: 32, num_workers: 4}}\nmodel: {weight_path: w.ckpt}\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("child.yaml"),
            "parent: base.yaml\nio: {loader: {batch_size: 8}}\nmodel: {weight_path: null}\n",
        )
        .unwrap();

        let tree = ConfigNode::load(dir.path().join("child.yaml")).unwrap();
        assert_eq!(tree.get("io.loader.batch_size"), Some(&ConfigNode::Int(8)));
        assert_eq!(tree.get("io.loader.num_workers"), Some(&ConfigNode::Int(4)));
        assert_eq!(tree.get("model.weight_path"), Some(&ConfigNode::Unset));
        assert!(tree.get(PARENT_KEY).is_none());
    }

    #[test]
    fn test_load_rejects_cycles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), "parent: b.yaml\n").unwrap();
        std::fs::write(dir.path().join("b.yaml"), "parent: a.yaml\n").unwrap();
        assert!(matches!(
            ConfigNode::load(dir.path().join("a.yaml")),
            Err(Error::Config(_))
        ));
    }

    fn arb_leaf() -> impl Strategy<Value = ConfigNode> {
        prop_oneof![
            Just(ConfigNode::Unset),
            any::<bool>().prop_map(ConfigNode::Bool),
            any::<i64>().prop_map(ConfigNode::Int),
            (-1e6f64..1e6).prop_map(ConfigNode::Float),
            "[a-z]{0,6}".prop_map(ConfigNode::String),
        ]
    }

    fn arb_node() -> impl Strategy<Value = ConfigNode> {
        arb_leaf().prop_recursive(3, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(ConfigNode::List),
                prop::collection::btree_map("[a-d]", inner, 0..4).prop_map(ConfigNode::Map),
            ]
        })
    }

    fn arb_sections() -> impl Strategy<Value = ConfigNode> {
        prop::collection::btree_map(
            "[a-d]",
            prop::collection::btree_map("[a-d]", arb_leaf(), 0..4).prop_map(ConfigNode::Map),
            0..4,
        )
        .prop_map(ConfigNode::Map)
    }

    proptest! {
        #[test]
        fn prop_merge_override_idempotent(a in arb_node(), b in arb_node()) {
            let once = merge(&a, &b);
            let twice = merge(&once, &b);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_merge_empty_is_identity(a in arb_node()) {
            prop_assume!(a.is_map());
            prop_assert_eq!(merge(&a, &ConfigNode::map()), a);
        }

        // Layers whose paths keep the same kind (map vs leaf) across documents.
        #[test]
        fn prop_merge_associative(
            a in arb_sections(),
            b in arb_sections(),
            c in arb_sections(),
        ) {
            prop_assert_eq!(merge(&merge(&a, &b), &c), merge(&a, &merge(&b, &c)));
        }
    }
}
