//! Declarative schemas for configuration subtrees.
//!
//! A `Schema` describes the keys a mapping node may carry. Checking never
//! stops at the first problem: every offending path is collected so a
//! misconfigured file can be fixed in one pass.

use std::fmt;

use super::ConfigNode;

/// One schema problem at one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "<root>" } else { &self.path };
        write!(f, "{path}: {}", self.message)
    }
}

/// Render a violation list as `a: msg; b: msg`.
pub fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Expected shape of a value.
#[derive(Debug, Clone)]
pub enum Kind {
    Any,
    Bool,
    Int { min: Option<i64>, max: Option<i64> },
    /// Integers are accepted wherever a float is.
    Float { min: Option<f64>, max: Option<f64> },
    Str,
    OneOf(&'static [&'static str]),
    List(Box<Kind>),
    Map(Schema),
    /// Accept the value if any alternative accepts it.
    Either(Vec<Kind>),
}

impl Kind {
    pub fn int() -> Self { Kind::Int { min: None, max: None } }
    pub fn int_min(min: i64) -> Self { Kind::Int { min: Some(min), max: None } }
    pub fn int_range(min: i64, max: i64) -> Self { Kind::Int { min: Some(min), max: Some(max) } }
    pub fn float() -> Self { Kind::Float { min: None, max: None } }
    pub fn float_min(min: f64) -> Self { Kind::Float { min: Some(min), max: None } }
    pub fn list_of(inner: Kind) -> Self { Kind::List(Box::new(inner)) }

    fn describe(&self) -> String {
        match self {
            Kind::Any => "any value".into(),
            Kind::Bool => "bool".into(),
            Kind::Int { .. } => "int".into(),
            Kind::Float { .. } => "number".into(),
            Kind::Str => "string".into(),
            Kind::OneOf(choices) => format!("one of {choices:?}"),
            Kind::List(inner) => format!("list of {}", inner.describe()),
            Kind::Map(_) => "map".into(),
            Kind::Either(alts) => alts
                .iter()
                .map(Kind::describe)
                .collect::<Vec<_>>()
                .join(" or "),
        }
    }

    fn check(&self, value: &ConfigNode, path: &str, out: &mut Vec<Violation>) {
        let mut fail = |message: String| out.push(Violation { path: path.to_string(), message });
        match self {
            Kind::Any => {}
            Kind::Bool => {
                if value.as_bool().is_none() {
                    fail(format!("expected bool, got {}", value.type_name()));
                }
            }
            // Integral floats (`4.0`) count, as in `ConfigNode::as_int`.
            Kind::Int { min, max } => match value.as_int() {
                Some(i) => {
                    if let Some(lo) = min.filter(|lo| i < *lo) {
                        fail(format!("must be >= {lo}, got {i}"));
                    } else if let Some(hi) = max.filter(|hi| i > *hi) {
                        fail(format!("must be <= {hi}, got {i}"));
                    }
                }
                None => fail(format!("expected int, got {}", value.type_name())),
            },
            Kind::Float { min, max } => match value.as_float() {
                Some(v) => {
                    if let Some(lo) = min.filter(|lo| v < *lo) {
                        fail(format!("must be >= {lo}, got {v}"));
                    } else if let Some(hi) = max.filter(|hi| v > *hi) {
                        fail(format!("must be <= {hi}, got {v}"));
                    }
                }
                None => fail(format!("expected number, got {}", value.type_name())),
            },
            Kind::Str => {
                if value.as_str().is_none() {
                    fail(format!("expected string, got {}", value.type_name()));
                }
            }
            Kind::OneOf(choices) => match value.as_str() {
                Some(s) if choices.contains(&s) => {}
                Some(s) => fail(format!("`{s}` is not one of {choices:?}")),
                None => fail(format!("expected string, got {}", value.type_name())),
            },
            Kind::List(inner) => match value {
                ConfigNode::List(items) => {
                    for (i, item) in items.iter().enumerate() {
                        inner.check(item, &join(path, &i.to_string()), out);
                    }
                }
                other => fail(format!("expected list, got {}", other.type_name())),
            },
            Kind::Map(schema) => {
                if value.is_map() {
                    out.extend(schema.check(value, path));
                } else {
                    fail(format!("expected map, got {}", value.type_name()));
                }
            }
            Kind::Either(alts) => {
                let accepted = alts.iter().any(|alt| {
                    let mut scratch = Vec::new();
                    alt.check(value, path, &mut scratch);
                    scratch.is_empty()
                });
                if !accepted {
                    fail(format!("expected {}, got {}", self.describe(), value.type_name()));
                }
            }
        }
    }
}

/// One declared key of a mapping.
#[derive(Debug, Clone)]
pub struct Field {
    pub key: &'static str,
    pub kind: Kind,
    pub required: bool,
    /// `null` is a legal value (meaning "unset / auto").
    pub nullable: bool,
}

/// Declared keys of a mapping node.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<Field>,
    /// Undeclared keys are tolerated.
    open: bool,
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() { key.to_string() } else { format!("{prefix}.{key}") }
}

impl Schema {
    /// Schema rejecting undeclared keys.
    pub fn closed() -> Self {
        Self { fields: Vec::new(), open: false }
    }

    /// Schema tolerating undeclared keys.
    pub fn open() -> Self {
        Self { fields: Vec::new(), open: true }
    }

    pub fn required(mut self, key: &'static str, kind: Kind) -> Self {
        self.fields.push(Field { key, kind, required: true, nullable: false });
        self
    }

    pub fn optional(mut self, key: &'static str, kind: Kind) -> Self {
        self.fields.push(Field { key, kind, required: false, nullable: false });
        self
    }

    /// Optional key that may also be `null`.
    pub fn nullable(mut self, key: &'static str, kind: Kind) -> Self {
        self.fields.push(Field { key, kind, required: false, nullable: true });
        self
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Check `node` (expected to be a map) and return every violation,
    /// with paths prefixed by `prefix`.
    pub fn check(&self, node: &ConfigNode, prefix: &str) -> Vec<Violation> {
        let mut out = Vec::new();
        let Some(map) = node.as_map() else {
            out.push(Violation {
                path: prefix.to_string(),
                message: format!("expected map, got {}", node.type_name()),
            });
            return out;
        };

        for field in &self.fields {
            let path = join(prefix, field.key);
            match map.get(field.key) {
                None if field.required => out.push(Violation {
                    path,
                    message: "required key is missing".into(),
                }),
                None => {}
                Some(ConfigNode::Unset) if field.nullable => {}
                Some(ConfigNode::Unset) => out.push(Violation {
                    path,
                    message: "must not be null".into(),
                }),
                Some(value) => field.kind.check(value, &path, &mut out),
            }
        }

        if !self.open {
            for key in map.keys() {
                if !self.fields.iter().any(|f| f.key == key) {
                    out.push(Violation {
                        path: join(prefix, key),
                        message: "unknown key".into(),
                    });
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> ConfigNode {
        ConfigNode::from_yaml_str(s).unwrap()
    }

    fn loader_schema() -> Schema {
        Schema::closed()
            .required("batch_size", Kind::int_min(1))
            .optional("num_workers", Kind::int_min(0))
            .optional("shuffle", Kind::Bool)
            .nullable("file_keys", Kind::list_of(Kind::Str))
            .optional(
                "sampler",
                Kind::Map(Schema::open().required("name", Kind::OneOf(&["random_sequence", "sequential"]))),
            )
    }

    #[test]
    fn test_valid_tree_passes() {
        let node = yaml("batch_size: 4\nnum_workers: 2\nfile_keys: null\nsampler: {name: sequential, seed: 3}");
        assert!(loader_schema().check(&node, "io.loader").is_empty());
    }

    #[test]
    fn test_every_violation_is_reported() {
        let node = yaml("num_workers: -1\nshuffle: yes please\nsampler: {name: bogus}\nextra: 1");
        let violations = loader_schema().check(&node, "io.loader");
        let paths: Vec<&str> = violations.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "io.loader.batch_size",
                "io.loader.num_workers",
                "io.loader.shuffle",
                "io.loader.sampler.name",
                "io.loader.extra",
            ]
        );
    }

    #[test]
    fn test_null_rejected_unless_nullable() {
        let node = yaml("batch_size: null");
        let violations = loader_schema().check(&node, "");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].message, "must not be null");
    }

    #[test]
    fn test_integral_float_is_an_int() {
        let node = yaml("batch_size: 4.0\nnum_workers: 0.0");
        assert!(loader_schema().check(&node, "").is_empty());
        assert_eq!(node.get("batch_size").and_then(ConfigNode::as_int), Some(4));

        let violations = loader_schema().check(&yaml("batch_size: 2.5\nnum_workers: -1.0"), "");
        let messages: Vec<&str> = violations.iter().map(|v| v.message.as_str()).collect();
        assert_eq!(messages, vec!["expected int, got float", "must be >= 0, got -1"]);
    }

    #[test]
    fn test_either_accepts_any_alternative() {
        let kind = Kind::Either(vec![Kind::float(), Kind::list_of(Kind::float())]);
        for text in ["5", "[1, 2.5]"] {
            let mut out = Vec::new();
            kind.check(&yaml(text), "max_length", &mut out);
            assert!(out.is_empty(), "{text}: {out:?}");
        }
        let mut out = Vec::new();
        kind.check(&yaml("abc"), "max_length", &mut out);
        assert_eq!(out.len(), 1);
    }
}
