//! Experiment configuration expansion.
//!
//! An experiment config document is a JSON mapping (or ordered list of
//! mappings) whose values are scalars or lists. List-valued entries expand
//! into the cartesian product of their elements; compound keys of the form
//! `"[k1,k2]"` bind several keys atomically from a list of equal-arity rows.
//! Expansion is deterministic: identical documents always produce the same
//! ordered sequence of argument tuples.

use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while parsing or expanding an experiment config document.
#[derive(Error, Debug)]
pub enum ExpansionError {
    /// Document structure or key syntax is invalid.
    #[error("Invalid experiment config: {0}")]
    Invalid(String),

    /// A compound key row does not match the key's arity.
    #[error(
        "Compound key '{key}' row {index} has {actual} values, expected {expected}"
    )]
    WrongArity { key: String, index: usize, expected: usize, actual: usize },

    /// A value is not a scalar or list of scalars.
    #[error("Value for key '{key}' is unsupported: {found}")]
    UnsupportedValue { key: String, found: String },

    /// The document is not syntactically valid JSON.
    #[error("Experiment config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// I/O error while reading the document.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for expansion operations.
pub type ExpansionResult<T> = std::result::Result<T, ExpansionError>;

/// A scalar experiment-config value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ConfigValue {
    fn from_json(key: &str, value: &serde_json::Value) -> ExpansionResult<Self> {
        match value {
            serde_json::Value::Bool(b) => Ok(ConfigValue::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(ConfigValue::Int(i))
                } else {
                    Ok(ConfigValue::Float(n.as_f64().unwrap_or(f64::NAN)))
                }
            }
            serde_json::Value::String(s) => Ok(ConfigValue::Str(s.clone())),
            other => Err(ExpansionError::UnsupportedValue {
                key: key.to_string(),
                found: json_type_name(other).to_string(),
            }),
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(b) => write!(f, "{}", b),
            ConfigValue::Int(i) => write!(f, "{}", i),
            // Whole floats keep their decimal point so "1.0" round-trips as
            // a float, not an int.
            ConfigValue::Float(v) if v.fract() == 0.0 && v.is_finite() => {
                write!(f, "{:.1}", v)
            }
            ConfigValue::Float(v) => write!(f, "{}", v),
            ConfigValue::Str(s) => write!(f, "{}", s),
        }
    }
}

fn json_type_name(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// One entry of a mapping after compound-key analysis.
#[derive(Debug, Clone, PartialEq)]
enum ConfigEntry {
    /// A fixed binding appended to every tuple.
    Scalar(String, ConfigValue),
    /// One binding chosen per tuple from the list.
    List(String, Vec<ConfigValue>),
    /// Several keys bound atomically from one of the rows.
    CompoundList { keys: Vec<String>, rows: Vec<Vec<ConfigValue>> },
}

impl ConfigEntry {
    /// Number of alternatives this entry contributes to the product. Scalars
    /// contribute exactly one.
    fn choice_count(&self) -> usize {
        match self {
            ConfigEntry::Scalar(..) => 1,
            ConfigEntry::List(_, values) => values.len(),
            ConfigEntry::CompoundList { rows, .. } => rows.len(),
        }
    }

    /// The bindings selected by the i-th alternative.
    fn choose(&self, i: usize) -> Vec<(String, ConfigValue)> {
        match self {
            ConfigEntry::Scalar(k, v) => vec![(k.clone(), v.clone())],
            ConfigEntry::List(k, values) => vec![(k.clone(), values[i].clone())],
            ConfigEntry::CompoundList { keys, rows } => {
                keys.iter().cloned().zip(rows[i].iter().cloned()).collect()
            }
        }
    }
}

/// One mapping of the document, entries in insertion order.
#[derive(Debug, Clone, PartialEq)]
struct Mapping {
    entries: Vec<ConfigEntry>,
}

impl Mapping {
    /// Number of tuples this mapping expands into.
    fn tuple_count(&self) -> usize {
        self.entries.iter().map(ConfigEntry::choice_count).product()
    }

    /// Expands the mapping into binding sets, rightmost entry varying
    /// fastest, exactly like a nested loop over the entries in order.
    fn expand(&self) -> Vec<ArgTuple> {
        let mut tuples = vec![Vec::new()];
        for entry in &self.entries {
            let mut next = Vec::with_capacity(tuples.len() * entry.choice_count());
            for prefix in &tuples {
                for i in 0..entry.choice_count() {
                    let mut bindings: Vec<(String, ConfigValue)> = prefix.clone();
                    bindings.extend(entry.choose(i));
                    next.push(bindings);
                }
            }
            tuples = next;
        }
        tuples.into_iter().map(|bindings| ArgTuple { bindings }).collect()
    }
}

/// One expanded experiment: an ordered set of key/value bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgTuple {
    pub bindings: Vec<(String, ConfigValue)>,
}

impl ArgTuple {
    /// An empty tuple, produced by an empty config document.
    pub fn empty() -> Self {
        Self { bindings: Vec::new() }
    }

    /// Materializes the tuple as argv tokens, prefix arguments first.
    ///
    /// `key=value` becomes `--key value`; a true boolean becomes the bare
    /// flag `--key`; a false boolean is omitted entirely.
    pub fn to_args(&self, prefix: &[String]) -> Vec<String> {
        let mut args: Vec<String> = prefix.to_vec();
        for (key, value) in &self.bindings {
            match value {
                ConfigValue::Bool(true) => args.push(format!("--{}", key)),
                ConfigValue::Bool(false) => {}
                other => {
                    args.push(format!("--{}", key));
                    args.push(other.to_string());
                }
            }
        }
        args
    }
}

/// Parses argv tokens produced by [`ArgTuple::to_args`] back into bindings.
///
/// A bare `--key` flag parses as a true boolean; values re-parse as int,
/// then float, then string. False booleans never appear in argv, so they do
/// not reappear here.
pub fn parse_args(args: &[String]) -> ArgTuple {
    let mut bindings = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let token = &args[i];
        if let Some(key) = token.strip_prefix("--") {
            match args.get(i + 1) {
                Some(next) if !next.starts_with("--") => {
                    bindings.push((key.to_string(), reparse_value(next)));
                    i += 2;
                }
                _ => {
                    bindings.push((key.to_string(), ConfigValue::Bool(true)));
                    i += 1;
                }
            }
        } else {
            i += 1;
        }
    }
    ArgTuple { bindings }
}

fn reparse_value(s: &str) -> ConfigValue {
    if let Ok(i) = s.parse::<i64>() {
        return ConfigValue::Int(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        return ConfigValue::Float(f);
    }
    ConfigValue::Str(s.to_string())
}

/// A parsed experiment config document: an ordered sequence of mappings.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentConfig {
    mappings: Vec<Mapping>,
}

impl ExperimentConfig {
    /// Parses a document from text. Lines whose first non-whitespace
    /// character is `#` are treated as comments and stripped before parsing.
    /// Empty input parses as a single empty mapping.
    pub fn parse(text: &str) -> ExpansionResult<Self> {
        let stripped: String = text
            .lines()
            .filter(|line| !line.trim_start().starts_with('#'))
            .collect::<Vec<_>>()
            .join("\n");

        if stripped.trim().is_empty() {
            return Ok(Self { mappings: vec![Mapping { entries: Vec::new() }] });
        }

        let value: serde_json::Value = serde_json::from_str(&stripped)?;
        Self::from_json(&value)
    }

    /// Parses a document from a file path.
    pub fn from_path(path: &Path) -> ExpansionResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parses a document streamed from a reader (single-shot read).
    pub fn from_reader<R: Read>(mut reader: R) -> ExpansionResult<Self> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        Self::parse(&text)
    }

    /// Builds the document from a parsed JSON value: either one mapping or a
    /// list of mappings.
    pub fn from_json(value: &serde_json::Value) -> ExpansionResult<Self> {
        let mappings = match value {
            serde_json::Value::Object(_) => vec![parse_mapping(value)?],
            serde_json::Value::Array(items) => {
                items.iter().map(parse_mapping).collect::<ExpansionResult<Vec<_>>>()?
            }
            other => {
                return Err(ExpansionError::Invalid(format!(
                    "document must be a mapping or a list of mappings, found {}",
                    json_type_name(other)
                )))
            }
        };
        Ok(Self { mappings })
    }

    /// Total number of tuples the document expands into.
    pub fn tuple_count(&self) -> usize {
        self.mappings.iter().map(Mapping::tuple_count).sum()
    }

    /// Expands the document into its deterministic, ordered tuple sequence.
    pub fn expand(&self) -> Vec<ArgTuple> {
        self.mappings.iter().flat_map(Mapping::expand).collect()
    }
}

/// True if the key uses the compound `[k1,k2,...]` syntax.
fn is_compound_key(key: &str) -> bool {
    key.len() > 2 && key.starts_with('[') && key.ends_with(']')
}

/// Splits a compound key into its component keys.
fn compound_keys(key: &str) -> ExpansionResult<Vec<String>> {
    let inner = &key[1..key.len() - 1];
    let keys: Vec<String> = inner.split(',').map(|k| k.trim().to_string()).collect();
    if keys.iter().any(|k| k.is_empty() || !is_plain_key(k)) {
        return Err(ExpansionError::Invalid(format!("'{}' is not a valid compound key", key)));
    }
    Ok(keys)
}

/// Plain keys must not contain whitespace, commas, or brackets.
fn is_plain_key(key: &str) -> bool {
    !key.is_empty()
        && !key.chars().any(|c| c.is_whitespace() || matches!(c, ',' | '[' | ']'))
}

fn parse_mapping(value: &serde_json::Value) -> ExpansionResult<Mapping> {
    let object = value.as_object().ok_or_else(|| {
        ExpansionError::Invalid(format!(
            "each element of a config list must be a mapping, found {}",
            json_type_name(value)
        ))
    })?;

    let mut entries = Vec::with_capacity(object.len());
    for (key, val) in object {
        if is_compound_key(key) {
            entries.push(parse_compound_entry(key, val)?);
        } else if is_plain_key(key) {
            entries.push(parse_plain_entry(key, val)?);
        } else {
            return Err(ExpansionError::Invalid(format!("key '{}' is invalid", key)));
        }
    }
    Ok(Mapping { entries })
}

fn parse_plain_entry(key: &str, value: &serde_json::Value) -> ExpansionResult<ConfigEntry> {
    match value {
        serde_json::Value::Array(items) => {
            let values = items
                .iter()
                .map(|v| ConfigValue::from_json(key, v))
                .collect::<ExpansionResult<Vec<_>>>()?;
            Ok(ConfigEntry::List(key.to_string(), values))
        }
        scalar => Ok(ConfigEntry::Scalar(key.to_string(), ConfigValue::from_json(key, scalar)?)),
    }
}

fn parse_compound_entry(key: &str, value: &serde_json::Value) -> ExpansionResult<ConfigEntry> {
    let keys = compound_keys(key)?;
    let arity = keys.len();

    let items = value.as_array().ok_or_else(|| ExpansionError::Invalid(format!(
        "compound key '{}' requires a list value, found {}",
        key,
        json_type_name(value)
    )))?;

    // A flat list of scalars is a single row when its length matches the
    // key's arity.
    let rows: Vec<Vec<ConfigValue>> = if items.iter().all(|v| !v.is_array()) {
        let row = items
            .iter()
            .map(|v| ConfigValue::from_json(key, v))
            .collect::<ExpansionResult<Vec<_>>>()?;
        if row.len() != arity {
            return Err(ExpansionError::WrongArity {
                key: key.to_string(),
                index: 0,
                expected: arity,
                actual: row.len(),
            });
        }
        vec![row]
    } else {
        items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let inner = item.as_array().ok_or_else(|| ExpansionError::Invalid(format!(
                    "compound key '{}' row {} must be a list",
                    key, index
                )))?;
                let row = inner
                    .iter()
                    .map(|v| ConfigValue::from_json(key, v))
                    .collect::<ExpansionResult<Vec<_>>>()?;
                if row.len() != arity {
                    return Err(ExpansionError::WrongArity {
                        key: key.to_string(),
                        index,
                        expected: arity,
                        actual: row.len(),
                    });
                }
                Ok(row)
            })
            .collect::<ExpansionResult<Vec<_>>>()?
    };

    Ok(ConfigEntry::CompoundList { keys, rows })
}
