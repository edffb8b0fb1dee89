use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

// ── FieldValue ────────────────────────────────────────────────────────────────

/// A typed value extracted from a log line.
///
/// Equality, hashing and ordering are total over every variant so values can
/// be used as join and group keys. Floats compare by IEEE total order with
/// `-0.0` folded into `0.0` and every NaN folded into one canonical NaN.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl FieldValue {
    /// Numeric view of the value; `Int` widens to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(i) => Some(*i as f64),
            FieldValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Infer the narrowest type for an untyped token: int, float, bool, then
    /// string.
    pub fn infer(raw: &str) -> FieldValue {
        if let Ok(i) = raw.parse::<i64>() {
            return FieldValue::Int(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            if f.is_finite() {
                return FieldValue::Float(f);
            }
        }
        if raw.eq_ignore_ascii_case("true") {
            return FieldValue::Bool(true);
        }
        if raw.eq_ignore_ascii_case("false") {
            return FieldValue::Bool(false);
        }
        FieldValue::Str(raw.to_string())
    }

    fn rank(&self) -> u8 {
        match self {
            FieldValue::Bool(_) => 0,
            FieldValue::Int(_) => 1,
            FieldValue::Float(_) => 2,
            FieldValue::Str(_) => 3,
        }
    }
}

fn canonical_float(f: f64) -> f64 {
    if f == 0.0 {
        0.0
    } else if f.is_nan() {
        f64::NAN
    } else {
        f
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FieldValue {}

impl Hash for FieldValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            FieldValue::Int(i) => i.hash(state),
            FieldValue::Float(f) => canonical_float(*f).to_bits().hash(state),
            FieldValue::Bool(b) => b.hash(state),
            FieldValue::Str(s) => s.hash(state),
        }
    }
}

impl PartialOrd for FieldValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (FieldValue::Int(a), FieldValue::Int(b)) => a.cmp(b),
            (FieldValue::Float(a), FieldValue::Float(b)) => {
                canonical_float(*a).total_cmp(&canonical_float(*b))
            }
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a.cmp(b),
            (FieldValue::Str(a), FieldValue::Str(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

/// Field name → value map carried by every record.
pub type Fields = BTreeMap<String, FieldValue>;

// ── SourceLocation / Timestamp ────────────────────────────────────────────────

/// Where a record came from. `line` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SourceLocation {
    pub file: Arc<str>,
    pub line: u64,
}

impl SourceLocation {
    pub fn new(file: impl Into<Arc<str>>, line: u64) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// A timestamp found in a log line. The raw text is always kept; `parsed`
/// is best-effort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Timestamp {
    pub raw: String,
    pub parsed: Option<NaiveDateTime>,
}

// ── EventRecord ───────────────────────────────────────────────────────────────

/// A typed event extracted from one log line. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub location: SourceLocation,
    pub timestamp: Option<Timestamp>,
    /// Tag of the rule that produced this record.
    pub kind: String,
    pub fields: Fields,
}

impl EventRecord {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(FieldValue::as_i64)
    }

    /// Numeric field as `f64` (integers widen).
    pub fn float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(FieldValue::as_f64)
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(FieldValue::as_bool)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_str)
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

// ── JoinKey / JoinResult ──────────────────────────────────────────────────────

/// An ordered tuple of field values used to correlate or group records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JoinKey(pub Vec<FieldValue>);

impl JoinKey {
    pub fn new(parts: Vec<FieldValue>) -> Self {
        Self(parts)
    }

    /// Build a key from the named fields of `record`; `None` when any field
    /// is missing.
    pub fn from_fields(record: &EventRecord, names: &[&str]) -> Option<Self> {
        names
            .iter()
            .map(|name| record.get(name).cloned())
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }

    /// A key with a single string component.
    pub fn single(value: impl Into<FieldValue>) -> Self {
        Self(vec![value.into()])
    }

    pub fn parts(&self) -> &[FieldValue] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for JoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("(all)");
        }
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" / ")?;
            }
            write!(f, "{}", part)?;
        }
        Ok(())
    }
}

/// Outcome of correlating one left record.
///
/// At most one of `left` / `right` is absent. When both are present `metric`
/// holds the deterministic `right − left` delta (if a metric was requested).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinResult {
    pub key: JoinKey,
    pub left: Option<EventRecord>,
    pub right: Option<EventRecord>,
    pub metric: Option<f64>,
}

impl JoinResult {
    pub fn is_matched(&self) -> bool {
        self.left.is_some() && self.right.is_some()
    }
}

// ── Verdict ───────────────────────────────────────────────────────────────────

/// Internal pass/fail judgment of an analysis run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Warn,
    /// Nothing of the expected kind was found.
    Skip,
    Fail,
}

impl Verdict {
    pub fn label(self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Warn => "WARN",
            Verdict::Skip => "SKIP",
            Verdict::Fail => "FAIL",
        }
    }

    /// Process exit code for this verdict.
    pub fn exit_code(self) -> i32 {
        match self {
            Verdict::Pass | Verdict::Warn => 0,
            Verdict::Fail => 1,
            Verdict::Skip => 2,
        }
    }

    fn severity(self) -> u8 {
        match self {
            Verdict::Pass => 0,
            Verdict::Warn => 1,
            Verdict::Skip => 2,
            Verdict::Fail => 3,
        }
    }

    /// The more severe of two verdicts.
    pub fn worst(self, other: Verdict) -> Verdict {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
