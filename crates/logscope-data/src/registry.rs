//! Named extraction rules and the registry that applies them.
//!
//! Rules are tried in registration order and the first one that matches a
//! line wins. A rule either matches (producing typed fields), does not match,
//! or, for payload rules whose marker is present, fails to parse.

use std::fmt;
use std::sync::Arc;

use logscope_core::data_processors::DataConverter;
use logscope_core::models::{FieldValue, Fields, SourceLocation};
use logscope_core::{AnalysisError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Field specs ───────────────────────────────────────────────────────────────

/// Declared type of an extracted field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Int,
    Float,
    Bool,
    #[serde(rename = "string", alias = "str")]
    Str,
}

impl FieldType {
    /// Convert captured text; `None` when the text is not a valid value of
    /// this type.
    pub fn convert(self, raw: &str) -> Option<FieldValue> {
        let raw = raw.trim();
        match self {
            FieldType::Int => raw.parse::<i64>().ok().map(FieldValue::Int),
            FieldType::Float => {
                // Values at the end of a sentence carry one trailing period.
                let text = raw.strip_suffix('.').unwrap_or(raw);
                text.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(FieldValue::Float)
            }
            FieldType::Bool => {
                if raw.eq_ignore_ascii_case("true") {
                    Some(FieldValue::Bool(true))
                } else if raw.eq_ignore_ascii_case("false") {
                    Some(FieldValue::Bool(false))
                } else {
                    None
                }
            }
            FieldType::Str => Some(FieldValue::Str(raw.to_string())),
        }
    }

    /// Re-type an already inferred value (payload fields).
    pub fn coerce(self, value: &FieldValue) -> Option<FieldValue> {
        match (self, value) {
            (FieldType::Int, FieldValue::Int(_))
            | (FieldType::Float, FieldValue::Float(_))
            | (FieldType::Bool, FieldValue::Bool(_))
            | (FieldType::Str, FieldValue::Str(_)) => Some(value.clone()),
            (FieldType::Float, FieldValue::Int(i)) => Some(FieldValue::Float(*i as f64)),
            (FieldType::Str, other) => Some(FieldValue::Str(other.to_string())),
            (ty, FieldValue::Str(s)) => ty.convert(s),
            _ => None,
        }
    }
}

/// A named field with its declared type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type", default = "default_field_type")]
    pub ty: FieldType,
}

fn default_field_type() -> FieldType {
    FieldType::Str
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Int)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Float)
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Bool)
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Str)
    }
}

// ── Matchers ──────────────────────────────────────────────────────────────────

/// How a payload following a marker is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadFormat {
    Json,
    KeyValue,
}

/// Code-supplied matcher.
pub type CustomMatch = Arc<dyn Fn(&str) -> Option<Fields> + Send + Sync>;

/// Strategy a rule uses to recognise and decode a line.
#[derive(Clone)]
pub enum Matcher {
    Regex {
        regex: Regex,
        fields: Vec<FieldSpec>,
        /// Literals that must all appear in the line.
        require: Vec<String>,
        /// Literals that must not appear in the line.
        exclude: Vec<String>,
    },
    Payload {
        marker: String,
        format: PayloadFormat,
        fields: Vec<FieldSpec>,
    },
    Custom(CustomMatch),
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Regex {
                regex,
                fields,
                require,
                exclude,
            } => f
                .debug_struct("Regex")
                .field("regex", &regex.as_str())
                .field("fields", fields)
                .field("require", require)
                .field("exclude", exclude)
                .finish(),
            Matcher::Payload {
                marker,
                format,
                fields,
            } => f
                .debug_struct("Payload")
                .field("marker", marker)
                .field("format", format)
                .field("fields", fields)
                .finish(),
            Matcher::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Result of applying one rule to one line.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched(Fields),
    NoMatch,
    /// The marker was present but the payload could not be decoded.
    ParseError(String),
}

// ── PatternRule ───────────────────────────────────────────────────────────────

/// A named extraction rule. `kind` tags the records it produces.
#[derive(Debug, Clone)]
pub struct PatternRule {
    pub name: String,
    pub kind: String,
    pub matcher: Matcher,
}

impl PatternRule {
    /// Regex rule; the kind defaults to the rule name.
    pub fn regex(name: impl Into<String>, pattern: &str) -> Result<Self> {
        let name = name.into();
        let regex = Regex::new(pattern).map_err(|source| AnalysisError::InvalidPattern {
            rule: name.clone(),
            source,
        })?;
        Ok(Self {
            kind: name.clone(),
            name,
            matcher: Matcher::Regex {
                regex,
                fields: Vec::new(),
                require: Vec::new(),
                exclude: Vec::new(),
            },
        })
    }

    pub fn payload(name: impl Into<String>, marker: impl Into<String>, format: PayloadFormat) -> Self {
        let name = name.into();
        Self {
            kind: name.clone(),
            name,
            matcher: Matcher::Payload {
                marker: marker.into(),
                format,
                fields: Vec::new(),
            },
        }
    }

    pub fn custom<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&str) -> Option<Fields> + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            kind: name.clone(),
            name,
            matcher: Matcher::Custom(Arc::new(f)),
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Declare typed fields (regex and payload rules).
    ///
    /// Declared fields are optional: one that the line does not carry (an
    /// optional capture group that did not take part, a payload key that is
    /// absent) is left out of the record. Only a field that is present and
    /// fails conversion rejects the match.
    pub fn fields(mut self, specs: impl IntoIterator<Item = FieldSpec>) -> Self {
        match &mut self.matcher {
            Matcher::Regex { fields, .. } | Matcher::Payload { fields, .. } => fields.extend(specs),
            Matcher::Custom(_) => {}
        }
        self
    }

    pub fn require(mut self, literal: impl Into<String>) -> Self {
        if let Matcher::Regex { require, .. } = &mut self.matcher {
            require.push(literal.into());
        }
        self
    }

    pub fn exclude(mut self, literal: impl Into<String>) -> Self {
        if let Matcher::Regex { exclude, .. } = &mut self.matcher {
            exclude.push(literal.into());
        }
        self
    }

    /// Apply the rule to one line.
    pub fn apply(&self, line: &str) -> MatchOutcome {
        match &self.matcher {
            Matcher::Regex {
                regex,
                fields,
                require,
                exclude,
            } => {
                if !require.iter().all(|lit| line.contains(lit.as_str()))
                    || exclude.iter().any(|lit| line.contains(lit.as_str()))
                {
                    return MatchOutcome::NoMatch;
                }
                match match_regex(regex, fields, line) {
                    Some(out) => MatchOutcome::Matched(out),
                    None => MatchOutcome::NoMatch,
                }
            }
            Matcher::Payload {
                marker,
                format,
                fields,
            } => {
                let Some(idx) = line.find(marker.as_str()) else {
                    return MatchOutcome::NoMatch;
                };
                let body = &line[idx + marker.len()..];
                let parsed = match format {
                    PayloadFormat::Json => parse_json_payload(body),
                    PayloadFormat::KeyValue => parse_key_value_payload(body),
                };
                match parsed {
                    Ok(mut out) => {
                        if apply_field_specs(&mut out, fields) {
                            MatchOutcome::Matched(out)
                        } else {
                            MatchOutcome::NoMatch
                        }
                    }
                    Err(message) => MatchOutcome::ParseError(message),
                }
            }
            Matcher::Custom(f) => match f(line) {
                Some(out) => MatchOutcome::Matched(out),
                None => MatchOutcome::NoMatch,
            },
        }
    }
}

fn match_regex(regex: &Regex, specs: &[FieldSpec], line: &str) -> Option<Fields> {
    let caps = regex.captures(line)?;
    let mut out = Fields::new();
    for name in regex.capture_names().flatten() {
        let Some(m) = caps.name(name) else {
            continue;
        };
        let value = match specs.iter().find(|s| s.name == name) {
            Some(spec) => spec.ty.convert(m.as_str())?,
            None => FieldValue::Str(m.as_str().to_string()),
        };
        out.insert(name.to_string(), value);
    }
    Some(out)
}

/// Re-type declared fields in place; `false` if any present field fails.
/// Absent declared fields are skipped, matching optional regex groups.
fn apply_field_specs(fields: &mut Fields, specs: &[FieldSpec]) -> bool {
    for spec in specs {
        if let Some(value) = fields.get_mut(&spec.name) {
            match spec.ty.coerce(value) {
                Some(v) => *value = v,
                None => return false,
            }
        }
    }
    true
}

// ── Payload decoding ──────────────────────────────────────────────────────────

fn parse_json_payload(body: &str) -> std::result::Result<Fields, String> {
    let start = body.find('{');
    let end = body.rfind('}');
    let (Some(start), Some(end)) = (start, end) else {
        return Err("no JSON object after marker".to_string());
    };
    if end < start {
        return Err("no JSON object after marker".to_string());
    }
    let value: serde_json::Value = serde_json::from_str(&body[start..=end])
        .map_err(|e| format!("JSON parse error: {}", e))?;
    Ok(DataConverter::flatten_json(&value, ""))
}

/// Decode whitespace separated `key:value` / `key=value` tokens.
///
/// A parenthesised value holding its own pairs, such as
/// `moving:(x:True y:False)`, flattens to `moving.x` and `moving.y`; any other
/// parenthesised value is kept as one string. Tokens without a separator are
/// ignored.
pub fn parse_key_value_payload(body: &str) -> std::result::Result<Fields, String> {
    let mut out = Fields::new();
    let pairs = parse_pairs(body, "", &mut out)?;
    if pairs == 0 {
        return Err("no key-value pairs after marker".to_string());
    }
    Ok(out)
}

fn parse_pairs(text: &str, prefix: &str, out: &mut Fields) -> std::result::Result<usize, String> {
    let mut pairs = 0;
    for token in split_top_level(text)? {
        let Some(sep) = token.find([':', '=']) else {
            continue;
        };
        let (key, value) = (&token[..sep], &token[sep + 1..]);
        if key.is_empty() || key.contains('(') {
            continue;
        }
        let name = format!("{}{}", prefix, key);
        let value = value.trim_end_matches([',', ';']);

        if let Some(inner) = value.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
            let nested = parse_pairs(inner, &format!("{}.", name), out)?;
            if nested > 0 {
                pairs += nested;
                continue;
            }
        }
        out.insert(name, FieldValue::infer(value));
        pairs += 1;
    }
    Ok(pairs)
}

/// Split on whitespace outside parentheses.
fn split_top_level(text: &str) -> std::result::Result<Vec<&str>, String> {
    let mut tokens = Vec::new();
    let mut depth: i32 = 0;
    let mut start: Option<usize> = None;

    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err("unbalanced parentheses in payload".to_string());
                }
            }
            _ => {}
        }
        if c.is_whitespace() && depth == 0 {
            if let Some(s) = start.take() {
                tokens.push(&text[s..i]);
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if depth != 0 {
        return Err("unbalanced parentheses in payload".to_string());
    }
    if let Some(s) = start {
        tokens.push(&text[s..]);
    }
    Ok(tokens)
}

// ── PatternRegistry ───────────────────────────────────────────────────────────

/// A payload that carried a rule's marker but could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{location} [{rule}] {message}")]
pub struct PatternParseError {
    pub location: SourceLocation,
    pub rule: String,
    pub message: String,
}

/// Outcome of matching a line against the whole registry.
#[derive(Debug)]
pub enum LineMatch<'a> {
    Record {
        rule: &'a PatternRule,
        fields: Fields,
    },
    ParseError {
        rule: &'a PatternRule,
        message: String,
    },
    None,
}

/// Ordered set of extraction rules.
#[derive(Debug, Clone, Default)]
pub struct PatternRegistry {
    rules: Vec<PatternRule>,
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule; it is tried after every rule registered before it.
    pub fn register(&mut self, rule: PatternRule) {
        self.rules.push(rule);
    }

    pub fn with(mut self, rule: PatternRule) -> Self {
        self.register(rule);
        self
    }

    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Try every rule in order; the first match or parse error ends the
    /// search.
    pub fn match_line(&self, line: &str) -> LineMatch<'_> {
        for rule in &self.rules {
            match rule.apply(line) {
                MatchOutcome::Matched(fields) => return LineMatch::Record { rule, fields },
                MatchOutcome::ParseError(message) => return LineMatch::ParseError { rule, message },
                MatchOutcome::NoMatch => {}
            }
        }
        LineMatch::None
    }

    /// Build a registry from rule file entries, compiling every pattern up
    /// front.
    pub fn from_configs(configs: &[RuleConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            registry.register(config.build()?);
        }
        Ok(registry)
    }
}

// ── Rule file entries ─────────────────────────────────────────────────────────

/// One rule as written in a JSON rule file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(flatten)]
    pub matcher: MatcherConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "kebab-case")]
pub enum MatcherConfig {
    Regex {
        pattern: String,
        #[serde(default)]
        fields: Vec<FieldSpec>,
        #[serde(default)]
        require: Vec<String>,
        #[serde(default)]
        exclude: Vec<String>,
    },
    Payload {
        marker: String,
        format: PayloadFormat,
        #[serde(default)]
        fields: Vec<FieldSpec>,
    },
}

impl RuleConfig {
    pub fn build(&self) -> Result<PatternRule> {
        let rule = match &self.matcher {
            MatcherConfig::Regex {
                pattern,
                fields,
                require,
                exclude,
            } => {
                let mut rule = PatternRule::regex(&self.name, pattern)?.fields(fields.iter().cloned());
                for lit in require {
                    rule = rule.require(lit.clone());
                }
                for lit in exclude {
                    rule = rule.exclude(lit.clone());
                }
                rule
            }
            MatcherConfig::Payload {
                marker,
                format,
                fields,
            } => {
                if marker.is_empty() {
                    return Err(AnalysisError::Config(format!(
                        "rule '{}' has an empty marker",
                        self.name
                    )));
                }
                PatternRule::payload(&self.name, marker.clone(), *format).fields(fields.iter().cloned())
            }
        };
        Ok(match &self.kind {
            Some(kind) => rule.kind(kind.clone()),
            None => rule,
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
