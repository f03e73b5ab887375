use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::core::error::CoreError;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FilterError {
    #[error("Filter is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("Filter node must be an object")]
    NotAnObject,
    #[error("Branch '{0}' must be an array of rules")]
    BranchNotArray(String),
    #[error("Rule for field '{0}' has no operator")]
    MissingOperator(String),
    #[error("Rule for field '{0}' has more than one operator")]
    MultipleOperators(String),
    #[error("Unknown operator '{0}'")]
    UnknownOperator(String),
    #[error("Rule is missing a 'field'")]
    MissingField,
    #[error("Operator '{operator}' expects {expected}")]
    InvalidValue {
        operator: &'static str,
        expected: &'static str,
    },
    #[error("Invalid regular expression '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },
}

impl From<FilterError> for CoreError {
    fn from(err: FilterError) -> Self {
        CoreError::Validation(err.to_string())
    }
}

const OPERATORS: &[&str] = &[
    "equals",
    "not_equals",
    "contains",
    "not_contains",
    "starts_with",
    "ends_with",
    "matches",
    "not_matches",
    "in",
    "not_in",
    "present",
    "absent",
];

const LEAF_KEYS: &[&str] = &["field", "case_sensitive", "operator", "value"];
const BRANCH_KEYS: &[&str] = &["all", "any", "none"];

/// Compiled regex compared by its source text.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    fn compile(source: &str, case_sensitive: bool) -> Result<Self, FilterError> {
        let regex = RegexBuilder::new(source)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| FilterError::InvalidRegex {
                pattern: source.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Equals(Value),
    NotEquals(Value),
    Contains(Value),
    NotContains(Value),
    StartsWith(String),
    EndsWith(String),
    Matches(Pattern),
    NotMatches(Pattern),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    /// `false` flips the sense.
    Present(bool),
    Absent(bool),
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Equals(_) => "equals",
            Self::NotEquals(_) => "not_equals",
            Self::Contains(_) => "contains",
            Self::NotContains(_) => "not_contains",
            Self::StartsWith(_) => "starts_with",
            Self::EndsWith(_) => "ends_with",
            Self::Matches(_) => "matches",
            Self::NotMatches(_) => "not_matches",
            Self::In(_) => "in",
            Self::NotIn(_) => "not_in",
            Self::Present(_) => "present",
            Self::Absent(_) => "absent",
        }
    }

    fn parse(name: &str, value: &Value, case_sensitive: bool) -> Result<Self, FilterError> {
        let scalar = |operator: &'static str| -> Result<Value, FilterError> {
            match value {
                Value::Array(_) | Value::Object(_) => Err(FilterError::InvalidValue {
                    operator,
                    expected: "a scalar value",
                }),
                other => Ok(other.clone()),
            }
        };
        let text = |operator: &'static str| -> Result<String, FilterError> {
            value
                .as_str()
                .map(str::to_string)
                .ok_or(FilterError::InvalidValue {
                    operator,
                    expected: "a string",
                })
        };
        let list = |operator: &'static str| -> Result<Vec<Value>, FilterError> {
            value.as_array().cloned().ok_or(FilterError::InvalidValue {
                operator,
                expected: "an array",
            })
        };
        let flag = |operator: &'static str| -> Result<bool, FilterError> {
            match value {
                Value::Null => Ok(true),
                Value::Bool(b) => Ok(*b),
                _ => Err(FilterError::InvalidValue {
                    operator,
                    expected: "a boolean",
                }),
            }
        };

        Ok(match name {
            "equals" => Self::Equals(scalar("equals")?),
            "not_equals" => Self::NotEquals(scalar("not_equals")?),
            "contains" => Self::Contains(scalar("contains")?),
            "not_contains" => Self::NotContains(scalar("not_contains")?),
            "starts_with" => Self::StartsWith(text("starts_with")?),
            "ends_with" => Self::EndsWith(text("ends_with")?),
            "matches" => Self::Matches(Pattern::compile(&text("matches")?, case_sensitive)?),
            "not_matches" => {
                Self::NotMatches(Pattern::compile(&text("not_matches")?, case_sensitive)?)
            }
            "in" => Self::In(list("in")?),
            "not_in" => Self::NotIn(list("not_in")?),
            "present" => Self::Present(flag("present")?),
            "absent" => Self::Absent(flag("absent")?),
            other => return Err(FilterError::UnknownOperator(other.to_string())),
        })
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Equals(v) | Self::NotEquals(v) | Self::Contains(v) | Self::NotContains(v) => {
                v.clone()
            }
            Self::StartsWith(s) | Self::EndsWith(s) => Value::String(s.clone()),
            Self::Matches(p) | Self::NotMatches(p) => Value::String(p.source.clone()),
            Self::In(items) | Self::NotIn(items) => Value::Array(items.clone()),
            Self::Present(b) | Self::Absent(b) => Value::Bool(*b),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub case_sensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Branch {
    pub all: Option<Vec<FilterRule>>,
    pub any: Option<Vec<FilterRule>>,
    pub none: Option<Vec<FilterRule>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum FilterRule {
    Branch(Branch),
    Leaf(Condition),
}

impl FilterRule {
    pub fn parse(text: &str) -> Result<Self, FilterError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| FilterError::InvalidJson(e.to_string()))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, FilterError> {
        let map = value.as_object().ok_or(FilterError::NotAnObject)?;
        if BRANCH_KEYS.iter().any(|k| map.contains_key(*k)) {
            let children = |key: &str| -> Result<Option<Vec<FilterRule>>, FilterError> {
                match map.get(key) {
                    None => Ok(None),
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(FilterRule::from_value)
                        .collect::<Result<Vec<_>, _>>()
                        .map(Some),
                    Some(_) => Err(FilterError::BranchNotArray(key.to_string())),
                }
            };
            return Ok(Self::Branch(Branch {
                all: children("all")?,
                any: children("any")?,
                none: children("none")?,
            }));
        }
        parse_leaf(map).map(Self::Leaf)
    }

    /// JSON form with keys sorted at every level.
    pub fn to_value(&self) -> Value {
        let mut sorted = BTreeMap::new();
        match self {
            Self::Branch(branch) => {
                for (key, children) in [
                    ("all", &branch.all),
                    ("any", &branch.any),
                    ("none", &branch.none),
                ] {
                    if let Some(children) = children {
                        sorted.insert(
                            key.to_string(),
                            Value::Array(children.iter().map(FilterRule::to_value).collect()),
                        );
                    }
                }
            }
            Self::Leaf(cond) => {
                sorted.insert("field".to_string(), Value::String(cond.field.clone()));
                if cond.case_sensitive {
                    sorted.insert("case_sensitive".to_string(), Value::Bool(true));
                }
                sorted.insert(cond.operator.name().to_string(), sort_keys(cond.operator.to_value()));
            }
        }
        Value::Object(sorted.into_iter().collect::<Map<String, Value>>())
    }

    pub fn to_canonical_json(&self) -> String {
        self.to_value().to_string()
    }
}

impl TryFrom<Value> for FilterRule {
    type Error = FilterError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(&value)
    }
}

impl From<FilterRule> for Value {
    fn from(rule: FilterRule) -> Self {
        rule.to_value()
    }
}

/// Validates stored filter text and returns its canonical form.
pub fn canonicalize(text: &str) -> Result<String, FilterError> {
    FilterRule::parse(text).map(|rule| rule.to_canonical_json())
}

fn parse_leaf(map: &Map<String, Value>) -> Result<Condition, FilterError> {
    let field = map
        .get("field")
        .and_then(Value::as_str)
        .filter(|f| !f.trim().is_empty())
        .ok_or(FilterError::MissingField)?
        .to_string();

    let case_sensitive = match map.get("case_sensitive") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => {
            return Err(FilterError::InvalidValue {
                operator: "case_sensitive",
                expected: "a boolean",
            })
        }
    };

    let mut operators: Vec<(&str, &Value)> = map
        .iter()
        .filter(|(k, _)| !LEAF_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.as_str(), v))
        .collect();

    if let Some(name) = map.get("operator") {
        let name = name.as_str().ok_or(FilterError::InvalidValue {
            operator: "operator",
            expected: "a string",
        })?;
        operators.push((name, map.get("value").unwrap_or(&Value::Null)));
    }

    match operators.as_slice() {
        [] => Err(FilterError::MissingOperator(field)),
        [(name, value)] => {
            if !OPERATORS.contains(name) {
                return Err(FilterError::UnknownOperator(name.to_string()));
            }
            Ok(Condition {
                operator: Operator::parse(name, value, case_sensitive)?,
                field,
                case_sensitive,
            })
        }
        _ => Err(FilterError::MultipleOperators(field)),
    }
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_operator_as_key_and_explicit_forms() {
        let a = FilterRule::from_value(&json!({"field": "subject", "contains": "urgent"})).unwrap();
        let b = FilterRule::from_value(
            &json!({"field": "subject", "operator": "contains", "value": "urgent"}),
        )
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_validation_errors() {
        assert_eq!(
            FilterRule::from_value(&json!({"field": "subject"})),
            Err(FilterError::MissingOperator("subject".into()))
        );
        assert_eq!(
            FilterRule::from_value(&json!({"field": "s", "equals": "a", "contains": "b"})),
            Err(FilterError::MultipleOperators("s".into()))
        );
        assert_eq!(
            FilterRule::from_value(&json!({"field": "s", "like": "a"})),
            Err(FilterError::UnknownOperator("like".into()))
        );
        assert!(matches!(
            FilterRule::from_value(&json!({"field": "s", "in": "a"})),
            Err(FilterError::InvalidValue { operator: "in", .. })
        ));
        assert!(matches!(
            FilterRule::from_value(&json!({"field": "s", "matches": "(unclosed"})),
            Err(FilterError::InvalidRegex { .. })
        ));
        assert_eq!(
            FilterRule::from_value(&json!({"any": {"field": "s"}})),
            Err(FilterError::BranchNotArray("any".into()))
        );
        assert_eq!(FilterRule::from_value(&json!([])), Err(FilterError::NotAnObject));
    }

    #[test]
    fn test_canonical_form_sorts_keys_and_reparses() {
        let text = r#"{"any":[{"field":"subject","matches":"^re:"}],"all":[{"in":["a","b"],"field":"from.domain","case_sensitive":true}]}"#;
        let canonical = canonicalize(text).unwrap();
        assert_eq!(
            canonical,
            r#"{"all":[{"case_sensitive":true,"field":"from.domain","in":["a","b"]}],"any":[{"field":"subject","matches":"^re:"}]}"#
        );
        let reparsed = FilterRule::parse(&canonical).unwrap();
        assert_eq!(reparsed, FilterRule::parse(text).unwrap());
        assert_eq!(reparsed.to_canonical_json(), canonical);
    }

    #[test]
    fn test_serde_round_trip_through_value() {
        let rule: FilterRule =
            serde_json::from_value(json!({"none": [{"field": "flags", "contains": "\\Flagged"}]}))
                .unwrap();
        let value = serde_json::to_value(&rule).unwrap();
        assert_eq!(value, json!({"none": [{"field": "flags", "contains": "\\Flagged"}]}));
    }
}
