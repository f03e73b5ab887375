use serde_json::Value;

use super::rule::{Branch, Condition, FilterRule, Operator};
use crate::template::path::{as_number, is_truthy, stringify};

impl FilterRule {
    pub fn matches(&self, context: &Value) -> bool {
        match self {
            Self::Branch(branch) => branch.matches(context),
            Self::Leaf(cond) => cond.matches(context),
        }
    }
}

impl Branch {
    /// Every present clause must hold.
    pub fn matches(&self, context: &Value) -> bool {
        let all = self
            .all
            .as_ref()
            .map_or(true, |rules| rules.iter().all(|r| r.matches(context)));
        let any = self
            .any
            .as_ref()
            .map_or(true, |rules| rules.iter().any(|r| r.matches(context)));
        let none = self
            .none
            .as_ref()
            .map_or(true, |rules| !rules.iter().any(|r| r.matches(context)));
        all && any && none
    }
}

impl Condition {
    pub fn matches(&self, context: &Value) -> bool {
        let values = field_values(context, &self.field);
        let cs = self.case_sensitive;
        let any = |pred: &dyn Fn(&Value) -> bool| values.iter().any(pred);
        let none = |pred: &dyn Fn(&Value) -> bool| !values.iter().any(pred);

        match &self.operator {
            Operator::Equals(lit) => any(&|v| scalar_eq(v, lit, cs)),
            Operator::NotEquals(lit) => none(&|v| scalar_eq(v, lit, cs)),
            Operator::Contains(lit) => any(&|v| contains(v, lit, cs)),
            Operator::NotContains(lit) => none(&|v| contains(v, lit, cs)),
            Operator::StartsWith(prefix) => {
                any(&|v| fold(&stringify(v), cs).starts_with(&fold(prefix, cs)))
            }
            Operator::EndsWith(suffix) => {
                any(&|v| fold(&stringify(v), cs).ends_with(&fold(suffix, cs)))
            }
            Operator::Matches(pattern) => any(&|v| pattern.is_match(&stringify(v))),
            Operator::NotMatches(pattern) => none(&|v| pattern.is_match(&stringify(v))),
            Operator::In(items) => any(&|v| items.iter().any(|item| scalar_eq(v, item, cs))),
            Operator::NotIn(items) => none(&|v| items.iter().any(|item| scalar_eq(v, item, cs))),
            Operator::Present(sense) => values.iter().any(is_truthy) == *sense,
            Operator::Absent(sense) => values.iter().any(is_truthy) != *sense,
        }
    }
}

/// Resolves a dotted path, fanning out across arrays. Lists are flattened
/// so a list-valued field yields one entry per element.
pub fn field_values(context: &Value, path: &str) -> Vec<Value> {
    let mut current = vec![context];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Object(map) => {
                    if let Some(v) = map.get(segment) {
                        next.push(v);
                    }
                }
                Value::Array(items) => match segment.parse::<usize>() {
                    Ok(idx) => next.extend(items.get(idx)),
                    Err(_) => next.extend(items.iter().filter_map(|item| item.get(segment))),
                },
                _ => {}
            }
        }
        current = next;
    }

    let mut out = Vec::new();
    for value in current {
        match value {
            Value::Null => {}
            Value::Array(items) => out.extend(items.iter().filter(|v| !v.is_null()).cloned()),
            other => out.push(other.clone()),
        }
    }
    out
}

fn fold(text: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        text.to_string()
    } else {
        text.to_lowercase()
    }
}

fn scalar_eq(value: &Value, literal: &Value, case_sensitive: bool) -> bool {
    if let (Some(a), Some(b)) = (value.as_str(), literal.as_str()) {
        return fold(a, case_sensitive) == fold(b, case_sensitive);
    }
    if value.is_number() || literal.is_number() {
        if let (Some(a), Some(b)) = (as_number(value), as_number(literal)) {
            return a == b;
        }
    }
    fold(&stringify(value), case_sensitive) == fold(&stringify(literal), case_sensitive)
}

fn contains(value: &Value, literal: &Value, case_sensitive: bool) -> bool {
    match (value, literal) {
        (Value::String(haystack), Value::String(needle)) => {
            fold(haystack, case_sensitive).contains(&fold(needle, case_sensitive))
        }
        _ => scalar_eq(value, literal, case_sensitive),
    }
}
