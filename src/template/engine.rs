use chrono::Utc;
use log::{debug, warn};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::conditional::Operand;
use super::dynamic::{resolve_batch, DynamicQuery, DynamicQuerySource};
use super::path::{is_upper_identifier, resolve_path, stringify, system_tokens};
use super::source::TemplateSource;
use super::tokens::{referenced_tokens, scan, whole_token, Expr, Segment};

pub type TokenMap = HashMap<String, Value>;

const DEFAULT_MAX_DEPTH: usize = 5;

/// Stateless renderer; repositories are only consulted while preparing a render.
#[derive(Clone)]
pub struct TemplateEngine {
    templates: Option<Arc<dyn TemplateSource>>,
    dynamic: Option<Arc<dyn DynamicQuerySource>>,
    max_depth: usize,
    expand_templates: bool,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TemplateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEngine")
            .field("templates", &self.templates.is_some())
            .field("dynamic", &self.dynamic.is_some())
            .field("max_depth", &self.max_depth)
            .field("expand_templates", &self.expand_templates)
            .finish()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        Self {
            templates: None,
            dynamic: None,
            max_depth: DEFAULT_MAX_DEPTH,
            expand_templates: true,
        }
    }

    pub fn with_templates(mut self, source: Arc<dyn TemplateSource>) -> Self {
        self.templates = Some(source);
        self
    }

    pub fn with_dynamic_queries(mut self, source: Arc<dyn DynamicQuerySource>) -> Self {
        self.dynamic = Some(source);
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Leaves `{{slug}}` references to message templates untouched.
    pub fn without_template_expansion(mut self) -> Self {
        self.expand_templates = false;
        self
    }

    pub async fn render(&self, input: &Value, context: &Value) -> Value {
        self.render_with_tokens(input, context, TokenMap::new()).await
    }

    /// Renders with caller-supplied tokens taking precedence over dynamic queries.
    pub async fn render_with_tokens(
        &self,
        input: &Value,
        context: &Value,
        tokens: TokenMap,
    ) -> Value {
        let mut scope = Scope {
            context,
            tokens: normalise_keys(tokens),
            system: system_tokens(context),
            templates: HashMap::new(),
            max_depth: self.max_depth,
        };

        let mut names = Vec::new();
        collect_strings(input, &mut |s| names.extend(referenced_tokens(s)));
        self.load_templates(&mut scope, &mut names).await;
        self.resolve_dynamic(&mut scope, &names).await;

        scope.render_value(input)
    }

    pub async fn render_str(&self, input: &str, context: &Value) -> String {
        stringify(&self.render(&Value::String(input.to_string()), context).await)
    }

    async fn load_templates(&self, scope: &mut Scope<'_>, names: &mut Vec<String>) {
        let Some(source) = self.templates.as_ref().filter(|_| self.expand_templates) else {
            return;
        };

        let mut visited = HashSet::new();
        let mut frontier: Vec<String> = names.clone();
        for _ in 0..self.max_depth {
            let mut next = Vec::new();
            for name in frontier {
                if !visited.insert(name.clone()) || !scope.may_reference_template(&name) {
                    continue;
                }
                match source.find_by_reference(&name).await {
                    Ok(Some(template)) => {
                        let nested = referenced_tokens(&template.content);
                        next.extend(nested.iter().cloned());
                        names.extend(nested);
                        scope.templates.insert(name, template.content);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Message template {} could not be loaded: {}", name, e),
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        debug!("Loaded {} message template(s) for render", scope.templates.len());
    }

    async fn resolve_dynamic(&self, scope: &mut Scope<'_>, names: &[String]) {
        let queries: Vec<DynamicQuery> = names
            .iter()
            .filter_map(|n| DynamicQuery::parse(n))
            .filter(|q| !scope.tokens.contains_key(&q.key()))
            .collect();
        if queries.is_empty() {
            return;
        }
        let Some(source) = self.dynamic.as_ref() else {
            debug!("{} dynamic token(s) referenced without a query source", queries.len());
            return;
        };
        let resolved = resolve_batch(source.as_ref(), &queries, Utc::now()).await;
        scope.tokens.extend(resolved);
    }
}

fn normalise_keys(tokens: TokenMap) -> TokenMap {
    tokens
        .into_iter()
        .map(|(key, value)| match DynamicQuery::parse(&key) {
            Some(query) => (query.key(), value),
            None => (key.trim().to_string(), value),
        })
        .collect()
}

fn collect_strings<F: FnMut(&str)>(value: &Value, visit: &mut F) {
    match value {
        Value::String(s) => visit(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, visit)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, visit)),
        _ => {}
    }
}

struct Scope<'a> {
    context: &'a Value,
    tokens: TokenMap,
    system: HashMap<String, Value>,
    templates: HashMap<String, String>,
    max_depth: usize,
}

impl Scope<'_> {
    fn may_reference_template(&self, name: &str) -> bool {
        !name.contains('.')
            && DynamicQuery::parse(name).is_none()
            && !self.tokens.contains_key(name)
            && self.context.get(name).is_none()
            && !(is_upper_identifier(name) && self.system.contains_key(name))
    }

    fn render_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.render_string(s),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.render_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn render_string(&self, input: &str) -> Value {
        if let Some(name) = whole_token(input) {
            if let Some(value) = self.lookup(&name, 0) {
                return value;
            }
        }
        Value::String(self.render_text(input, 0))
    }

    fn lookup(&self, name: &str, depth: usize) -> Option<Value> {
        if let Some(query) = DynamicQuery::parse(name) {
            return self.tokens.get(&query.key()).cloned();
        }
        if let Some(value) = self.tokens.get(name) {
            return Some(value.clone());
        }
        if name.contains('.') {
            return Some(
                resolve_path(self.context, name)
                    .cloned()
                    .unwrap_or_else(|| Value::String(String::new())),
            );
        }
        if let Some(value) = self.context.get(name) {
            return Some(value.clone());
        }
        if is_upper_identifier(name) {
            if let Some(value) = self.system.get(name) {
                return Some(value.clone());
            }
        }
        self.templates
            .get(name)
            .map(|content| Value::String(self.render_text(content, depth + 1)))
    }

    fn render_text(&self, input: &str, depth: usize) -> String {
        if depth > self.max_depth {
            return input.to_string();
        }

        let mut out = String::with_capacity(input.len());
        for segment in scan(input) {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Expr {
                    expr: Expr::Token(name),
                    raw,
                } => match self.lookup(&name, depth) {
                    Some(value) => out.push_str(&stringify(&value)),
                    None => out.push_str(raw),
                },
                Segment::Expr {
                    expr: Expr::Conditional(cond),
                    ..
                } => {
                    let branch =
                        cond.select(|n| self.lookup(n, depth).unwrap_or(Value::Null));
                    let text = match branch {
                        None => String::new(),
                        Some(Operand::Literal(value)) => stringify(value),
                        Some(Operand::Token(name)) => self
                            .lookup(name, depth)
                            .map(|v| stringify(&v))
                            .unwrap_or_else(|| name.clone()),
                    };
                    out.push_str(&self.render_text(&text, depth + 1));
                }
                Segment::Expr {
                    expr: Expr::Invalid,
                    raw,
                } => out.push_str(raw),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::dynamic::{AssetRecord, MemoryDynamicQuerySource};
    use crate::template::source::MemoryTemplateSource;
    use serde_json::json;

    fn engine_with_templates(entries: &[(&str, &str)]) -> TemplateEngine {
        let mut source = MemoryTemplateSource::default();
        for (slug, content) in entries {
            source.insert(slug, content);
        }
        TemplateEngine::new().with_templates(Arc::new(source))
    }

    #[tokio::test]
    async fn test_conditional_with_token_map_and_path() {
        let engine = TemplateEngine::new();
        let context = json!({"ticket": {"number": "TKT-7", "subject": "S"}});
        let mut tokens = TokenMap::new();
        tokens.insert("count:asset:av".to_string(), json!("0"));
        let input = json!("{{if count:asset:av > 0 then list:asset:av else \"none\"}} / {{ticket.number}}");

        let rendered = engine.render_with_tokens(&input, &context, tokens).await;
        assert_eq!(rendered, json!("none / TKT-7"));
    }

    #[tokio::test]
    async fn test_whole_token_keeps_native_type() {
        let engine = TemplateEngine::new();
        let context = json!({"ticket": {"id": 42, "closed": false, "labels": ["a"]}});
        let input = json!({
            "id": "{{ ticket.id }}",
            "closed": "{{ticket.closed}}",
            "labels": "{{ticket.labels}}",
            "summary": "#{{ticket.id}} {{ticket.labels}}"
        });
        let rendered = engine.render(&input, &context).await;
        assert_eq!(rendered["id"], json!(42));
        assert_eq!(rendered["closed"], json!(false));
        assert_eq!(rendered["labels"], json!(["a"]));
        assert_eq!(rendered["summary"], json!("#42 [\"a\"]"));
    }

    #[tokio::test]
    async fn test_non_ascii_tokens_render_without_panicking() {
        let engine = TemplateEngine::new();
        let context = json!({"café": "open", "ticket": {"subject": "Imprimante cassée"}});
        assert_eq!(engine.render_str("Hi {{né}}", &context).await, "Hi {{né}}");
        assert_eq!(engine.render_str("{{日本}} / {{ é }}", &context).await, "{{日本}} / {{ é }}");
        assert_eq!(
            engine.render_str("{{café}}: {{ticket.subject}}", &context).await,
            "open: Imprimante cassée"
        );
    }

    #[tokio::test]
    async fn test_container_key_order_preserved() {
        let engine = TemplateEngine::new();
        let input = json!({"z": "{{a}}", "a": ["{{b}}", 1], "m": ""});
        let rendered = engine.render(&input, &json!({"a": "x", "b": "y"})).await;
        let keys: Vec<&String> = rendered.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
        assert_eq!(rendered["a"], json!(["y", 1]));
        assert_eq!(rendered["m"], json!(""));
    }

    #[tokio::test]
    async fn test_missing_path_segment_is_empty_and_unknown_token_is_kept() {
        let engine = TemplateEngine::new();
        let context = json!({"ticket": {}});
        assert_eq!(
            engine.render_str("[{{ticket.requester.email}}]", &context).await,
            "[]"
        );
        assert_eq!(engine.render_str("Hi {{nobody}}", &context).await, "Hi {{nobody}}");
    }

    #[tokio::test]
    async fn test_system_tokens_resolve_uppercase_names() {
        let engine = TemplateEngine::new();
        let context = json!({"ticket": {"subject": "Printer down"}});
        assert_eq!(
            engine.render_str("Subject: {{TICKET_SUBJECT}}", &context).await,
            "Subject: Printer down"
        );
    }

    #[tokio::test]
    async fn test_template_references_by_slug_and_mangled_name() {
        let engine = engine_with_templates(&[
            ("email-signature", "-- {{agent}}"),
            ("footer", "{{EMAIL_SIGNATURE}} / {{company}}"),
        ]);
        let context = json!({"agent": "Dana", "company": "Acme"});
        assert_eq!(
            engine.render_str("Bye {{email-signature}}", &context).await,
            "Bye -- Dana"
        );
        assert_eq!(
            engine.render_str("{{footer}}!", &context).await,
            "-- Dana / Acme!"
        );
    }

    #[tokio::test]
    async fn test_self_referencing_template_terminates() {
        let engine = engine_with_templates(&[("loop", "x{{loop}}")]).with_max_depth(3);
        let rendered = engine.render_str("{{loop}}", &json!({})).await;
        assert!(rendered.starts_with("xxx"));
    }

    #[tokio::test]
    async fn test_template_expansion_can_be_disabled() {
        let engine = engine_with_templates(&[("sig", "S")]).without_template_expansion();
        assert_eq!(engine.render_str("{{sig}}", &json!({})).await, "{{sig}}");
    }

    #[tokio::test]
    async fn test_dynamic_tokens_inside_branches() {
        let source = MemoryDynamicQuerySource {
            assets: vec![AssetRecord {
                name: "PC-01".into(),
                is_active: true,
                last_seen_at: Some(Utc::now()),
                custom_fields: json!({"av": true}),
                issues: vec![],
            }],
        };
        let engine = TemplateEngine::new().with_dynamic_queries(Arc::new(source));
        let input = "{{IF COUNT:asset:av > 0 then list:asset:av else 'none'}} ({{ACTIVE_ASSETS:0}})";
        assert_eq!(engine.render_str(input, &json!({})).await, "PC-01 (0)");
    }

    #[tokio::test]
    async fn test_conditional_false_without_else_is_empty() {
        let engine = TemplateEngine::new();
        let context = json!({"flag": ""});
        assert_eq!(
            engine.render_str("a{{if flag then 'yes'}}b", &context).await,
            "ab"
        );
    }

    #[tokio::test]
    async fn test_branch_text_is_rendered() {
        let engine = TemplateEngine::new();
        let context = json!({"vip": true, "name": "Ana"});
        assert_eq!(
            engine
                .render_str("{{if vip then 'Dear {{name}}' else 'Hi'}}", &context)
                .await,
            "Dear Ana"
        );
    }
}
