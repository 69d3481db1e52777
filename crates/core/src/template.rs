//! Data-driven `{{ path }}` templating over a JSON scope.
//!
//! The grammar is deliberately small: dotted paths resolved against a
//! JSON tree, no expressions, no dynamic evaluation. Missing paths
//! render as the empty string, which keeps expansion total and
//! deterministic. A value that consists of exactly one template
//! resolves to the referenced JSON value so collections and objects
//! survive expansion intact.

use serde_json::Value;

/// JSON tree a template is resolved against.
#[derive(Debug, Clone, Default)]
pub struct TemplateScope {
    root: Value,
}

impl TemplateScope {
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Resolve a dotted path. A leading `$.` or `$` (JSONPath-style
    /// anchors used by trigger predicates) is accepted and ignored.
    /// Numeric segments index into arrays.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        let path = path.strip_prefix("$.").unwrap_or(path);
        let path = if path == "$" { "" } else { path };
        if path.is_empty() {
            return Some(&self.root);
        }

        let mut current = &self.root;
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => {
                    let index: usize = segment.parse().ok()?;
                    items.get(index)?
                }
                _ => return None,
            };
        }
        Some(current)
    }
}

/// Render a resolved value for string interpolation.
fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// If the input is exactly one `{{ ... }}` template, return the inner path.
pub fn single_template(input: &str) -> Option<&str> {
    let trimmed = input.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    // A second opening brace means the input holds more than one template.
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// Expand every `{{ path }}` occurrence in a string. Missing paths
/// render as the empty string.
pub fn expand_string(input: &str, scope: &TemplateScope) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        match after_open.find("}}") {
            Some(close) => {
                let path = after_open[..close].trim();
                if let Some(value) = scope.lookup(path) {
                    out.push_str(&render(value));
                }
                rest = &after_open[close + 2..];
            }
            None => {
                // Unterminated template; keep the remainder verbatim.
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Expand a JSON value recursively. Strings that are exactly one
/// template resolve to the referenced JSON value; all other strings
/// are interpolated.
pub fn expand_value(value: &Value, scope: &TemplateScope) -> Value {
    match value {
        Value::String(s) => match single_template(s) {
            Some(path) => scope
                .lookup(path)
                .cloned()
                .unwrap_or(Value::String(String::new())),
            None => Value::String(expand_string(s, scope)),
        },
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| expand_value(v, scope)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), expand_value(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> TemplateScope {
        TemplateScope::new(json!({
            "parameters": {"tenant": "acme", "limit": 25},
            "steps": {
                "seed": {"result": {"items": [{"id": "alpha"}, {"id": "beta"}]}}
            },
            "shared": {"report": {"ok": true}},
            "run": {"partitionKey": "2025-10-21T14:40"}
        }))
    }

    #[test]
    fn interpolates_dotted_paths() {
        let out = expand_string("tenant={{ parameters.tenant }} limit={{ parameters.limit }}", &scope());
        assert_eq!(out, "tenant=acme limit=25");
    }

    #[test]
    fn missing_paths_render_empty() {
        let out = expand_string("[{{ parameters.absent }}]", &scope());
        assert_eq!(out, "[]");
    }

    #[test]
    fn whole_value_template_keeps_json_shape() {
        let value = json!({"items": "{{ steps.seed.result.items }}", "label": "run {{ run.partitionKey }}"});
        let expanded = expand_value(&value, &scope());
        assert_eq!(expanded["items"].as_array().unwrap().len(), 2);
        assert_eq!(expanded["label"], "run 2025-10-21T14:40");
    }

    #[test]
    fn array_index_segments_resolve() {
        let s = scope();
        assert_eq!(s.lookup("steps.seed.result.items.1.id"), Some(&json!("beta")));
        assert_eq!(s.lookup("steps.seed.result.items.7"), None);
    }

    #[test]
    fn jsonpath_anchor_is_accepted() {
        let s = scope();
        assert_eq!(s.lookup("$.shared.report.ok"), Some(&json!(true)));
        assert!(s.lookup("$").is_some());
    }

    #[test]
    fn single_template_detection() {
        assert_eq!(single_template("{{ steps.a.result }}"), Some("steps.a.result"));
        assert_eq!(single_template("x {{ steps.a.result }}"), None);
        assert_eq!(single_template("{{ a }}{{ b }}"), None);
    }

    #[test]
    fn unterminated_template_is_preserved() {
        let out = expand_string("before {{ parameters.tenant", &scope());
        assert_eq!(out, "before {{ parameters.tenant");
    }
}
