//! Jinja2-style template rendering using minijinja.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use minijinja::{value::ValueKind, Environment, Error, ErrorKind, Value};
use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};

/// Template renderer with custom filters and context.
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    /// Create a new template renderer with custom filters.
    pub fn new() -> Self {
        let mut env = Environment::new();

        env.add_filter("b64encode", filter_b64encode);
        env.add_filter("b64decode", filter_b64decode);
        env.add_filter("tojson", filter_tojson);
        env.add_filter("fromjson", filter_fromjson);
        env.add_filter("default", filter_default);
        env.add_filter("lower", filter_lower);
        env.add_filter("upper", filter_upper);
        env.add_filter("trim", filter_trim);
        env.add_filter("join", filter_join);
        env.add_filter("length", filter_length);

        env.add_test("defined", test_defined);
        env.add_test("undefined", test_undefined);
        env.add_test("none", test_none);

        Self { env }
    }

    /// Render a template string with the given context.
    pub fn render(
        &self,
        template: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> EngineResult<String> {
        // Quick check for non-template strings
        if !contains_template_syntax(template) {
            return Ok(template.to_string());
        }

        let ctx = json_to_value(context);

        let tmpl = self
            .env
            .template_from_str(template)
            .map_err(|e| EngineError::Template(format!("Template parse error: {}", e)))?;

        tmpl.render(ctx)
            .map_err(|e| EngineError::Template(format!("Template render error: {}", e)))
    }

    /// Render a template and return the result as a JSON value.
    ///
    /// Attempts to parse the rendered string as JSON if it looks like JSON,
    /// then as a primitive, falling back to a plain string.
    pub fn render_to_value(
        &self,
        template: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> EngineResult<serde_json::Value> {
        let rendered = self.render(template, context)?;

        let trimmed = rendered.trim();
        if (trimmed.starts_with('{') && trimmed.ends_with('}'))
            || (trimmed.starts_with('[') && trimmed.ends_with(']'))
        {
            if let Ok(value) = serde_json::from_str(trimmed) {
                return Ok(value);
            }
        }

        if let Ok(b) = trimmed.parse::<bool>() {
            return Ok(serde_json::Value::Bool(b));
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Ok(serde_json::Value::Number(i.into()));
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return Ok(serde_json::Value::Number(n));
            }
        }
        if trimmed == "null" || trimmed == "none" || trimmed.is_empty() {
            return Ok(serde_json::Value::Null);
        }

        Ok(serde_json::Value::String(rendered))
    }

    /// Render a nested structure (dict or list) recursively.
    pub fn render_value(
        &self,
        value: &serde_json::Value,
        context: &HashMap<String, serde_json::Value>,
    ) -> EngineResult<serde_json::Value> {
        match value {
            serde_json::Value::String(s) => self.render_to_value(s, context),
            serde_json::Value::Object(map) => {
                let mut result = serde_json::Map::new();
                for (k, v) in map {
                    result.insert(self.render(k, context)?, self.render_value(v, context)?);
                }
                Ok(serde_json::Value::Object(result))
            }
            serde_json::Value::Array(arr) => {
                let result: Result<Vec<_>, _> =
                    arr.iter().map(|v| self.render_value(v, context)).collect();
                Ok(serde_json::Value::Array(result?))
            }
            _ => Ok(value.clone()),
        }
    }

    /// Evaluate a condition expression.
    ///
    /// Boolean coercion: "true", "1" and "yes" are truthy, everything else
    /// is falsy.
    pub fn evaluate_condition(
        &self,
        condition: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> EngineResult<bool> {
        // Wrap bare expressions in {{ }}
        let template = if contains_template_syntax(condition) {
            condition.to_string()
        } else {
            format!("{{{{ {} }}}}", condition)
        };

        let rendered = self.render(&template, context)?;
        let trimmed = rendered.trim().to_lowercase();

        Ok(matches!(trimmed.as_str(), "true" | "1" | "yes"))
    }
}

/// Check if a string contains Jinja2 template syntax.
fn contains_template_syntax(s: &str) -> bool {
    (s.contains("{{") && s.contains("}}")) || (s.contains("{%") && s.contains("%}"))
}

/// Convert a JSON HashMap to a minijinja Value.
fn json_to_value(json: &HashMap<String, serde_json::Value>) -> Value {
    let converted: HashMap<String, Value> = json
        .iter()
        .map(|(k, v)| (k.clone(), json_value_to_minijinja(v)))
        .collect();
    Value::from_object(converted)
}

/// Convert a serde_json::Value to a minijinja Value.
fn json_value_to_minijinja(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::UNDEFINED,
        serde_json::Value::Bool(b) => Value::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(f) = n.as_f64() {
                Value::from(f)
            } else {
                Value::UNDEFINED
            }
        }
        serde_json::Value::String(s) => Value::from(s.as_str()),
        serde_json::Value::Array(arr) => {
            let items: Vec<Value> = arr.iter().map(json_value_to_minijinja).collect();
            Value::from(items)
        }
        serde_json::Value::Object(map) => {
            let items: HashMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), json_value_to_minijinja(v)))
                .collect();
            Value::from_object(items)
        }
    }
}

/// Convert a minijinja Value back to serde_json::Value.
fn minijinja_to_json(value: &Value) -> serde_json::Value {
    if value.is_undefined() || value.is_none() {
        return serde_json::Value::Null;
    }
    if value.kind() == ValueKind::Bool {
        return serde_json::Value::Bool(value.is_true());
    }
    if let Some(i) = value.as_i64() {
        return serde_json::Value::Number(i.into());
    }
    if let Some(s) = value.as_str() {
        return serde_json::Value::String(s.to_string());
    }
    if value.kind() == ValueKind::Seq {
        if let Ok(iter) = value.try_iter() {
            let arr: Vec<serde_json::Value> = iter.map(|v| minijinja_to_json(&v)).collect();
            return serde_json::Value::Array(arr);
        }
    }
    if value.kind() == ValueKind::Map {
        let mut map = serde_json::Map::new();
        if let Ok(iter) = value.try_iter() {
            for key in iter {
                if let Ok(val) = value.get_item(&key) {
                    map.insert(key.to_string(), minijinja_to_json(&val));
                }
            }
        }
        return serde_json::Value::Object(map);
    }
    serde_json::Value::String(value.to_string())
}

// ============================================================================
// Custom Filters
// ============================================================================

fn filter_b64encode(value: &Value) -> Result<String, Error> {
    Ok(BASE64.encode(value.to_string().as_bytes()))
}

fn filter_b64decode(value: &Value) -> Result<String, Error> {
    let decoded = BASE64.decode(value.to_string().as_bytes()).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("b64decode error: {}", e),
        )
    })?;
    String::from_utf8(decoded)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("utf8 error: {}", e)))
}

fn filter_tojson(value: &Value) -> Result<String, Error> {
    serde_json::to_string(&minijinja_to_json(value))
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("tojson error: {}", e)))
}

fn filter_fromjson(value: &Value) -> Result<Value, Error> {
    let json_val: serde_json::Value = serde_json::from_str(&value.to_string()).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("fromjson error: {}", e),
        )
    })?;
    Ok(json_value_to_minijinja(&json_val))
}

fn filter_default(value: &Value, default: Option<&Value>) -> Value {
    if value.is_undefined() || value.is_none() {
        default.cloned().unwrap_or(Value::from(""))
    } else {
        value.clone()
    }
}

fn filter_lower(value: &Value) -> String {
    value.to_string().to_lowercase()
}

fn filter_upper(value: &Value) -> String {
    value.to_string().to_uppercase()
}

fn filter_trim(value: &Value) -> String {
    value.to_string().trim().to_string()
}

fn filter_join(value: &Value, sep: Option<&Value>) -> Result<String, Error> {
    let separator = sep.map(|v| v.to_string()).unwrap_or_default();
    let iter = value
        .try_iter()
        .map_err(|_| Error::new(ErrorKind::InvalidOperation, "join requires a sequence"))?;
    let items: Vec<String> = iter.map(|v| v.to_string()).collect();
    Ok(items.join(&separator))
}

fn filter_length(value: &Value) -> Result<usize, Error> {
    if let Some(s) = value.as_str() {
        return Ok(s.len());
    }
    if let Some(len) = value.len() {
        return Ok(len);
    }
    Err(Error::new(
        ErrorKind::InvalidOperation,
        "length requires string, sequence, or mapping",
    ))
}

// ============================================================================
// Custom Tests
// ============================================================================

fn test_defined(value: &Value) -> bool {
    !value.is_undefined()
}

fn test_undefined(value: &Value) -> bool {
    value.is_undefined()
}

fn test_none(value: &Value) -> bool {
    value.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_context() -> HashMap<String, serde_json::Value> {
        let mut ctx = HashMap::new();
        ctx.insert("branch".to_string(), serde_json::json!("fast"));
        ctx.insert("count".to_string(), serde_json::json!(4));
        ctx.insert(
            "items".to_string(),
            serde_json::json!(["alpha", "beta", "gamma"]),
        );
        ctx.insert(
            "outputs".to_string(),
            serde_json::json!({"probe": {"status": 200}}),
        );
        ctx
    }

    #[test]
    fn test_simple_variable() {
        let renderer = TemplateRenderer::new();
        let result = renderer.render("branch={{ branch }}", &make_context()).unwrap();
        assert_eq!(result, "branch=fast");
    }

    #[test]
    fn test_plain_string_is_untouched() {
        let renderer = TemplateRenderer::new();
        let result = renderer.render("no templates here", &make_context()).unwrap();
        assert_eq!(result, "no templates here");
    }

    #[test]
    fn test_nested_lookup() {
        let renderer = TemplateRenderer::new();
        let result = renderer
            .render("{{ outputs.probe.status }}", &make_context())
            .unwrap();
        assert_eq!(result, "200");
    }

    #[test]
    fn test_b64_roundtrip() {
        let renderer = TemplateRenderer::new();
        let ctx = make_context();
        let encoded = renderer.render("{{ branch | b64encode }}", &ctx).unwrap();
        assert_eq!(encoded, "ZmFzdA==");
    }

    #[test]
    fn test_default_filter() {
        let renderer = TemplateRenderer::new();
        let result = renderer
            .render("{{ missing | default('fallback') }}", &make_context())
            .unwrap();
        assert_eq!(result, "fallback");
    }

    #[test]
    fn test_join_and_length() {
        let renderer = TemplateRenderer::new();
        let ctx = make_context();
        assert_eq!(
            renderer.render("{{ items | join(',') }}", &ctx).unwrap(),
            "alpha,beta,gamma"
        );
        assert_eq!(renderer.render("{{ items | length }}", &ctx).unwrap(), "3");
    }

    #[test]
    fn test_evaluate_condition() {
        let renderer = TemplateRenderer::new();
        let ctx = make_context();
        assert!(renderer.evaluate_condition("count > 3", &ctx).unwrap());
        assert!(!renderer.evaluate_condition("count > 10", &ctx).unwrap());
        assert!(renderer
            .evaluate_condition("branch == 'fast'", &ctx)
            .unwrap());
    }

    #[test]
    fn test_render_to_value_list() {
        let renderer = TemplateRenderer::new();
        let result = renderer
            .render_to_value("{{ items | tojson }}", &make_context())
            .unwrap();
        assert_eq!(result, serde_json::json!(["alpha", "beta", "gamma"]));
    }

    #[test]
    fn test_render_to_value_number() {
        let renderer = TemplateRenderer::new();
        let result = renderer
            .render_to_value("{{ count }}", &make_context())
            .unwrap();
        assert_eq!(result, serde_json::json!(4));
    }

    #[test]
    fn test_render_value_nested() {
        let renderer = TemplateRenderer::new();
        let value = serde_json::json!({
            "target": "{{ branch }}",
            "meta": {"total": "{{ count }}"}
        });
        let result = renderer.render_value(&value, &make_context()).unwrap();
        assert_eq!(result["target"], "fast");
        assert_eq!(result["meta"]["total"], 4);
    }

    #[test]
    fn test_template_error_surfaces() {
        let renderer = TemplateRenderer::new();
        let err = renderer
            .render("{{ items | nosuchfilter }}", &make_context())
            .unwrap_err();
        assert!(matches!(err, EngineError::Template(_)));
    }
}
