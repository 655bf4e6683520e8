//! JMESPath expression compilation/evaluation and `{{ }}` templating.
//!
//! Compiled expressions are memoized in a process-wide, read-write-locked
//! map keyed by source text (mirrors the `RwLock<Vec<CachedKey>>`
//! integration-key cache pattern, generalized from a `Vec` to a map), since
//! the same handful of expressions in a plan definition are evaluated on
//! every step attempt and every fanout item.

pub mod template;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use jmespath::Variable;
use serde_json::Value;

pub use template::Templater;

/// A compiled JMESPath expression, tied to the crate's default runtime.
type CompiledExpr = jmespath::Expression<'static>;

/// Errors surfaced by expression compilation, evaluation, or coercion.
#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("invalid expression syntax: {0}")]
    Syntax(String),
    #[error("expression evaluation failed: {0}")]
    Evaluation(String),
    #[error("failed to convert value for expression evaluation: {0}")]
    Conversion(String),
}

/// Process-wide cache of compiled expressions, shared via `Arc` across
/// every Step Executor invocation.
#[derive(Debug, Clone, Default)]
pub struct ExpressionCache {
    inner: Arc<RwLock<HashMap<String, CompiledExpr>>>,
}

impl ExpressionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `expr` (or return the cached compilation) and run it against
    /// `data`, returning the result as a `serde_json::Value`.
    ///
    /// A missing key anywhere in the expression path resolves to JSON
    /// `null` rather than an error -- jmespath's own semantics -- so only
    /// genuine syntax/evaluation failures surface as `Err`.
    pub fn evaluate(&self, expr: &str, data: &Value) -> Result<Value, ExprError> {
        let compiled = self.get_or_compile(expr)?;
        let input = Variable::from_serializable(data)
            .map_err(|e| ExprError::Conversion(e.to_string()))?;
        let result = compiled
            .search(input)
            .map_err(|e| ExprError::Evaluation(e.to_string()))?;
        serde_json::to_value(&*result).map_err(|e| ExprError::Conversion(e.to_string()))
    }

    fn get_or_compile(&self, expr: &str) -> Result<CompiledExpr, ExprError> {
        if let Some(found) = self.inner.read().expect("expression cache poisoned").get(expr) {
            return Ok(found.clone());
        }

        let compiled = jmespath::compile(expr).map_err(|e| ExprError::Syntax(e.to_string()))?;
        self.inner
            .write()
            .expect("expression cache poisoned")
            .insert(expr.to_owned(), compiled.clone());
        Ok(compiled)
    }
}

/// Coerce a JSON value to a string: `null` coerces to the
/// empty string; non-string scalars render to their canonical text form;
/// arrays/objects render as their JSON text.
pub fn as_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Coerce a JSON value to bool: empty string, zero
/// number, empty array/object, and `null` are falsy; everything else is
/// truthy.
pub fn as_bool(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Coerce a JSON value to `i64`, per the zero-value rule: `null` or a
/// non-numeric value coerces to `0`.
pub fn as_i64(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Value::String(s) => s.parse().unwrap_or(0),
        Value::Bool(b) => i64::from(*b),
        _ => 0,
    }
}

/// Coerce a JSON value to an array; `null` and scalars coerce to the
/// empty sequence.
pub fn as_array(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(a) => a.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

/// Coerce a JSON value to an object map; `null` and non-objects coerce to
/// the empty map.
pub fn as_object(value: &Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(o) => o.clone(),
        _ => serde_json::Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn evaluate_simple_field() {
        let cache = ExpressionCache::new();
        let data = json!({"a": {"b": 2}});
        let result = cache.evaluate("a.b", &data).unwrap();
        assert_eq!(result, json!(2));
    }

    #[test]
    fn evaluate_missing_key_resolves_null() {
        let cache = ExpressionCache::new();
        let data = json!({"a": 1});
        let result = cache.evaluate("nonexistent.path", &data).unwrap();
        assert_eq!(result, Value::Null);
    }

    #[test]
    fn evaluate_length_function() {
        let cache = ExpressionCache::new();
        let data = json!({"response": {"body": [{"id": 1}, {"id": 2}]}});
        let result = cache.evaluate("length(response.body)", &data).unwrap();
        assert_eq!(result, json!(2));
    }

    #[test]
    fn invalid_syntax_errors() {
        let cache = ExpressionCache::new();
        let data = json!({});
        let result = cache.evaluate("a[?b==`c`", &data);
        assert!(matches!(result, Err(ExprError::Syntax(_))));
    }

    #[test]
    fn repeated_evaluation_hits_cache() {
        let cache = ExpressionCache::new();
        let data = json!({"x": 1});
        assert_eq!(cache.evaluate("x", &data).unwrap(), json!(1));
        assert_eq!(cache.evaluate("x", &data).unwrap(), json!(1));
        assert_eq!(cache.inner.read().unwrap().len(), 1);
    }

    #[test]
    fn string_coercion_rules() {
        assert_eq!(as_string(&Value::Null), "");
        assert_eq!(as_string(&json!(42)), "42");
        assert_eq!(as_string(&json!(true)), "true");
        assert_eq!(as_string(&json!("hi")), "hi");
    }

    #[test]
    fn bool_coercion_rules() {
        assert!(!as_bool(&Value::Null));
        assert!(!as_bool(&json!("")));
        assert!(!as_bool(&json!(0)));
        assert!(!as_bool(&json!([])));
        assert!(!as_bool(&json!({})));
        assert!(as_bool(&json!("x")));
        assert!(as_bool(&json!(1)));
        assert!(as_bool(&json!([1])));
    }

    #[test]
    fn int_coercion_rules() {
        assert_eq!(as_i64(&Value::Null), 0);
        assert_eq!(as_i64(&json!("42")), 42);
        assert_eq!(as_i64(&json!("not a number")), 0);
        assert_eq!(as_i64(&json!(3.9)), 3);
    }

    #[test]
    fn array_and_object_coercion_rules() {
        assert_eq!(as_array(&Value::Null), Vec::<Value>::new());
        assert_eq!(as_array(&json!([1, 2])), vec![json!(1), json!(2)]);
        assert_eq!(as_array(&json!(5)), vec![json!(5)]);

        assert!(as_object(&Value::Null).is_empty());
        assert_eq!(as_object(&json!({"a": 1})).get("a"), Some(&json!(1)));
    }
}
