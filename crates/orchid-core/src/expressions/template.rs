//! `{{ expr }}` template rendering over strings and `serde_json::Value`
//! trees.
//!
//! The scanner is hand-rolled rather than regex-based: JMESPath multi-select
//! hash syntax (`{name: foo}`) and backtick literals can themselves contain
//! `{`/`}`, so matching the outer `{{ ... }}` pair requires brace-depth
//! tracking with backtick-literal awareness, not a greedy/lazy regex.

use serde_json::Value;

use super::{as_string, ExpressionCache, ExprError};

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("failed to render expression `{0}`: {1}")]
    Render(String, String),
}

/// Renders `{{ }}` template occurrences by delegating expression
/// evaluation to a shared [`ExpressionCache`].
#[derive(Debug, Clone, Default)]
pub struct Templater {
    cache: ExpressionCache,
}

impl Templater {
    pub fn new(cache: ExpressionCache) -> Self {
        Self { cache }
    }

    /// The underlying expression cache, for callers that need to evaluate
    /// a bare JMESPath expression rather than render a `{{ }}` template.
    pub fn cache(&self) -> &ExpressionCache {
        &self.cache
    }

    /// Replace every `{{ expr }}` occurrence in `text` with the
    /// canonical-text form of `expr` evaluated against `data`.
    ///
    /// A failing occurrence does not abort the render: it is substituted
    /// with the empty string and the *last* error encountered is returned
    /// alongside the best-effort output. Callers treat
    /// any returned error as step failure.
    pub fn render(&self, text: &str, data: &Value) -> (String, Option<TemplateError>) {
        let occurrences = scan_templates(text);
        if occurrences.is_empty() {
            return (text.to_owned(), None);
        }

        let mut output = String::with_capacity(text.len());
        let mut last_end = 0;
        let mut last_error = None;

        for (start, end, expr) in occurrences {
            output.push_str(&text[last_end..start]);
            match self.cache.evaluate(&expr, data) {
                Ok(value) => output.push_str(&as_string(&value)),
                Err(e) => {
                    last_error = Some(render_error(&expr, e));
                }
            }
            last_end = end;
        }
        output.push_str(&text[last_end..]);

        (output, last_error)
    }

    /// Recursively render every string leaf in a JSON value tree,
    /// preserving map keys and sequence length/order.
    pub fn render_value(&self, value: &Value, data: &Value) -> (Value, Option<TemplateError>) {
        let mut last_error = None;
        let rendered = self.render_value_inner(value, data, &mut last_error);
        (rendered, last_error)
    }

    fn render_value_inner(
        &self,
        value: &Value,
        data: &Value,
        last_error: &mut Option<TemplateError>,
    ) -> Value {
        match value {
            Value::String(s) => {
                let (rendered, err) = self.render(s, data);
                if err.is_some() {
                    *last_error = err;
                }
                Value::String(rendered)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.render_value_inner(item, data, last_error))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render_value_inner(v, data, last_error)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

fn render_error(expr: &str, cause: ExprError) -> TemplateError {
    TemplateError::Render(expr.to_owned(), cause.to_string())
}

/// Find every top-level `{{ ... }}` occurrence in `text`, returning
/// `(match_start, match_end, trimmed_expr)` byte ranges. `match_end` is
/// exclusive of the final `}}`.
fn scan_templates(text: &str) -> Vec<(usize, usize, String)> {
    let bytes = text.as_bytes();
    let mut occurrences = Vec::new();
    let mut i = 0;

    while i + 1 < bytes.len() {
        if bytes[i] == b'{' && bytes[i + 1] == b'{' {
            let start = i;
            let mut depth: i32 = 2;
            let mut in_backtick = false;
            let mut j = i + 2;
            let mut closed_at = None;

            while j < bytes.len() {
                let c = bytes[j];
                if in_backtick {
                    if c == b'`' {
                        in_backtick = false;
                    }
                } else {
                    match c {
                        b'`' => in_backtick = true,
                        b'{' => depth += 1,
                        b'}' => {
                            depth -= 1;
                            if depth == 0 {
                                closed_at = Some(j);
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                j += 1;
            }

            match closed_at {
                Some(end) => {
                    let expr = text[start + 2..end - 1].trim().to_owned();
                    occurrences.push((start, end + 1, expr));
                    i = end + 1;
                }
                None => {
                    // Unterminated `{{`: leave the rest of the text untouched.
                    break;
                }
            }
        } else {
            i += 1;
        }
    }

    occurrences
}
