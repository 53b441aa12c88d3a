//! Expression/template evaluation contract (spec.md §4.G, §1 "Out of
//! scope": specified only by its input/output contract).
//!
//! `evaluate_condition` and `expand_template` must be pure functions of
//! `(expr_or_template, scope)`. Any non-determinism they'd otherwise
//! introduce (`now()`, `random()`) is expected to be routed through
//! operations that record `time_accessed`/`random_generated` upstream of
//! the call, so the scope handed in here is already deterministic.

use serde::Serialize;

/// Error evaluating a template or condition expression.
#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("template error: {0}")]
    Template(String),

    #[error("condition error: {0}")]
    Condition(String),
}

/// Collaborator interface for prompt/condition interpolation.
pub trait ExpressionEvaluator: Send + Sync {
    fn expand_template(&self, template: &str, scope: &serde_json::Value) -> Result<String, ExprError>;
    fn evaluate_condition(&self, expr: &str, scope: &serde_json::Value) -> Result<bool, ExprError>;

    /// Evaluate `expr` (not a template string — a bare expression) against
    /// `scope` and return its value as JSON. Used by the `each` step to
    /// resolve the list it iterates over.
    fn evaluate_value(&self, expr: &str, scope: &serde_json::Value) -> Result<serde_json::Value, ExprError>;
}

/// Default implementation backed by `minijinja`, resolving `${…}` /
/// `{{ … }}` style interpolation against a JSON scope object.
#[derive(Debug, Default)]
pub struct MinijinjaEvaluator;

impl MinijinjaEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn context(scope: &serde_json::Value) -> minijinja::Value {
        minijinja::Value::from_serialize(&Wrapper(scope))
    }
}

struct Wrapper<'a>(&'a serde_json::Value);

impl<'a> Serialize for Wrapper<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl ExpressionEvaluator for MinijinjaEvaluator {
    fn expand_template(&self, template: &str, scope: &serde_json::Value) -> Result<String, ExprError> {
        let env = minijinja::Environment::new();
        // The spec's `${…}` placeholders are treated as `{{ … }}` for the
        // underlying engine; callers author templates in `${name}` form.
        let normalized = normalize_placeholders(template);
        env.render_str(&normalized, Self::context(scope))
            .map_err(|e| ExprError::Template(e.to_string()))
    }

    fn evaluate_condition(&self, expr: &str, scope: &serde_json::Value) -> Result<bool, ExprError> {
        let env = minijinja::Environment::new();
        let compiled = env
            .compile_expression(expr)
            .map_err(|e| ExprError::Condition(e.to_string()))?;
        let value = compiled
            .eval(Self::context(scope))
            .map_err(|e| ExprError::Condition(e.to_string()))?;
        Ok(value.is_true())
    }

    fn evaluate_value(&self, expr: &str, scope: &serde_json::Value) -> Result<serde_json::Value, ExprError> {
        let env = minijinja::Environment::new();
        let compiled = env
            .compile_expression(expr)
            .map_err(|e| ExprError::Condition(e.to_string()))?;
        let value = compiled
            .eval(Self::context(scope))
            .map_err(|e| ExprError::Condition(e.to_string()))?;
        serde_json::to_value(value).map_err(|e| ExprError::Condition(e.to_string()))
    }
}

/// Rewrites `${expr}` into `{{ expr }}` so both the spec's documented
/// syntax and raw Jinja templates work against the same engine.
fn normalize_placeholders(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c == '$' {
            if let Some(&(_, '{')) = chars.peek() {
                chars.next();
                let mut inner = String::new();
                for (_, c2) in chars.by_ref() {
                    if c2 == '}' {
                        break;
                    }
                    inner.push(c2);
                }
                out.push_str("{{ ");
                out.push_str(inner.trim());
                out.push_str(" }}");
                continue;
            }
        }
        out.push(c);
    }
    out
}
