//! Match-expression and summary-template compilation. Match expressions and `{{ }}` template regions are both
//! compiled with `cel-interpreter`: a sandboxed, statically-typed expression
//! language with no host-escape capability.

use std::sync::{Arc, Mutex};

use cel_interpreter::{Context, Program, Value};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::types::{Link, ResourceRef};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("unknown identifier '{0}' is not declared in this rule kind's environment")]
    UnknownIdentifier(String),
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("match expression error: {0}")]
    Match(String),
    #[error("summary template error: {0}")]
    Template(String),
}

/// A compiled boolean match expression.
#[derive(Clone)]
pub struct CompiledMatch {
    program: Arc<Program>,
    source: String,
}

impl std::fmt::Debug for CompiledMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledMatch").field("source", &self.source).finish()
    }
}

/// A compiled summary template: an ordered sequence of literal text and
/// `{{ expr }}` regions, each pre-compiled as its own CEL program.
#[derive(Clone, Debug)]
pub struct CompiledTemplate {
    segments: Vec<TemplateSegment>,
}

#[derive(Clone)]
enum TemplateSegment {
    Literal(String),
    Expr { program: Arc<Program>, source: String },
}

impl std::fmt::Debug for TemplateSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateSegment::Literal(s) => write!(f, "Literal({s:?})"),
            TemplateSegment::Expr { source, .. } => write!(f, "Expr({source:?})"),
        }
    }
}

/// Declares which record kind a rule environment is typed against: the
/// `match` expression is parsed into an AST typed against a declared
/// environment (`audit` / `event` variable plus a resolved `actor` helper).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleKind {
    Audit,
    Event,
}

impl Default for RuleKind {
    fn default() -> Self {
        RuleKind::Audit
    }
}

impl RuleKind {
    fn record_variable(self) -> &'static str {
        match self {
            RuleKind::Audit => "audit",
            RuleKind::Event => "event",
        }
    }
}

/// Compile a match expression, rejecting references to identifiers outside
/// `{audit|event, actor, link}` at compile time.
pub fn compile_match(source: &str, kind: RuleKind) -> Result<CompiledMatch, CompileError> {
    let program = Program::compile(source).map_err(|e| CompileError::Parse(e.to_string()))?;
    reject_unknown_identifiers(&program, kind)?;
    Ok(CompiledMatch {
        program: Arc::new(program),
        source: source.to_string(),
    })
}

/// Compile a summary template by locating `{{ ... }}` regions; each region
/// must compile as an expression, literal regions are stored verbatim.
pub fn compile_template(source: &str, kind: RuleKind) -> Result<CompiledTemplate, CompileError> {
    let mut segments = Vec::new();
    let mut rest = source;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            segments.push(TemplateSegment::Literal(rest[..open].to_string()));
        }
        let after_open = &rest[open + 2..];
        let close = after_open
            .find("}}")
            .ok_or_else(|| CompileError::Parse("unterminated '{{' interpolation".into()))?;
        let expr_src = after_open[..close].trim().to_string();
        let program =
            Program::compile(&expr_src).map_err(|e| CompileError::Parse(e.to_string()))?;
        reject_unknown_identifiers(&program, kind)?;
        segments.push(TemplateSegment::Expr {
            program: Arc::new(program),
            source: expr_src,
        });
        rest = &after_open[close + 2..];
    }
    if !rest.is_empty() {
        segments.push(TemplateSegment::Literal(rest.to_string()));
    }
    Ok(CompiledTemplate { segments })
}

/// `cel-interpreter` resolves unknown variables lazily at evaluation time
/// rather than at parse time, so unknown identifiers are rejected at compile
/// time by statically walking the compiled program's reference set against
/// the declared environment.
fn reject_unknown_identifiers(program: &Program, kind: RuleKind) -> Result<(), CompileError> {
    let allowed = [kind.record_variable(), "actor", "link"];
    for name in program.references().variables() {
        if !allowed.contains(&name.as_str()) {
            return Err(CompileError::UnknownIdentifier(name.to_string()));
        }
    }
    Ok(())
}

/// Bound-function sink for `link(displayText, resourceRef)` calls made
/// during one evaluation.
#[derive(Default, Clone)]
pub struct LinkSink(Arc<Mutex<Vec<Link>>>);

impl LinkSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_links(self) -> Vec<Link> {
        Arc::try_unwrap(self.0)
            .map(|m| m.into_inner().unwrap_or_default())
            .unwrap_or_else(|arc| arc.lock().unwrap().clone())
    }
}

/// Build the evaluation context for one record: binds the record's JSON
/// projection under `audit`/`event`, the resolved `actor` helper, and the
/// `link(...)` function against `sink`.
pub fn build_context<'a>(
    kind: RuleKind,
    record_json: &JsonValue,
    actor_json: &JsonValue,
    sink: LinkSink,
) -> Result<Context<'a>, EvalError> {
    let mut ctx = Context::default();
    let record_value: Value = record_json
        .clone()
        .try_into()
        .map_err(|e| EvalError::Match(format!("record conversion: {e}")))?;
    ctx.add_variable(kind.record_variable(), record_value)
        .map_err(|e| EvalError::Match(e.to_string()))?;
    let actor_value: Value = actor_json
        .clone()
        .try_into()
        .map_err(|e| EvalError::Match(format!("actor conversion: {e}")))?;
    ctx.add_variable("actor", actor_value)
        .map_err(|e| EvalError::Match(e.to_string()))?;

    ctx.add_function("link", move |display: Arc<String>, resource_ref: Value| {
        let resource: ResourceRef = json_value_to_resource_ref(&resource_ref);
        sink.0.lock().unwrap().push(Link {
            display_text: display.to_string(),
            resource_ref: resource,
        });
        display.to_string()
    });

    Ok(ctx)
}

fn json_value_to_resource_ref(v: &Value) -> ResourceRef {
    let json: JsonValue = v.clone().try_into().unwrap_or(JsonValue::Null);
    serde_json::from_value(json).unwrap_or_default()
}

impl CompiledMatch {
    /// Evaluate the match expression. A runtime error is reported but never
    /// panics — the caller counts it in the rule's error window.
    pub fn evaluate(&self, ctx: &Context) -> Result<bool, EvalError> {
        let value = self
            .program
            .execute(ctx)
            .map_err(|e| EvalError::Match(e.to_string()))?;
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(EvalError::Match(format!(
                "match expression did not return a boolean, got {other:?}"
            ))),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl CompiledTemplate {
    /// Render the template against the evaluation context. A template
    /// region's evaluation error is a fatal error for the record.
    pub fn render(&self, ctx: &Context) -> Result<String, EvalError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                TemplateSegment::Literal(s) => out.push_str(s),
                TemplateSegment::Expr { program, source } => {
                    let value = program
                        .execute(ctx)
                        .map_err(|e| EvalError::Template(format!("{source}: {e}")))?;
                    out.push_str(&stringify(&value).ok_or_else(|| {
                        EvalError::Template(format!(
                            "{source}: result is not string-coercible"
                        ))
                    })?);
                }
            }
        }
        Ok(out)
    }
}

fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.to_string()),
        Value::Int(i) => Some(i.to_string()),
        Value::UInt(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compiles_and_matches_simple_boolean_expression() {
        let m = compile_match("audit.verb == 'create'", RuleKind::Audit).unwrap();
        let record = json!({"verb": "create"});
        let sink = LinkSink::new();
        let ctx = build_context(RuleKind::Audit, &record, &json!("alice"), sink).unwrap();
        assert!(m.evaluate(&ctx).unwrap());
    }

    #[test]
    fn rejects_unknown_identifier_at_compile_time() {
        let err = compile_match("bogus.field == 1", RuleKind::Audit).unwrap_err();
        assert!(matches!(err, CompileError::UnknownIdentifier(_)));
    }

    #[test]
    fn template_renders_literal_and_expr_segments() {
        let t = compile_template(
            "{{ actor }} created deployment {{ audit.name }}",
            RuleKind::Audit,
        )
        .unwrap();
        let record = json!({"name": "api"});
        let sink = LinkSink::new();
        let ctx = build_context(RuleKind::Audit, &record, &json!("alice"), sink).unwrap();
        assert_eq!(t.render(&ctx).unwrap(), "alice created deployment api");
    }

    #[test]
    fn template_with_no_interpolation_is_all_literal() {
        let t = compile_template("static text", RuleKind::Audit).unwrap();
        let sink = LinkSink::new();
        let ctx = build_context(RuleKind::Audit, &json!({}), &json!(null), sink).unwrap();
        assert_eq!(t.render(&ctx).unwrap(), "static text");
    }

    #[test]
    fn unterminated_interpolation_is_a_compile_error() {
        let err = compile_template("hello {{ actor", RuleKind::Audit).unwrap_err();
        assert!(matches!(err, CompileError::Parse(_)));
    }

    #[test]
    fn link_function_records_link_and_renders_display_text() {
        let t = compile_template(
            "{{ link(actor, audit) }} did it",
            RuleKind::Audit,
        )
        .unwrap();
        let record = json!({"apiGroup": "apps", "kind": "Deployment", "name": "api"});
        let sink = LinkSink::new();
        let ctx = build_context(RuleKind::Audit, &record, &json!("alice"), sink.clone()).unwrap();
        let rendered = t.render(&ctx).unwrap();
        assert_eq!(rendered, "alice did it");
        let links = sink.into_links();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].display_text, "alice");
    }
}
