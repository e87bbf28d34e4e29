//! Policy engine: compile, cache, and evaluate declarative translation
//! rules.

pub mod cache;
pub mod eval;
pub mod expr;

pub use cache::{ApplyResult, CompiledRule, PolicyCache, TargetRules};
pub use eval::{classify_actor, evaluate, preview, EvaluationInput, EvaluationOutcome};
pub use expr::RuleKind;
