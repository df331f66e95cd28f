//! The workflow condition language: a small expression grammar parsed to a
//! serializable AST that evaluates against a JSON environment.
//!
//! Conditions and foreach collections in workflow definitions are authored
//! as strings (`state.votes > 2 && input.mode == "fast"`), parsed once at
//! definition-store time, and evaluated by the coordinator against the
//! context sections `input`, `state`, `output`, and `_branch`.
//!
//! Semantics follow the authoring language: unknown paths evaluate to null,
//! truthiness is null/false/0/"" → false, everything else → true.

pub mod eval;
pub mod parse;

pub use eval::{truthy, EvalError};
pub use parse::{parse, ParseError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AST
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

/// A parsed expression. Serializable so definitions can persist the parsed
/// form alongside the source string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// A literal JSON scalar (`null`, `true`, `42`, `"text"`).
    Literal(Value),
    /// A dotted path into the environment (`state.votes`, `items.0.name`).
    Path(Vec<String>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    /// Evaluate against a JSON object environment.
    pub fn evaluate(&self, env: &Value) -> Result<Value, EvalError> {
        eval::evaluate(self, env)
    }

    /// Evaluate and reduce to a boolean per the truthiness rules.
    pub fn evaluate_bool(&self, env: &Value) -> Result<bool, EvalError> {
        Ok(truthy(&self.evaluate(env)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env() -> Value {
        json!({
            "input": { "mode": "fast", "count": 3 },
            "state": { "votes": [1, 2], "done": true },
            "_branch": { "item": "b" }
        })
    }

    #[test]
    fn parse_and_evaluate_comparison() {
        let expr = parse("input.count >= 3").unwrap();
        assert_eq!(expr.evaluate(&env()).unwrap(), json!(true));
    }

    #[test]
    fn boolean_connectives() {
        let expr = parse("state.done && input.mode == \"fast\"").unwrap();
        assert!(expr.evaluate_bool(&env()).unwrap());

        let expr = parse("!state.done || input.count < 2").unwrap();
        assert!(!expr.evaluate_bool(&env()).unwrap());
    }

    #[test]
    fn unknown_path_is_null_and_falsy() {
        let expr = parse("state.missing.deeper").unwrap();
        assert_eq!(expr.evaluate(&env()).unwrap(), Value::Null);
        assert!(!expr.evaluate_bool(&env()).unwrap());
    }

    #[test]
    fn numeric_array_index() {
        let expr = parse("state.votes.1").unwrap();
        assert_eq!(expr.evaluate(&env()).unwrap(), json!(2));
    }

    #[test]
    fn branch_store_access() {
        let expr = parse("_branch.item == \"b\"").unwrap();
        assert!(expr.evaluate_bool(&env()).unwrap());
    }

    #[test]
    fn arithmetic_and_precedence() {
        let expr = parse("1 + 2 * 3").unwrap();
        assert_eq!(expr.evaluate(&env()).unwrap(), json!(7.0));

        let expr = parse("(1 + 2) * 3").unwrap();
        assert_eq!(expr.evaluate(&env()).unwrap(), json!(9.0));
    }

    #[test]
    fn string_concat() {
        let expr = parse("input.mode + \"-lane\"").unwrap();
        assert_eq!(expr.evaluate(&env()).unwrap(), json!("fast-lane"));
    }

    #[test]
    fn ast_round_trips_through_serde() {
        let expr = parse("state.votes.0 > 0 && !state.done").unwrap();
        let json = serde_json::to_string(&expr).unwrap();
        let back: Expr = serde_json::from_str(&json).unwrap();
        assert_eq!(expr, back);
    }
}
