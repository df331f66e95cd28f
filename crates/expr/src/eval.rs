//! Evaluation of parsed expressions against a JSON environment.

use serde_json::Value;

use crate::{BinaryOp, Expr, UnaryOp};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("eval error: {message}")]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Truthiness rules of the authoring language: null, false, 0, and the empty
/// string are falsy; everything else (including empty arrays/objects) is
/// truthy.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Resolve a dotted path in the environment. Unknown segments yield `Null`
/// rather than an error so conditions over absent state simply don't match.
pub fn resolve_path<'a>(env: &'a Value, segments: &[String]) -> &'a Value {
    let mut cur = env;
    for seg in segments {
        cur = match cur {
            Value::Object(map) => match map.get(seg) {
                Some(v) => v,
                None => return &Value::Null,
            },
            Value::Array(items) => match seg.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return &Value::Null,
            },
            _ => return &Value::Null,
        };
    }
    cur
}

pub(crate) fn evaluate(expr: &Expr, env: &Value) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(segs) => Ok(resolve_path(env, segs).clone()),
        Expr::Unary { op, operand } => {
            let v = evaluate(operand, env)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&v))),
                UnaryOp::Neg => {
                    let n = as_number(&v)
                        .ok_or_else(|| EvalError::new("cannot negate non-number"))?;
                    Ok(number(-n))
                }
            }
        }
        Expr::Binary { op, lhs, rhs } => {
            // Short-circuit the connectives before evaluating the right side.
            match op {
                BinaryOp::And => {
                    let l = evaluate(lhs, env)?;
                    if !truthy(&l) {
                        return Ok(Value::Bool(false));
                    }
                    let r = evaluate(rhs, env)?;
                    return Ok(Value::Bool(truthy(&r)));
                }
                BinaryOp::Or => {
                    let l = evaluate(lhs, env)?;
                    if truthy(&l) {
                        return Ok(Value::Bool(true));
                    }
                    let r = evaluate(rhs, env)?;
                    return Ok(Value::Bool(truthy(&r)));
                }
                _ => {}
            }

            let l = evaluate(lhs, env)?;
            let r = evaluate(rhs, env)?;
            apply_binary(*op, &l, &r)
        }
    }
}

fn apply_binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(l, r))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(l, r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ord = compare(l, r).ok_or_else(|| {
                EvalError::new(format!("cannot order {} and {}", type_name(l), type_name(r)))
            })?;
            let b = match op {
                BinaryOp::Lt => ord.is_lt(),
                BinaryOp::Le => ord.is_le(),
                BinaryOp::Gt => ord.is_gt(),
                BinaryOp::Ge => ord.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(b))
        }
        BinaryOp::Add => {
            if let (Some(a), Some(b)) = (as_number(l), as_number(r)) {
                return Ok(number(a + b));
            }
            // String concatenation when either side is a string.
            if l.is_string() || r.is_string() {
                return Ok(Value::String(format!("{}{}", stringify(l), stringify(r))));
            }
            Err(EvalError::new("'+' needs numbers or strings"))
        }
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            let a = as_number(l).ok_or_else(|| EvalError::new("left operand is not a number"))?;
            let b = as_number(r).ok_or_else(|| EvalError::new("right operand is not a number"))?;
            match op {
                BinaryOp::Sub => Ok(number(a - b)),
                BinaryOp::Mul => Ok(number(a * b)),
                BinaryOp::Div => {
                    if b == 0.0 {
                        return Err(EvalError::new("division by zero"));
                    }
                    Ok(number(a / b))
                }
                BinaryOp::Mod => {
                    if b == 0.0 {
                        return Err(EvalError::new("modulo by zero"));
                    }
                    Ok(number(a % b))
                }
                _ => unreachable!(),
            }
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled before operand eval"),
    }
}

/// Structural equality with numeric coercion (1 == 1.0).
fn loose_eq(l: &Value, r: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(l), as_number(r)) {
        return a == b;
    }
    l == r
}

fn compare(l: &Value, r: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (as_number(l), as_number(r)) {
        return a.partial_cmp(&b);
    }
    if let (Value::String(a), Value::String(b)) = (l, r) {
        return Some(a.cmp(b));
    }
    None
}

fn as_number(v: &Value) -> Option<f64> {
    v.as_f64()
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;
    use serde_json::json;

    #[test]
    fn truthiness_table() {
        assert!(!truthy(&Value::Null));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!(1)));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!([])));
        assert!(truthy(&json!({})));
    }

    #[test]
    fn loose_numeric_equality() {
        let env = json!({ "a": 1, "b": 1.0 });
        assert!(parse("a == b").unwrap().evaluate_bool(&env).unwrap());
    }

    #[test]
    fn string_ordering() {
        let env = json!({});
        assert!(parse("\"apple\" < \"banana\"")
            .unwrap()
            .evaluate_bool(&env)
            .unwrap());
    }

    #[test]
    fn division_by_zero_errors() {
        let env = json!({});
        assert!(parse("1 / 0").unwrap().evaluate(&env).is_err());
    }

    #[test]
    fn short_circuit_skips_rhs_errors() {
        // RHS would divide by zero; && must not evaluate it.
        let env = json!({});
        assert!(!parse("false && (1 / 0)")
            .unwrap()
            .evaluate_bool(&env)
            .unwrap());
        assert!(parse("true || (1 / 0)")
            .unwrap()
            .evaluate_bool(&env)
            .unwrap());
    }

    #[test]
    fn path_through_array() {
        let env = json!({ "xs": [{ "v": 10 }] });
        assert_eq!(
            parse("xs.0.v").unwrap().evaluate(&env).unwrap(),
            json!(10)
        );
    }

    #[test]
    fn ordering_mixed_types_errors() {
        let env = json!({});
        assert!(parse("1 < \"a\"").unwrap().evaluate(&env).is_err());
    }
}
