use rust_decimal::Decimal;

use super::parser::{BinaryOp, Expr, Function};
use super::Variables;
use crate::error::EvaluationError;

/// Evaluate a syntax tree against bound variables.
///
/// Pure: the same tree and bindings always produce the same decimal.
pub fn evaluate_expr(expr: &Expr, variables: &Variables) -> Result<Decimal, EvaluationError> {
    match expr {
        Expr::Number(value) => Ok(*value),
        Expr::Variable(name) => {
            variables
                .get(name)
                .copied()
                .ok_or_else(|| EvaluationError::MissingVariable { name: name.clone() })
        }
        Expr::Neg(inner) => Ok(-evaluate_expr(inner, variables)?),
        Expr::Binary { op, lhs, rhs } => {
            let a = evaluate_expr(lhs, variables)?;
            let b = evaluate_expr(rhs, variables)?;
            apply_binary(*op, a, b, expr)
        }
        Expr::Call { function, args } => {
            let mut acc: Option<Decimal> = None;
            for arg in args {
                let value = evaluate_expr(arg, variables)?;
                acc = Some(match (acc, function) {
                    (None, _) => value,
                    (Some(current), Function::Min) => current.min(value),
                    (Some(current), Function::Max) => current.max(value),
                });
            }
            // the parser guarantees at least two arguments
            Ok(acc.unwrap_or(Decimal::ZERO))
        }
    }
}

fn apply_binary(
    op: BinaryOp,
    a: Decimal,
    b: Decimal,
    expr: &Expr,
) -> Result<Decimal, EvaluationError> {
    let result = match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Sub => a.checked_sub(b),
        BinaryOp::Mul => a.checked_mul(b),
        BinaryOp::Div => {
            if b.is_zero() {
                return Err(EvaluationError::DivisionByZero {
                    expression: expr.to_string(),
                });
            }
            a.checked_div(b)
        }
    };
    result.ok_or_else(|| EvaluationError::Overflow {
        operation: format!("{a} {} {b}", op.symbol()),
    })
}
