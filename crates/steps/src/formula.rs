//! Formula documents: one numeric context variable computed from an
//! arithmetic expression (see [`crate::expr`]).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use uuid::Uuid;

use crate::expr::{round_to, Expr, ExprError};
use crate::Context;

/// Largest integer an `f64` holds exactly.
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formula {
    pub id: Uuid,
    pub name: String,
    pub expression: String,
    /// Context variable that receives the result.
    pub output: String,
    /// Round the result to this many decimal places.
    #[serde(default)]
    pub decimals: Option<u32>,
}

impl Formula {
    /// Compile the expression. Run at publish time and again when a step
    /// first loads the formula.
    pub fn compile(&self) -> Result<CompiledFormula, ExprError> {
        if self.output.trim().is_empty() {
            return Err(ExprError::MissingOutput);
        }
        Ok(CompiledFormula {
            name: self.name.clone(),
            output: self.output.clone(),
            decimals: self.decimals,
            expr: Expr::parse(&self.expression)?,
        })
    }
}

/// A formula whose expression has been compiled.
#[derive(Debug, Clone)]
pub struct CompiledFormula {
    pub name: String,
    pub output: String,
    pub decimals: Option<u32>,
    pub expr: Expr,
}

impl CompiledFormula {
    /// Evaluate against `ctx` and return the single-variable output delta.
    pub fn evaluate(&self, ctx: &Context) -> Result<Map<String, Value>, ExprError> {
        let mut value = self.expr.eval(ctx)?;
        if let Some(places) = self.decimals {
            value = round_to(value, f64::from(places));
        }

        let mut output = Map::new();
        output.insert(self.output.clone(), to_json(value)?);
        Ok(output)
    }
}

/// Integral results are stored as JSON integers so that downstream
/// equality conditions on `number` columns behave as authors expect.
fn to_json(value: f64) -> Result<Value, ExprError> {
    if value.fract() == 0.0 && value.abs() < MAX_EXACT_INT {
        return Ok(Value::from(value as i64));
    }
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or(ExprError::NonFinite)
}
