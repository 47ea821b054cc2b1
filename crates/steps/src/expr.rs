//! Arithmetic expressions used by formula steps, evaluated with rhai.
//!
//! Formulas are compiled with `Engine::compile_expression`, so statements,
//! assignments, loops and function definitions are rejected at parse time.
//! The engine is raw: only arithmetic operators plus `min`, `max`, `abs`,
//! `round(x[, places])`, `floor` and `ceil` are available.
//!
//! Context variables are visible by name; nested objects are reachable with
//! dotted access (`client.income`).

use once_cell::sync::Lazy;
use rhai::packages::{ArithmeticPackage, Package};
use rhai::{Dynamic, Engine, EvalAltResult, ParseErrorType, Scope, AST, FLOAT};
use serde_json::Value;
use thiserror::Error;

use crate::Context;

const MAX_OPERATIONS: u64 = 10_000;
const MAX_EXPR_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("expression is too complex")]
    TooComplex,

    #[error("formula has no output variable")]
    MissingOutput,

    #[error("variable '{0}' is missing or null")]
    UnknownVariable(String),

    #[error("variable '{variable}' is not a number: {found}")]
    NotNumeric { variable: String, found: Value },

    #[error("no function or operator matches {0}")]
    UnsupportedCall(String),

    #[error("arithmetic error: {0}")]
    Arithmetic(String),

    #[error("result is not a finite number")]
    NonFinite,

    #[error("{0}")]
    Eval(String),
}

static ENGINE: Lazy<Engine> = Lazy::new(formula_engine);

fn formula_engine() -> Engine {
    let mut engine = Engine::new_raw();
    engine.register_global_module(ArithmeticPackage::new().as_shared_module());
    engine.set_max_operations(MAX_OPERATIONS);
    engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_EXPR_DEPTH);
    engine.disable_symbol("eval");

    engine.register_fn("min", |a: Dynamic, b: Dynamic| -> Result<FLOAT, Box<EvalAltResult>> {
        Ok(number(&a)?.min(number(&b)?))
    });
    engine.register_fn("max", |a: Dynamic, b: Dynamic| -> Result<FLOAT, Box<EvalAltResult>> {
        Ok(number(&a)?.max(number(&b)?))
    });
    engine.register_fn("abs", |x: Dynamic| -> Result<FLOAT, Box<EvalAltResult>> {
        Ok(number(&x)?.abs())
    });
    engine.register_fn("floor", |x: Dynamic| -> Result<FLOAT, Box<EvalAltResult>> {
        Ok(number(&x)?.floor())
    });
    engine.register_fn("ceil", |x: Dynamic| -> Result<FLOAT, Box<EvalAltResult>> {
        Ok(number(&x)?.ceil())
    });
    engine.register_fn("round", |x: Dynamic| -> Result<FLOAT, Box<EvalAltResult>> {
        Ok(number(&x)?.round())
    });
    engine.register_fn(
        "round",
        |x: Dynamic, places: Dynamic| -> Result<FLOAT, Box<EvalAltResult>> {
            Ok(round_to(number(&x)?, number(&places)?))
        },
    );
    engine
}

fn number(value: &Dynamic) -> Result<FLOAT, Box<EvalAltResult>> {
    value
        .as_float()
        .or_else(|_| value.as_int().map(|i| i as FLOAT))
        .map_err(|_| format!("expected a number, found {}", value.type_name()).into())
}

/// Round half away from zero to `places` decimal places.
pub(crate) fn round_to(x: f64, places: f64) -> f64 {
    let factor = 10f64.powi(places.trunc() as i32);
    (x * factor).round() / factor
}

/// A compiled, expression-only rhai program.
#[derive(Debug, Clone)]
pub struct Expr {
    ast: AST,
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let ast = ENGINE.compile_expression(source).map_err(|e| {
            if matches!(*e.0, ParseErrorType::ExprTooDeep) {
                ExprError::TooComplex
            } else {
                ExprError::Syntax(e.to_string())
            }
        })?;
        Ok(Self { ast })
    }

    pub fn eval(&self, ctx: &Context) -> Result<f64, ExprError> {
        let mut scope = Scope::new();
        for (name, value) in ctx.as_map() {
            match value {
                // Left out so that a read reports the variable by name.
                Value::Null | Value::String(_) | Value::Bool(_) | Value::Array(_) => {}
                other => {
                    scope.push_dynamic(name.as_str(), to_dynamic(other));
                }
            }
        }

        let result = ENGINE
            .eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast)
            .map_err(|e| classify(*e, ctx))?;
        let value = number(&result).map_err(|_| {
            ExprError::Eval(format!(
                "expression produced {} instead of a number",
                result.type_name()
            ))
        })?;
        if value.is_finite() {
            Ok(value)
        } else {
            Err(ExprError::NonFinite)
        }
    }
}

/// Numbers enter as floats so that `/` never truncates.
fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from_bool(*b),
        Value::Number(n) => n.as_f64().map_or(Dynamic::UNIT, Dynamic::from_float),
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => {
            let array: rhai::Array = items.iter().map(to_dynamic).collect();
            Dynamic::from_array(array)
        }
        Value::Object(fields) => {
            let mut map = rhai::Map::new();
            for (key, field) in fields {
                map.insert(key.as_str().into(), to_dynamic(field));
            }
            Dynamic::from_map(map)
        }
    }
}

fn classify(err: EvalAltResult, ctx: &Context) -> ExprError {
    match err {
        EvalAltResult::ErrorVariableNotFound(name, _) => match ctx.get(&name) {
            None | Some(Value::Null) => ExprError::UnknownVariable(name),
            Some(found) => ExprError::NotNumeric {
                variable: name,
                found: found.clone(),
            },
        },
        EvalAltResult::ErrorFunctionNotFound(signature, _) => ExprError::UnsupportedCall(signature),
        EvalAltResult::ErrorArithmetic(message, _) => ExprError::Arithmetic(message),
        EvalAltResult::ErrorTooManyOperations(_) | EvalAltResult::ErrorStackOverflow(_) => {
            ExprError::TooComplex
        }
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => classify(*inner, ctx),
        other => ExprError::Eval(other.to_string()),
    }
}
