//! `basic_ops.*`: the operators behind the result-handle algebra.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::args::CallArgs;
use crate::codec::Kwargs;
use crate::error::{OperatorError, RuntimeError};
use crate::operator::{Operator, OperatorInfo, OperatorRegistry};
use crate::session::Session;
use crate::value::Value;

pub const ADD: &str = "basic_ops.Add";
pub const SUBTRACT: &str = "basic_ops.Subtract";
pub const MULTIPLY: &str = "basic_ops.Multiply";
pub const MUL: &str = "basic_ops.Mul";
pub const DIVIDE: &str = "basic_ops.Divide";
pub const FLOOR_DIVIDE: &str = "basic_ops.FloorDivide";
pub const MODULO: &str = "basic_ops.Modulo";
pub const POWER: &str = "basic_ops.Power";
pub const BITWISE_AND: &str = "basic_ops.BitwiseAnd";
pub const BITWISE_OR: &str = "basic_ops.BitwiseOr";
pub const BITWISE_XOR: &str = "basic_ops.BitwiseXor";
pub const LEFT_SHIFT: &str = "basic_ops.LeftShift";
pub const RIGHT_SHIFT: &str = "basic_ops.RightShift";
pub const EQUAL: &str = "basic_ops.Equal";
pub const NOT_EQUAL: &str = "basic_ops.NotEqual";
pub const LESS: &str = "basic_ops.Less";
pub const LESS_EQUAL: &str = "basic_ops.LessEqual";
pub const GREATER: &str = "basic_ops.Greater";
pub const GREATER_EQUAL: &str = "basic_ops.GreaterEqual";
pub const LOGICAL_AND: &str = "basic_ops.LogicalAnd";
pub const LOGICAL_OR: &str = "basic_ops.LogicalOr";
pub const LOGICAL_NOT: &str = "basic_ops.LogicalNot";
pub const NEGATE: &str = "basic_ops.Negate";
pub const INVERT: &str = "basic_ops.Invert";

type BinaryFn = fn(&Value, &Value) -> Result<Value, OperatorError>;
type UnaryFn = fn(&Value) -> Result<Value, OperatorError>;

fn equal(x: &Value, y: &Value) -> Result<Value, OperatorError> {
    Ok(x.equals(y))
}

fn not_equal(x: &Value, y: &Value) -> Result<Value, OperatorError> {
    Ok(x.not_equals(y))
}

const BINARY: &[(&str, &str, BinaryFn)] = &[
    (ADD, "Return x + y", Value::add),
    (SUBTRACT, "Return x - y", Value::sub),
    (MULTIPLY, "Return x * y", Value::mul),
    (MUL, "Return x * y", Value::mul),
    (DIVIDE, "Return x / y", Value::div),
    (FLOOR_DIVIDE, "Return x // y", Value::floor_div),
    (MODULO, "Return x % y", Value::rem),
    (POWER, "Return x ** y", Value::pow),
    (BITWISE_AND, "Return x & y", Value::bitand),
    (BITWISE_OR, "Return x | y", Value::bitor),
    (BITWISE_XOR, "Return x ^ y", Value::bitxor),
    (LEFT_SHIFT, "Return x << y", Value::shl),
    (RIGHT_SHIFT, "Return x >> y", Value::shr),
    (EQUAL, "Return x == y", equal),
    (NOT_EQUAL, "Return x != y", not_equal),
    (LESS, "Return x < y", Value::lt),
    (LESS_EQUAL, "Return x <= y", Value::le),
    (GREATER, "Return x > y", Value::gt),
    (GREATER_EQUAL, "Return x >= y", Value::ge),
    (LOGICAL_AND, "Return x and y", Value::logical_and),
    (LOGICAL_OR, "Return x or y", Value::logical_or),
];

const UNARY: &[(&str, &str, UnaryFn)] = &[
    (LOGICAL_NOT, "Return not x", Value::logical_not),
    (NEGATE, "Return -x", Value::neg),
    (INVERT, "Return ~x", Value::invert),
];

struct BinaryOp {
    f: BinaryFn,
}

#[async_trait]
impl Operator for BinaryOp {
    async fn compute(&self, _session: &Session, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, OperatorError> {
        let call = CallArgs::new(&args, &kwargs);
        call.expect_at_most(&["x", "y"])?;
        (self.f)(call.require(0, "x")?, call.require(1, "y")?)
    }
}

struct UnaryOp {
    f: UnaryFn,
}

#[async_trait]
impl Operator for UnaryOp {
    async fn compute(&self, _session: &Session, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, OperatorError> {
        let call = CallArgs::new(&args, &kwargs);
        call.expect_at_most(&["x"])?;
        (self.f)(call.require(0, "x")?)
    }
}

fn output_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": { "result": { "description": "operation result" } },
        "required": ["result"]
    })
}

fn binary_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "x": { "description": "first operand" },
            "y": { "description": "second operand" }
        },
        "required": ["x", "y"]
    })
}

fn unary_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": { "x": { "description": "single operand" } },
        "required": ["x"]
    })
}

fn no_init_args(reference: &str, init_args: &[Value], init_kwargs: &Kwargs) -> Result<(), OperatorError> {
    if init_args.is_empty() && init_kwargs.is_empty() {
        Ok(())
    } else {
        Err(OperatorError::Argument(format!("{reference} takes no init args")))
    }
}

pub fn register(registry: &mut OperatorRegistry) -> Result<(), RuntimeError> {
    for &(reference, description, f) in BINARY {
        let info = OperatorInfo::new(reference, description).with_schemas(binary_schema(), output_schema());
        registry.register(
            info,
            Arc::new(move |init_args: &[Value], init_kwargs: &Kwargs| {
                no_init_args(reference, init_args, init_kwargs)?;
                Ok(Box::new(BinaryOp { f }) as Box<dyn Operator>)
            }),
        )?;
    }
    for &(reference, description, f) in UNARY {
        let info = OperatorInfo::new(reference, description).with_schemas(unary_schema(), output_schema());
        registry.register(
            info,
            Arc::new(move |init_args: &[Value], init_kwargs: &Kwargs| {
                no_init_args(reference, init_args, init_kwargs)?;
                Ok(Box::new(UnaryOp { f }) as Box<dyn Operator>)
            }),
        )?;
    }
    Ok(())
}
