//! Dynamic values carried through the graph.
//!
//! A [`Value`] is what operators consume and produce. It may embed
//! [`Value::Ref`] entries pointing at other graph nodes; on the wire a
//! reference is the map `{"__type__": "ComputableResult", "exec_id": n}` so
//! references nest anywhere inside lists and maps.
//!
//! The arithmetic and comparison methods follow dynamic-language numerics:
//! booleans count as integers, mixed int/float promotes to float, true
//! division always yields a float, and floor division and modulo round
//! toward negative infinity.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use coper_coord::ExecId;

use crate::error::OperatorError;

/// Tag identifying an encoded node reference.
pub const REF_TYPE_TAG: &str = "ComputableResult";
const REF_TYPE_KEY: &str = "__type__";
const REF_ID_KEY: &str = "exec_id";

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    /// Ordered entries; keys may be any value.
    Map(Vec<(Value, Value)>),
    /// Reference to another node's eventual result.
    Ref(ExecId),
}

impl Value {
    pub fn map<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<Value>,
        V: Into<Value>,
    {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Ref(_) => "ref",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        num(self).map(Num::to_f64)
    }

    pub fn as_ref_id(&self) -> Option<ExecId> {
        match self {
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// Look up a map entry by string key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Append every embedded reference, depth first, map keys included.
    pub fn collect_refs(&self, out: &mut Vec<ExecId>) {
        match self {
            Value::Ref(id) => out.push(*id),
            Value::List(items) => items.iter().for_each(|v| v.collect_refs(out)),
            Value::Map(entries) => {
                for (k, v) in entries {
                    k.collect_refs(out);
                    v.collect_refs(out);
                }
            }
            _ => {}
        }
    }

    pub fn contains_ref(&self) -> bool {
        let mut refs = Vec::new();
        self.collect_refs(&mut refs);
        !refs.is_empty()
    }

    /// Replace references with their materialized values. Unknown ids stay references.
    pub fn substitute(&self, resolved: &HashMap<ExecId, Value>) -> Value {
        match self {
            Value::Ref(id) => resolved.get(id).cloned().unwrap_or(Value::Ref(*id)),
            Value::List(items) => Value::List(items.iter().map(|v| v.substitute(resolved)).collect()),
            Value::Map(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.substitute(resolved), v.substitute(resolved)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Truth value. A reference has none until it is resolved.
    pub fn truthy(&self) -> Result<bool, OperatorError> {
        Ok(match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
            Value::Ref(id) => {
                return Err(OperatorError::Type(format!(
                    "truth value of result reference {id} is ambiguous; resolve it first"
                )))
            }
        })
    }

    // ── Arithmetic ─────────────────────────────────────────────

    pub fn add(&self, other: &Value) -> Result<Value, OperatorError> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
            (Value::Bytes(a), Value::Bytes(b)) => Ok(Value::Bytes([a.as_slice(), b].concat())),
            (Value::List(a), Value::List(b)) => Ok(Value::List([a.as_slice(), b].concat())),
            _ => numeric("+", self, other, |x, y| checked(x.checked_add(y), "+"), |x, y| Ok(Value::Float(x + y))),
        }
    }

    pub fn sub(&self, other: &Value) -> Result<Value, OperatorError> {
        numeric("-", self, other, |x, y| checked(x.checked_sub(y), "-"), |x, y| Ok(Value::Float(x - y)))
    }

    pub fn mul(&self, other: &Value) -> Result<Value, OperatorError> {
        match (self, other) {
            (Value::Str(s), n) | (n, Value::Str(s)) if repeat_count(n).is_some() => {
                let times = repeated_len(s.len(), repeat_count(n).unwrap_or(0))?;
                Ok(Value::Str(s.repeat(times)))
            }
            (Value::Bytes(b), n) | (n, Value::Bytes(b)) if repeat_count(n).is_some() => {
                let times = repeated_len(b.len(), repeat_count(n).unwrap_or(0))?;
                Ok(Value::Bytes(b.repeat(times)))
            }
            (Value::List(l), n) | (n, Value::List(l)) if repeat_count(n).is_some() => {
                let times = repeated_len(l.len(), repeat_count(n).unwrap_or(0))?;
                let mut out = Vec::with_capacity(l.len() * times);
                for _ in 0..times {
                    out.extend(l.iter().cloned());
                }
                Ok(Value::List(out))
            }
            _ => numeric("*", self, other, |x, y| checked(x.checked_mul(y), "*"), |x, y| Ok(Value::Float(x * y))),
        }
    }

    /// True division: always a float.
    pub fn div(&self, other: &Value) -> Result<Value, OperatorError> {
        let (x, y) = both_f64("/", self, other)?;
        if y == 0.0 {
            return Err(OperatorError::ZeroDivision("division by zero".into()));
        }
        Ok(Value::Float(x / y))
    }

    pub fn floor_div(&self, other: &Value) -> Result<Value, OperatorError> {
        numeric(
            "//",
            self,
            other,
            |x, y| {
                if y == 0 {
                    return Err(OperatorError::ZeroDivision("integer division by zero".into()));
                }
                let q = x.checked_div(y).ok_or_else(|| overflow("//"))?;
                let adjust = x % y != 0 && ((x < 0) != (y < 0));
                Ok(Value::Int(if adjust { q - 1 } else { q }))
            },
            |x, y| {
                if y == 0.0 {
                    return Err(OperatorError::ZeroDivision("float floor division by zero".into()));
                }
                Ok(Value::Float((x / y).floor()))
            },
        )
    }

    /// Remainder with the sign of the divisor.
    pub fn rem(&self, other: &Value) -> Result<Value, OperatorError> {
        numeric(
            "%",
            self,
            other,
            |x, y| {
                if y == 0 {
                    return Err(OperatorError::ZeroDivision("integer modulo by zero".into()));
                }
                // i64::MIN % -1 overflows but the answer is 0
                let r = x.checked_rem(y).unwrap_or(0);
                Ok(Value::Int(if r != 0 && ((r < 0) != (y < 0)) { r + y } else { r }))
            },
            |x, y| {
                if y == 0.0 {
                    return Err(OperatorError::ZeroDivision("float modulo".into()));
                }
                let r = x % y;
                Ok(Value::Float(if r != 0.0 && ((r < 0.0) != (y < 0.0)) { r + y } else { r }))
            },
        )
    }

    pub fn pow(&self, other: &Value) -> Result<Value, OperatorError> {
        numeric(
            "**",
            self,
            other,
            |x, y| {
                if y < 0 {
                    if x == 0 {
                        return Err(OperatorError::ZeroDivision(
                            "0 cannot be raised to a negative power".into(),
                        ));
                    }
                    return Ok(Value::Float((x as f64).powf(y as f64)));
                }
                let exp = u32::try_from(y).map_err(|_| overflow("**"))?;
                checked(x.checked_pow(exp), "**")
            },
            |x, y| {
                if x == 0.0 && y < 0.0 {
                    return Err(OperatorError::ZeroDivision(
                        "0.0 cannot be raised to a negative power".into(),
                    ));
                }
                let r = x.powf(y);
                if r.is_nan() && !x.is_nan() && !y.is_nan() {
                    return Err(OperatorError::Argument("math domain error".into()));
                }
                Ok(Value::Float(r))
            },
        )
    }

    pub fn neg(&self) -> Result<Value, OperatorError> {
        match num(self) {
            Some(Num::I(x)) => checked(x.checked_neg(), "unary -"),
            Some(Num::F(x)) => Ok(Value::Float(-x)),
            None => Err(unsupported_unary("unary -", self)),
        }
    }

    /// Bitwise inversion: `!x` on integers, `-(x + 1)`.
    pub fn invert(&self) -> Result<Value, OperatorError> {
        match self.as_i64() {
            Some(x) => Ok(Value::Int(!x)),
            None => Err(unsupported_unary("~", self)),
        }
    }

    // ── Bitwise ────────────────────────────────────────────────

    pub fn bitand(&self, other: &Value) -> Result<Value, OperatorError> {
        bitwise("&", self, other, |x, y| x & y)
    }

    pub fn bitor(&self, other: &Value) -> Result<Value, OperatorError> {
        bitwise("|", self, other, |x, y| x | y)
    }

    pub fn bitxor(&self, other: &Value) -> Result<Value, OperatorError> {
        bitwise("^", self, other, |x, y| x ^ y)
    }

    pub fn shl(&self, other: &Value) -> Result<Value, OperatorError> {
        let (x, y) = both_i64("<<", self, other)?;
        if y < 0 {
            return Err(OperatorError::Argument("negative shift count".into()));
        }
        if x == 0 {
            return Ok(Value::Int(0));
        }
        if y >= 64 {
            return Err(overflow("<<"));
        }
        let shifted = x << y;
        if shifted >> y != x {
            return Err(overflow("<<"));
        }
        Ok(Value::Int(shifted))
    }

    pub fn shr(&self, other: &Value) -> Result<Value, OperatorError> {
        let (x, y) = both_i64(">>", self, other)?;
        if y < 0 {
            return Err(OperatorError::Argument("negative shift count".into()));
        }
        Ok(Value::Int(if y >= 64 { if x < 0 { -1 } else { 0 } } else { x >> y }))
    }

    // ── Logical ────────────────────────────────────────────────

    /// `x and y`: returns an operand, not a coerced bool.
    pub fn logical_and(&self, other: &Value) -> Result<Value, OperatorError> {
        Ok(if self.truthy()? { other.clone() } else { self.clone() })
    }

    /// `x or y`: returns an operand, not a coerced bool.
    pub fn logical_or(&self, other: &Value) -> Result<Value, OperatorError> {
        Ok(if self.truthy()? { self.clone() } else { other.clone() })
    }

    pub fn logical_not(&self) -> Result<Value, OperatorError> {
        Ok(Value::Bool(!self.truthy()?))
    }

    // ── Comparison ─────────────────────────────────────────────

    /// Equality across numeric types (`1 == 1.0 == true`), structural otherwise.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| {
                        b.iter().any(|(k2, v2)| k.loose_eq(k2) && v.loose_eq(v2))
                    })
            }
            _ => match (num(self), num(other)) {
                (Some(Num::I(x)), Some(Num::I(y))) => x == y,
                (Some(x), Some(y)) => x.to_f64() == y.to_f64(),
                _ => false,
            },
        }
    }

    /// Ordering over numbers, strings, bytes and lists. `None` when a NaN is involved.
    pub fn compare(&self, other: &Value, op: &str) -> Result<Option<Ordering>, OperatorError> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
            (Value::Bytes(a), Value::Bytes(b)) => Ok(Some(a.cmp(b))),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b) {
                    if !x.loose_eq(y) {
                        return x.compare(y, op);
                    }
                }
                Ok(Some(a.len().cmp(&b.len())))
            }
            _ => match (num(self), num(other)) {
                (Some(Num::I(x)), Some(Num::I(y))) => Ok(Some(x.cmp(&y))),
                (Some(x), Some(y)) => Ok(x.to_f64().partial_cmp(&y.to_f64())),
                _ => Err(OperatorError::Type(format!(
                    "'{op}' not supported between '{}' and '{}'",
                    self.type_name(),
                    other.type_name()
                ))),
            },
        }
    }

    pub fn equals(&self, other: &Value) -> Value {
        Value::Bool(self.loose_eq(other))
    }

    pub fn not_equals(&self, other: &Value) -> Value {
        Value::Bool(!self.loose_eq(other))
    }

    pub fn lt(&self, other: &Value) -> Result<Value, OperatorError> {
        Ok(Value::Bool(self.compare(other, "<")? == Some(Ordering::Less)))
    }

    pub fn le(&self, other: &Value) -> Result<Value, OperatorError> {
        Ok(Value::Bool(matches!(
            self.compare(other, "<=")?,
            Some(Ordering::Less | Ordering::Equal)
        )))
    }

    pub fn gt(&self, other: &Value) -> Result<Value, OperatorError> {
        Ok(Value::Bool(self.compare(other, ">")? == Some(Ordering::Greater)))
    }

    pub fn ge(&self, other: &Value) -> Result<Value, OperatorError> {
        Ok(Value::Bool(matches!(
            self.compare(other, ">=")?,
            Some(Ordering::Greater | Ordering::Equal)
        )))
    }
}

// ── Numeric helpers ────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Num {
    I(i64),
    F(f64),
}

impl Num {
    fn to_f64(self) -> f64 {
        match self {
            Num::I(i) => i as f64,
            Num::F(f) => f,
        }
    }
}

fn num(v: &Value) -> Option<Num> {
    match v {
        Value::Bool(b) => Some(Num::I(i64::from(*b))),
        Value::Int(i) => Some(Num::I(*i)),
        Value::Float(f) => Some(Num::F(*f)),
        _ => None,
    }
}

fn numeric(
    op: &str,
    a: &Value,
    b: &Value,
    int: impl FnOnce(i64, i64) -> Result<Value, OperatorError>,
    float: impl FnOnce(f64, f64) -> Result<Value, OperatorError>,
) -> Result<Value, OperatorError> {
    match (num(a), num(b)) {
        (Some(Num::I(x)), Some(Num::I(y))) => int(x, y),
        (Some(x), Some(y)) => float(x.to_f64(), y.to_f64()),
        _ => Err(unsupported(op, a, b)),
    }
}

fn bitwise(op: &str, a: &Value, b: &Value, f: impl Fn(i64, i64) -> i64) -> Result<Value, OperatorError> {
    if let (Value::Bool(x), Value::Bool(y)) = (a, b) {
        return Ok(Value::Bool(f(i64::from(*x), i64::from(*y)) != 0));
    }
    let (x, y) = both_i64(op, a, b)?;
    Ok(Value::Int(f(x, y)))
}

fn both_i64(op: &str, a: &Value, b: &Value) -> Result<(i64, i64), OperatorError> {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(unsupported(op, a, b)),
    }
}

fn both_f64(op: &str, a: &Value, b: &Value) -> Result<(f64, f64), OperatorError> {
    match (num(a), num(b)) {
        (Some(x), Some(y)) => Ok((x.to_f64(), y.to_f64())),
        _ => Err(unsupported(op, a, b)),
    }
}

/// Repetition count for sequence `*`; negative counts give an empty sequence.
fn repeat_count(v: &Value) -> Option<usize> {
    v.as_i64().map(|n| usize::try_from(n).unwrap_or(0))
}

/// Largest sequence (bytes, chars or elements) `*` may build.
pub const MAX_SEQUENCE_LEN: usize = 1 << 28;

/// Validates a repetition against [`MAX_SEQUENCE_LEN`] and returns the count.
/// Allocation failure aborts the process, so oversized results must be
/// rejected before any memory is reserved.
fn repeated_len(len: usize, times: usize) -> Result<usize, OperatorError> {
    match len.checked_mul(times) {
        _ if len == 0 => Ok(0),
        Some(total) if total <= MAX_SEQUENCE_LEN => Ok(times),
        _ => Err(OperatorError::Overflow(format!(
            "repeating a sequence of length {len} {times} times exceeds {MAX_SEQUENCE_LEN}"
        ))),
    }
}

fn checked(result: Option<i64>, op: &str) -> Result<Value, OperatorError> {
    result.map(Value::Int).ok_or_else(|| overflow(op))
}

fn overflow(op: &str) -> OperatorError {
    OperatorError::Overflow(format!("integer result of '{op}' does not fit in 64 bits"))
}

fn unsupported(op: &str, a: &Value, b: &Value) -> OperatorError {
    OperatorError::Type(format!(
        "unsupported operand types for {op}: '{}' and '{}'",
        a.type_name(),
        b.type_name()
    ))
}

fn unsupported_unary(op: &str, v: &Value) -> OperatorError {
    OperatorError::Type(format!("bad operand type for {op}: '{}'", v.type_name()))
}

// ── Conversions ────────────────────────────────────────────────

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Nil)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Value::Ref(id) => write!(f, "<Result id={id}>"),
        }
    }
}

// ── Serde ──────────────────────────────────────────────────────

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Nil => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(x) => serializer.serialize_f64(*x),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Bytes(b) => serializer.serialize_bytes(b),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Value::Ref(id) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry(REF_TYPE_KEY, REF_TYPE_TAG)?;
                map.serialize_entry(REF_ID_KEY, id)?;
                map.end()
            }
        }
    }
}

/// Recognize the two-entry reference marker map.
fn ref_marker(entries: &[(Value, Value)]) -> Option<ExecId> {
    if entries.len() != 2 {
        return None;
    }
    let mut tagged = false;
    let mut exec_id = None;
    for (k, v) in entries {
        match (k.as_str(), v) {
            (Some(REF_TYPE_KEY), Value::Str(tag)) if tag == REF_TYPE_TAG => tagged = true,
            (Some(REF_ID_KEY), Value::Int(id)) => exec_id = ExecId::try_from(*id).ok(),
            _ => {}
        }
    }
    if tagged {
        exec_id
    } else {
        None
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a dynamic value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Nil)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Nil)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Value, D::Error> {
        Value::deserialize(d)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        i64::try_from(v)
            .map(Value::Int)
            .map_err(|_| E::custom(format!("integer {v} does not fit in i64")))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::Str(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::Str(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Value, E> {
        Ok(Value::Bytes(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Value, E> {
        Ok(Value::Bytes(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some(entry) = map.next_entry::<Value, Value>()? {
            entries.push(entry);
        }
        Ok(match ref_marker(&entries) {
            Some(id) => Value::Ref(id),
            None => Value::Map(entries),
        })
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(i: i64) -> Value {
        Value::Int(i)
    }

    #[test]
    fn int_float_promotion() {
        assert_eq!(int(3).add(&Value::Float(0.5)).unwrap(), Value::Float(3.5));
        assert_eq!(int(3).mul(&int(2)).unwrap(), int(6));
        assert_eq!(Value::Bool(true).add(&int(1)).unwrap(), int(2));
    }

    #[test]
    fn true_division_is_float() {
        assert_eq!(int(7).div(&int(2)).unwrap(), Value::Float(3.5));
        assert_eq!(int(4).div(&int(2)).unwrap(), Value::Float(2.0));
        assert!(matches!(int(1).div(&int(0)), Err(OperatorError::ZeroDivision(_))));
    }

    #[test]
    fn floor_division_and_modulo_round_down() {
        assert_eq!(int(7).floor_div(&int(2)).unwrap(), int(3));
        assert_eq!(int(-7).floor_div(&int(2)).unwrap(), int(-4));
        assert_eq!(int(7).floor_div(&int(-2)).unwrap(), int(-4));
        assert_eq!(int(-7).rem(&int(2)).unwrap(), int(1));
        assert_eq!(int(7).rem(&int(-2)).unwrap(), int(-1));
        assert_eq!(Value::Float(-7.5).floor_div(&int(2)).unwrap(), Value::Float(-4.0));
        assert_eq!(Value::Float(-1.0).rem(&Value::Float(3.0)).unwrap(), Value::Float(2.0));
        assert!(int(1).rem(&int(0)).is_err());
    }

    #[test]
    fn power_rules() {
        assert_eq!(int(2).pow(&int(10)).unwrap(), int(1024));
        assert_eq!(int(2).pow(&int(-1)).unwrap(), Value::Float(0.5));
        assert!(matches!(int(0).pow(&int(-1)), Err(OperatorError::ZeroDivision(_))));
        assert!(matches!(int(10).pow(&int(40)), Err(OperatorError::Overflow(_))));
    }

    #[test]
    fn sequence_concat_and_repeat() {
        assert_eq!(Value::from("ab").add(&Value::from("cd")).unwrap(), Value::from("abcd"));
        assert_eq!(Value::from("ab").mul(&int(3)).unwrap(), Value::from("ababab"));
        assert_eq!(int(2).mul(&Value::List(vec![int(1)])).unwrap(), Value::List(vec![int(1), int(1)]));
        assert_eq!(Value::from("x").mul(&int(-2)).unwrap(), Value::from(""));
        assert_eq!(
            Value::List(vec![Value::from("s"), int(1)]).mul(&int(2)).unwrap(),
            Value::List(vec![Value::from("s"), int(1), Value::from("s"), int(1)])
        );
        assert_eq!(Value::List(vec![]).mul(&int(i64::MAX)).unwrap(), Value::List(vec![]));
        assert!(Value::from("a").add(&int(1)).is_err());
    }

    #[test]
    fn oversized_repeat_is_an_overflow() {
        let huge = int(4_000_000_000_000_000_000);
        assert!(matches!(Value::from("ab").mul(&huge), Err(OperatorError::Overflow(_))));
        assert!(matches!(huge.mul(&Value::Bytes(vec![0])), Err(OperatorError::Overflow(_))));
        assert!(matches!(
            Value::List(vec![int(1)]).mul(&int(MAX_SEQUENCE_LEN as i64 + 1)),
            Err(OperatorError::Overflow(_))
        ));
    }

    #[test]
    fn bitwise_and_shifts() {
        assert_eq!(int(6).bitand(&int(3)).unwrap(), int(2));
        assert_eq!(int(6).bitor(&int(3)).unwrap(), int(7));
        assert_eq!(int(6).bitxor(&int(3)).unwrap(), int(5));
        assert_eq!(Value::Bool(true).bitand(&Value::Bool(false)).unwrap(), Value::Bool(false));
        assert_eq!(int(1).shl(&int(4)).unwrap(), int(16));
        assert_eq!(int(-16).shr(&int(2)).unwrap(), int(-4));
        assert_eq!(int(-1).shr(&int(100)).unwrap(), int(-1));
        assert!(int(1).shl(&int(-1)).is_err());
        assert!(int(1).shl(&int(64)).is_err());
        assert_eq!(int(5).invert().unwrap(), int(-6));
    }

    #[test]
    fn logical_operators_return_operands() {
        assert_eq!(int(0).logical_and(&int(5)).unwrap(), int(0));
        assert_eq!(int(2).logical_and(&int(5)).unwrap(), int(5));
        assert_eq!(Value::Nil.logical_or(&Value::from("d")).unwrap(), Value::from("d"));
        assert_eq!(Value::List(vec![]).logical_not().unwrap(), Value::Bool(true));
    }

    #[test]
    fn reference_has_no_truth_value() {
        assert!(Value::Ref(3).truthy().is_err());
        assert!(Value::Ref(3).logical_not().is_err());
    }

    #[test]
    fn comparisons() {
        assert_eq!(int(1).equals(&Value::Float(1.0)), Value::Bool(true));
        assert_eq!(Value::Bool(true).equals(&int(1)), Value::Bool(true));
        assert_eq!(Value::from("a").equals(&int(1)), Value::Bool(false));
        assert_eq!(int(2).lt(&Value::Float(2.5)).unwrap(), Value::Bool(true));
        assert_eq!(Value::from("b").ge(&Value::from("a")).unwrap(), Value::Bool(true));
        let a = Value::List(vec![int(1), int(2)]);
        let b = Value::List(vec![int(1), int(3)]);
        assert_eq!(a.lt(&b).unwrap(), Value::Bool(true));
        assert_eq!(Value::Float(f64::NAN).le(&int(1)).unwrap(), Value::Bool(false));
        assert!(int(1).lt(&Value::from("a")).is_err());
    }

    #[test]
    fn refs_are_collected_from_nested_structures() {
        let v = Value::map([
            (Value::Ref(4), Value::List(vec![Value::Ref(1), int(2)])),
            (Value::from("k"), Value::Ref(1)),
        ]);
        let mut refs = Vec::new();
        v.collect_refs(&mut refs);
        assert_eq!(refs, vec![4, 1, 1]);

        let resolved = HashMap::from([(1, int(10)), (4, Value::from("four"))]);
        let out = v.substitute(&resolved);
        assert_eq!(
            out,
            Value::map([
                (Value::from("four"), Value::List(vec![int(10), int(2)])),
                (Value::from("k"), int(10)),
            ])
        );
    }

    #[test]
    fn reference_marker_roundtrips_through_msgpack() {
        let v = Value::List(vec![Value::Ref(7), Value::map([("inner", Value::Ref(9))])]);
        let bytes = rmp_serde::to_vec(&v).unwrap();
        let back: Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn plain_map_with_type_key_is_not_a_reference() {
        let v = Value::map([("__type__", Value::from("Other")), ("exec_id", int(1))]);
        let back: Value = rmp_serde::from_slice(&rmp_serde::to_vec(&v).unwrap()).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn bytes_stay_binary() {
        let v = Value::Bytes(vec![0, 1, 255]);
        let back: Value = rmp_serde::from_slice(&rmp_serde::to_vec(&v).unwrap()).unwrap();
        assert_eq!(back, v);
    }
}
