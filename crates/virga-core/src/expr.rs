//! Expression AST and row-record evaluator
//!
//! Expressions arrive from the parser (or from JSON with a `node_type`
//! discriminator) and are evaluated per row against a record exposing tag,
//! field and identifier references. Numeric comparisons promote to float
//! when either side is float; regex operators apply to string references
//! only. A missing reference makes the whole expression evaluate to
//! "no value" (`Ok(None)`), which filters treat as excluding the row.

use crate::error::{Error, Result};
use crate::time::{Duration, Time};
use crate::value::{Pattern, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a reference names in the row record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    Tag,
    Field,
    Identifier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Sub,
    #[serde(rename = "*")]
    Mul,
    #[serde(rename = "/")]
    Div,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "and")]
    And,
    #[serde(rename = "or")]
    Or,
    #[serde(rename = "=~")]
    RegexMatch,
    #[serde(rename = "!~")]
    RegexNotMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    #[serde(rename = "not")]
    Not,
    #[serde(rename = "-")]
    Neg,
}

/// Expression node. Exchanged as JSON keyed by `node_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node_type", rename_all = "camelCase")]
pub enum Expr {
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Reference {
        name: String,
        kind: ReferenceKind,
    },
    BoolLiteral {
        value: bool,
    },
    IntLiteral {
        value: i64,
    },
    UintLiteral {
        value: u64,
    },
    FloatLiteral {
        value: f64,
    },
    StringLiteral {
        value: String,
    },
    RegexLiteral {
        value: Pattern,
    },
    TimeLiteral {
        value: Time,
    },
    DurationLiteral {
        value: Duration,
    },
}

impl Expr {
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Expr {
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn reference(name: impl Into<String>, kind: ReferenceKind) -> Expr {
        Expr::Reference {
            name: name.into(),
            kind,
        }
    }

    pub fn tag(name: impl Into<String>) -> Expr {
        Expr::reference(name, ReferenceKind::Tag)
    }

    pub fn field(name: impl Into<String>) -> Expr {
        Expr::reference(name, ReferenceKind::Field)
    }

    pub fn identifier(name: impl Into<String>) -> Expr {
        Expr::reference(name, ReferenceKind::Identifier)
    }

    pub fn int(value: i64) -> Expr {
        Expr::IntLiteral { value }
    }

    pub fn float(value: f64) -> Expr {
        Expr::FloatLiteral { value }
    }

    pub fn string(value: impl Into<String>) -> Expr {
        Expr::StringLiteral {
            value: value.into(),
        }
    }

    /// Collect every reference in the tree, in evaluation order.
    pub fn references(&self) -> Vec<(&str, ReferenceKind)> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<(&'a str, ReferenceKind)>) {
        match self {
            Expr::Binary { left, right, .. } => {
                left.collect_references(out);
                right.collect_references(out);
            }
            Expr::Unary { operand, .. } => operand.collect_references(out),
            Expr::Reference { name, kind } => out.push((name, *kind)),
            _ => {}
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::RegexMatch => "=~",
            BinaryOp::RegexNotMatch => "!~",
        };
        write!(f, "{}", s)
    }
}

/// One row's view for reference resolution.
pub trait Record {
    /// Resolve a reference; `None` when the record has no such name.
    fn lookup(&self, kind: ReferenceKind, name: &str) -> Option<Value>;
}

/// Evaluate an expression against a record.
///
/// `Ok(None)` means a reference was missing; `Err` is a genuine type error
/// and fails the query.
pub fn eval(expr: &Expr, record: &dyn Record) -> Result<Option<Value>> {
    match expr {
        Expr::BoolLiteral { value } => Ok(Some(Value::Bool(*value))),
        Expr::IntLiteral { value } => Ok(Some(Value::Int(*value))),
        Expr::UintLiteral { value } => Ok(Some(Value::UInt(*value))),
        Expr::FloatLiteral { value } => Ok(Some(Value::Float(*value))),
        Expr::StringLiteral { value } => Ok(Some(Value::Str(value.clone()))),
        Expr::RegexLiteral { value } => Ok(Some(Value::Regex(value.clone()))),
        Expr::TimeLiteral { value } => Ok(Some(Value::Time(*value))),
        Expr::DurationLiteral { value } => Ok(Some(Value::Duration(*value))),
        Expr::Reference { name, kind } => Ok(record.lookup(*kind, name)),
        Expr::Unary { op, operand } => {
            let Some(v) = eval(operand, record)? else {
                return Ok(None);
            };
            eval_unary(*op, v).map(Some)
        }
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, record),
    }
}

fn eval_unary(op: UnaryOp, v: Value) -> Result<Value> {
    match (op, v) {
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Neg, Value::Int(n)) => Ok(Value::Int(-n)),
        (UnaryOp::Neg, Value::Float(n)) => Ok(Value::Float(-n)),
        (UnaryOp::Neg, Value::Duration(d)) => Ok(Value::Duration(-d)),
        (op, v) => Err(Error::Type(format!(
            "unary {:?} not defined for {}",
            op,
            v.type_name()
        ))),
    }
}

fn eval_binary(op: BinaryOp, left: &Expr, right: &Expr, record: &dyn Record) -> Result<Option<Value>> {
    // Logical operators short-circuit and stay in the bool domain.
    if matches!(op, BinaryOp::And | BinaryOp::Or) {
        let Some(l) = eval(left, record)? else {
            return Ok(None);
        };
        let l = expect_bool(&l)?;
        match (op, l) {
            (BinaryOp::And, false) => return Ok(Some(Value::Bool(false))),
            (BinaryOp::Or, true) => return Ok(Some(Value::Bool(true))),
            _ => {}
        }
        let Some(r) = eval(right, record)? else {
            return Ok(None);
        };
        return Ok(Some(Value::Bool(expect_bool(&r)?)));
    }

    let Some(l) = eval(left, record)? else {
        return Ok(None);
    };
    let Some(r) = eval(right, record)? else {
        return Ok(None);
    };

    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
            arithmetic(op, &l, &r).map(Some)
        }
        BinaryOp::Eq => compare(&l, &r).map(|ord| Some(Value::Bool(ord == std::cmp::Ordering::Equal))),
        BinaryOp::NotEq => {
            compare(&l, &r).map(|ord| Some(Value::Bool(ord != std::cmp::Ordering::Equal)))
        }
        BinaryOp::Lt => compare(&l, &r).map(|ord| Some(Value::Bool(ord == std::cmp::Ordering::Less))),
        BinaryOp::Lte => {
            compare(&l, &r).map(|ord| Some(Value::Bool(ord != std::cmp::Ordering::Greater)))
        }
        BinaryOp::Gt => {
            compare(&l, &r).map(|ord| Some(Value::Bool(ord == std::cmp::Ordering::Greater)))
        }
        BinaryOp::Gte => {
            compare(&l, &r).map(|ord| Some(Value::Bool(ord != std::cmp::Ordering::Less)))
        }
        BinaryOp::RegexMatch => regex_match(&l, &r).map(|m| Some(Value::Bool(m))),
        BinaryOp::RegexNotMatch => regex_match(&l, &r).map(|m| Some(Value::Bool(!m))),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn expect_bool(v: &Value) -> Result<bool> {
    v.as_bool()
        .ok_or_else(|| Error::Type(format!("expected bool, got {}", v.type_name())))
}

/// Compare two values, promoting numerics: float if either side is float,
/// otherwise exact integer comparison across signs.
fn compare(l: &Value, r: &Value) -> Result<std::cmp::Ordering> {
    use std::cmp::Ordering;
    use Value::*;
    let ord = match (l, r) {
        (Int(a), Int(b)) => a.cmp(b),
        (UInt(a), UInt(b)) => a.cmp(b),
        (Int(a), UInt(b)) => (*a as i128).cmp(&(*b as i128)),
        (UInt(a), Int(b)) => (*a as i128).cmp(&(*b as i128)),
        (Float(_), Int(_) | UInt(_) | Float(_)) | (Int(_) | UInt(_), Float(_)) => {
            let (a, b) = (l.as_float().unwrap(), r.as_float().unwrap());
            a.partial_cmp(&b)
                .ok_or_else(|| Error::Type("NaN is not comparable".into()))?
        }
        (Str(a), Str(b)) => a.cmp(b),
        (Bool(a), Bool(b)) => a.cmp(b),
        (Time(a), Time(b)) => a.cmp(b),
        (Duration(a), Duration(b)) => a.cmp(b),
        _ => {
            return Err(Error::Type(format!(
                "cannot compare {} with {}",
                l.type_name(),
                r.type_name()
            )))
        }
    };
    Ok(ord)
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    use Value::*;
    match (l, r) {
        // Float contaminates: any float operand promotes the operation.
        (Float(_), Int(_) | UInt(_) | Float(_)) | (Int(_) | UInt(_), Float(_)) => {
            let (a, b) = (l.as_float().unwrap(), r.as_float().unwrap());
            Ok(Float(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => unreachable!(),
            }))
        }
        (UInt(a), UInt(b)) => {
            if op == BinaryOp::Div && *b == 0 {
                return Err(Error::Type("division by zero".into()));
            }
            Ok(UInt(match op {
                BinaryOp::Add => a.wrapping_add(*b),
                BinaryOp::Sub => a.wrapping_sub(*b),
                BinaryOp::Mul => a.wrapping_mul(*b),
                BinaryOp::Div => a / b,
                _ => unreachable!(),
            }))
        }
        (Int(_) | UInt(_), Int(_) | UInt(_)) => {
            let a = match l {
                Int(n) => *n,
                UInt(n) => *n as i64,
                _ => unreachable!(),
            };
            let b = match r {
                Int(n) => *n,
                UInt(n) => *n as i64,
                _ => unreachable!(),
            };
            if op == BinaryOp::Div && b == 0 {
                return Err(Error::Type("division by zero".into()));
            }
            Ok(Int(match op {
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Sub => a.wrapping_sub(b),
                BinaryOp::Mul => a.wrapping_mul(b),
                BinaryOp::Div => a / b,
                _ => unreachable!(),
            }))
        }
        (Time(t), Duration(d)) if op == BinaryOp::Add => Ok(Time(*t + *d)),
        (Time(t), Duration(d)) if op == BinaryOp::Sub => Ok(Time(*t - *d)),
        (Duration(a), Duration(b)) if op == BinaryOp::Add => Ok(Duration(*a + *b)),
        (Duration(a), Duration(b)) if op == BinaryOp::Sub => Ok(Duration(*a + -*b)),
        (Time(a), Time(b)) if op == BinaryOp::Sub => Ok(Duration(*a - *b)),
        _ => Err(Error::Type(format!(
            "{} {} {} is not defined",
            l.type_name(),
            op,
            r.type_name()
        ))),
    }
}

fn regex_match(l: &Value, r: &Value) -> Result<bool> {
    let s = l.as_str().ok_or_else(|| {
        Error::Type(format!(
            "regex operators apply to strings, got {}",
            l.type_name()
        ))
    })?;
    match r {
        Value::Regex(p) => Ok(p.is_match(s)),
        other => Err(Error::Type(format!(
            "right side of a regex match must be a regex, got {}",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapRecord {
        tags: HashMap<String, String>,
        fields: HashMap<String, Value>,
    }

    impl MapRecord {
        fn new() -> Self {
            MapRecord {
                tags: HashMap::new(),
                fields: HashMap::new(),
            }
        }

        fn tag(mut self, k: &str, v: &str) -> Self {
            self.tags.insert(k.into(), v.into());
            self
        }

        fn field(mut self, k: &str, v: Value) -> Self {
            self.fields.insert(k.into(), v);
            self
        }
    }

    impl Record for MapRecord {
        fn lookup(&self, kind: ReferenceKind, name: &str) -> Option<Value> {
            match kind {
                ReferenceKind::Tag => self.tags.get(name).map(|s| Value::Str(s.clone())),
                ReferenceKind::Field | ReferenceKind::Identifier => {
                    self.fields.get(name).cloned()
                }
            }
        }
    }

    #[test]
    fn test_tag_equality() {
        let rec = MapRecord::new().tag("t1", "v1");
        let expr = Expr::binary(BinaryOp::Eq, Expr::tag("t1"), Expr::string("v1"));
        assert_eq!(eval(&expr, &rec).unwrap(), Some(Value::Bool(true)));
    }

    #[test]
    fn test_and_with_field() {
        let rec = MapRecord::new().tag("t1", "v1").field("$", Value::Int(10));
        let expr = Expr::binary(
            BinaryOp::And,
            Expr::binary(BinaryOp::Eq, Expr::tag("t1"), Expr::string("v1")),
            Expr::binary(BinaryOp::Eq, Expr::field("$"), Expr::int(10)),
        );
        assert_eq!(eval(&expr, &rec).unwrap(), Some(Value::Bool(true)));
    }

    #[test]
    fn test_missing_reference_is_none() {
        let rec = MapRecord::new();
        let expr = Expr::binary(BinaryOp::Eq, Expr::tag("absent"), Expr::string("v1"));
        assert_eq!(eval(&expr, &rec).unwrap(), None);
    }

    #[test]
    fn test_numeric_promotion_to_float() {
        let rec = MapRecord::new().field("$", Value::Int(10));
        let expr = Expr::binary(BinaryOp::Eq, Expr::field("$"), Expr::float(10.0));
        assert_eq!(eval(&expr, &rec).unwrap(), Some(Value::Bool(true)));
    }

    #[test]
    fn test_regex_match_on_tag() {
        let rec = MapRecord::new().tag("t1", "val1");
        let expr = Expr::binary(
            BinaryOp::RegexMatch,
            Expr::tag("t1"),
            Expr::RegexLiteral {
                value: Pattern::new("^val").unwrap(),
            },
        );
        assert_eq!(eval(&expr, &rec).unwrap(), Some(Value::Bool(true)));
    }

    #[test]
    fn test_regex_on_non_string_fails() {
        let rec = MapRecord::new().field("$", Value::Int(10));
        let expr = Expr::binary(
            BinaryOp::RegexMatch,
            Expr::field("$"),
            Expr::RegexLiteral {
                value: Pattern::new("x").unwrap(),
            },
        );
        assert!(matches!(eval(&expr, &rec), Err(Error::Type(_))));
    }

    #[test]
    fn test_integer_division() {
        let rec = MapRecord::new();
        let expr = Expr::binary(BinaryOp::Div, Expr::int(7), Expr::int(2));
        assert_eq!(eval(&expr, &rec).unwrap(), Some(Value::Int(3)));
    }

    #[test]
    fn test_division_by_zero_fails() {
        let rec = MapRecord::new();
        let expr = Expr::binary(BinaryOp::Div, Expr::int(7), Expr::int(0));
        assert!(matches!(eval(&expr, &rec), Err(Error::Type(_))));
    }

    #[test]
    fn test_short_circuit_and() {
        // Right side is missing, but the left already decides the result.
        let rec = MapRecord::new();
        let expr = Expr::binary(
            BinaryOp::And,
            Expr::BoolLiteral { value: false },
            Expr::binary(BinaryOp::Eq, Expr::tag("absent"), Expr::string("x")),
        );
        assert_eq!(eval(&expr, &rec).unwrap(), Some(Value::Bool(false)));
    }

    #[test]
    fn test_node_type_json() {
        let expr = Expr::binary(BinaryOp::Eq, Expr::tag("t1"), Expr::string("v1"));
        let json = serde_json::to_value(&expr).unwrap();
        assert_eq!(json["node_type"], "binary");
        assert_eq!(json["op"], "==");
        assert_eq!(json["left"]["node_type"], "reference");
        assert_eq!(json["left"]["kind"], "tag");
        let back: Expr = serde_json::from_value(json).unwrap();
        assert_eq!(back, expr);
    }
}
