//! Operators on values: joining, arithmetic, comparison, containment.
//!
//! The arithmetic functions are partial; operand combinations they do not
//! cover surface as `InvalidOp` errors. Numeric widening follows
//! int ⊂ ratio ⊂ float.

use std::cmp::Ordering;

use crate::content::merge_text;
use crate::diag::{EvalError, EvalResult};
use crate::value::Value;

/// Join two values, as used when folding blocks and loop bodies.
///
/// `none` is the identity. Content joins by concatenation and absorbs the
/// other side through the content coercion. Everything else falls through to
/// [`add`].
pub fn join(lhs: Value, rhs: Value) -> EvalResult<Value> {
    use Value::*;
    Ok(match (lhs, rhs) {
        (a, None) => a,
        (None, b) => b,
        (Content(mut a), b) => {
            a.extend(b.into_content());
            Content(merge_text(a))
        }
        (a, Content(b)) => {
            let mut nodes = a.into_content();
            nodes.extend(b);
            Content(merge_text(nodes))
        }
        (a, b) => add(a, b)?,
    })
}

/// Unary plus.
pub fn pos(value: Value) -> EvalResult<Value> {
    use Value::*;
    match value {
        Int(_) | Float(_) | Ratio(_) | Angle(_) | Fraction(_) | Length(_) => Ok(value),
        v => Err(EvalError::invalid_op(format!("cannot apply '+' to {}", v.type_name()))),
    }
}

/// Unary negation.
pub fn neg(value: Value) -> EvalResult<Value> {
    use Value::*;
    match value {
        Int(v) => v
            .checked_neg()
            .map(Int)
            .ok_or_else(|| EvalError::invalid_op("integer overflow")),
        Float(v) => Ok(Float(-v)),
        Ratio(r) => Ok(Ratio(-r)),
        Angle(a) => Ok(Angle(-a)),
        Fraction(f) => Ok(Fraction(-f)),
        Length(l) => Ok(Length(l.negate())),
        v => Err(EvalError::invalid_op(format!("cannot apply '-' to {}", v.type_name()))),
    }
}

/// Logical negation; requires a boolean.
pub fn not(value: &Value) -> EvalResult<Value> {
    Ok(Value::Bool(!value.as_bool()?))
}

/// Addition.
pub fn add(lhs: Value, rhs: Value) -> EvalResult<Value> {
    use Value::*;
    Ok(match (lhs, rhs) {
        (a, None) => a,
        (None, b) => b,

        (Int(a), Int(b)) => Int(a
            .checked_add(b)
            .ok_or_else(|| EvalError::invalid_op("integer overflow"))?),
        (Int(a), Float(b)) => Float(a as f64 + b),
        (Float(a), Int(b)) => Float(a + b as f64),
        (Float(a), Float(b)) => Float(a + b),

        (Ratio(a), Ratio(b)) => Ratio(a + b),
        (Int(a), Ratio(b)) => Ratio(a as f64 + b),
        (Ratio(a), Int(b)) => Ratio(a + b as f64),
        (Ratio(a), Float(b)) => Float(a + b),
        (Float(a), Ratio(b)) => Float(a + b),

        (Angle(a), Angle(b)) => Angle(a + b),
        (Fraction(a), Fraction(b)) => Fraction(a + b),
        (Length(a), Length(b)) => Length(a.add(b)),

        // Componentwise merge; the left side wins on conflicts.
        (Alignment(a), Alignment(b)) => Alignment(a.merge(b)),

        (Str(a), Str(b)) => Str(a + &b),

        (Array(mut a), Array(b)) => {
            a.extend(b);
            Array(a)
        }
        (Dict(mut a), Dict(b)) => {
            a.extend(b);
            Dict(a)
        }
        (Content(mut a), Content(b)) => {
            a.extend(b);
            Content(merge_text(a))
        }
        (Content(mut a), Str(b)) => {
            a.push(crate::content::ContentNode::Text(b));
            Content(merge_text(a))
        }
        (Str(a), Content(mut b)) => {
            b.insert(0, crate::content::ContentNode::Text(a));
            Content(merge_text(b))
        }

        (a, b) => {
            return Err(EvalError::invalid_op(format!(
                "cannot add {} and {}",
                a.type_name(),
                b.type_name()
            )))
        }
    })
}

/// Subtraction.
pub fn sub(lhs: Value, rhs: Value) -> EvalResult<Value> {
    use Value::*;
    match (lhs, rhs) {
        (Int(a), Int(b)) => Ok(Int(a
            .checked_sub(b)
            .ok_or_else(|| EvalError::invalid_op("integer overflow"))?)),
        (Int(a), Float(b)) => Ok(Float(a as f64 - b)),
        (Float(a), Int(b)) => Ok(Float(a - b as f64)),
        (Float(a), Float(b)) => Ok(Float(a - b)),
        (Ratio(a), Ratio(b)) => Ok(Ratio(a - b)),
        (Int(a), Ratio(b)) => Ok(Ratio(a as f64 - b)),
        (Ratio(a), Int(b)) => Ok(Ratio(a - b as f64)),
        (Ratio(a), Float(b)) => Ok(Float(a - b)),
        (Float(a), Ratio(b)) => Ok(Float(a - b)),
        (Angle(a), Angle(b)) => Ok(Angle(a - b)),
        (Fraction(a), Fraction(b)) => Ok(Fraction(a - b)),
        (Length(a), Length(b)) => Ok(Length(a.add(b.negate()))),
        (a, b) => Err(EvalError::invalid_op(format!(
            "cannot subtract {} from {}",
            b.type_name(),
            a.type_name()
        ))),
    }
}

/// Multiplication.
pub fn mul(lhs: Value, rhs: Value) -> EvalResult<Value> {
    use Value::*;
    match (lhs, rhs) {
        (Int(a), Int(b)) => Ok(Int(a
            .checked_mul(b)
            .ok_or_else(|| EvalError::invalid_op("integer overflow"))?)),
        (Int(a), Float(b)) => Ok(Float(a as f64 * b)),
        (Float(a), Int(b)) => Ok(Float(a * b as f64)),
        (Float(a), Float(b)) => Ok(Float(a * b)),

        (Ratio(r), Int(n)) | (Int(n), Ratio(r)) => Ok(Ratio(r * n as f64)),
        (Ratio(r), Float(f)) | (Float(f), Ratio(r)) => Ok(Float(r * f)),

        (Angle(a), Int(n)) | (Int(n), Angle(a)) => Ok(Angle(a * n as f64)),
        (Angle(a), Float(f)) | (Float(f), Angle(a)) => Ok(Angle(a * f)),

        (Fraction(fr), Int(n)) | (Int(n), Fraction(fr)) => Ok(Fraction(fr * n as f64)),
        (Fraction(fr), Float(f)) | (Float(f), Fraction(fr)) => Ok(Fraction(fr * f)),

        (Length(l), Int(n)) | (Int(n), Length(l)) => Ok(Length(l.scale(n as f64))),
        (Length(l), Float(f)) | (Float(f), Length(l)) => Ok(Length(l.scale(f))),

        (Str(s), Int(n)) | (Int(n), Str(s)) => {
            let n = usize::try_from(n).map_err(|_| {
                EvalError::invalid_op("cannot repeat a string a negative number of times")
            })?;
            Ok(Str(s.repeat(n)))
        }
        (Array(items), Int(n)) | (Int(n), Array(items)) => {
            let n = usize::try_from(n).map_err(|_| {
                EvalError::invalid_op("cannot repeat an array a negative number of times")
            })?;
            let mut out = Vec::with_capacity(items.len() * n);
            for _ in 0..n {
                out.extend(items.iter().cloned());
            }
            Ok(Array(out))
        }

        (a, b) => Err(EvalError::invalid_op(format!(
            "cannot multiply {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

/// Division. Integer division widens to float; dividing by zero fails.
pub fn div(lhs: Value, rhs: Value) -> EvalResult<Value> {
    use Value::*;
    let denom = match &rhs {
        Int(0) => return Err(EvalError::div_zero()),
        Float(f) | Ratio(f) if *f == 0.0 => return Err(EvalError::div_zero()),
        Int(n) => *n as f64,
        Float(f) | Ratio(f) => *f,
        v => {
            return Err(EvalError::invalid_op(format!(
                "cannot divide by {}",
                v.type_name()
            )))
        }
    };
    match lhs {
        Int(a) => Ok(Float(a as f64 / denom)),
        Float(a) => Ok(Float(a / denom)),
        Ratio(a) => Ok(Ratio(a / denom)),
        Angle(a) => Ok(Angle(a / denom)),
        Fraction(a) => Ok(Fraction(a / denom)),
        Length(l) => Ok(Length(l.scale(1.0 / denom))),
        a => Err(EvalError::invalid_op(format!(
            "cannot divide {} by {}",
            a.type_name(),
            rhs.type_name()
        ))),
    }
}

/// Exponentiation. Two integers produce an integer through the floor of the
/// double-precision power; any other numeric mix produces a float.
pub fn pow(lhs: Value, rhs: Value) -> EvalResult<Value> {
    use Value::*;
    match (&lhs, &rhs) {
        (Int(a), Int(b)) => Ok(Int((*a as f64).powf(*b as f64).floor() as i64)),
        _ => {
            let a = lhs.as_float().map_err(|_| {
                EvalError::invalid_op(format!("cannot exponentiate {}", lhs.type_name()))
            })?;
            let b = rhs.as_float().map_err(|_| {
                EvalError::invalid_op(format!("cannot exponentiate by {}", rhs.type_name()))
            })?;
            Ok(Float(a.powf(b)))
        }
    }
}

/// Three-valued comparison. `None` means the operands are unordered, which
/// equality treats as "not equal" and the ordering operators treat as an
/// error.
pub fn compare(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    use Value::*;
    match (lhs, rhs) {
        (Int(a), Int(b)) => Some(a.cmp(b)),
        (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
        (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
        (Float(a), Float(b)) => a.partial_cmp(b),
        (Ratio(a), Ratio(b)) => a.partial_cmp(b),
        (Int(a), Ratio(b)) => (*a as f64).partial_cmp(b),
        (Ratio(a), Int(b)) => a.partial_cmp(&(*b as f64)),
        (Ratio(a), Float(b)) => a.partial_cmp(b),
        (Float(a), Ratio(b)) => a.partial_cmp(b),
        (Str(a), Str(b)) => Some(a.cmp(b)),
        (Bool(a), Bool(b)) => Some(a.cmp(b)),
        (Angle(a), Angle(b)) => a.partial_cmp(b),
        (Fraction(a), Fraction(b)) => a.partial_cmp(b),
        (None, None) | (Auto, Auto) => Some(Ordering::Equal),
        _ => Option::None,
    }
}

fn ordered(lhs: &Value, rhs: &Value) -> EvalResult<Ordering> {
    compare(lhs, rhs).ok_or_else(|| {
        EvalError::invalid_op(format!(
            "cannot compare {} with {}",
            lhs.type_name(),
            rhs.type_name()
        ))
    })
}

pub fn lt(lhs: &Value, rhs: &Value) -> EvalResult<bool> {
    Ok(ordered(lhs, rhs)? == Ordering::Less)
}

pub fn le(lhs: &Value, rhs: &Value) -> EvalResult<bool> {
    Ok(ordered(lhs, rhs)? != Ordering::Greater)
}

pub fn gt(lhs: &Value, rhs: &Value) -> EvalResult<bool> {
    Ok(ordered(lhs, rhs)? == Ordering::Greater)
}

pub fn ge(lhs: &Value, rhs: &Value) -> EvalResult<bool> {
    Ok(ordered(lhs, rhs)? != Ordering::Less)
}

/// The `in` operator: substring, regex match, array membership, dict key.
pub fn contains(item: &Value, container: &Value) -> EvalResult<bool> {
    use Value::*;
    match (item, container) {
        (Str(needle), Str(haystack)) => Ok(haystack.contains(needle.as_str())),
        (Regex(re), Str(haystack)) => Ok(re.is_match(haystack)),
        (v, Array(items)) => Ok(items.contains(v)),
        (Str(key), Dict(map)) => Ok(map.contains_key(key.as_str())),
        (_, c) => Err(EvalError::invalid_op(format!(
            "cannot check containment in {}",
            c.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentNode;
    use crate::value::WrappedRegex;

    #[test]
    fn add_widens_through_ratio() {
        assert_eq!(add(Value::Int(2), Value::Int(3)).unwrap(), Value::Int(5));
        assert_eq!(add(Value::Int(1), Value::Ratio(0.5)).unwrap(), Value::Ratio(1.5));
        assert_eq!(add(Value::Ratio(0.5), Value::Float(0.25)).unwrap(), Value::Float(0.75));
    }

    #[test]
    fn div_is_float_and_checked() {
        assert_eq!(div(Value::Int(10), Value::Int(4)).unwrap(), Value::Float(2.5));
        assert!(div(Value::Int(1), Value::Int(0)).is_err());
    }

    #[test]
    fn pow_int_int_floors() {
        assert_eq!(pow(Value::Int(2), Value::Int(10)).unwrap(), Value::Int(1024));
        assert_eq!(pow(Value::Int(2), Value::Float(0.5)).unwrap(), Value::Float(2f64.sqrt()));
    }

    #[test]
    fn join_coerces_through_content() {
        let content = Value::Content(vec![ContentNode::text("n = ")]);
        let joined = join(content, Value::Int(4)).unwrap();
        assert_eq!(joined, Value::Content(vec![ContentNode::text("n = 4")]));
    }

    #[test]
    fn join_none_identity() {
        assert_eq!(join(Value::None, Value::Int(1)).unwrap(), Value::Int(1));
        assert_eq!(join(Value::Int(1), Value::None).unwrap(), Value::Int(1));
    }

    #[test]
    fn unordered_comparison_fails_but_eq_is_false() {
        assert!(lt(&Value::Int(1), &Value::Str("a".into())).is_err());
        assert_ne!(Value::Int(1), Value::Str("a".into()));
        assert!(lt(&Value::Int(1), &Value::Int(2)).unwrap());
        assert!(ge(&Value::Str("b".into()), &Value::Str("a".into())).unwrap());
    }

    #[test]
    fn containment() {
        assert!(contains(&Value::Str("ell".into()), &Value::Str("hello".into())).unwrap());
        let re = Value::Regex(WrappedRegex(regex::Regex::new("l+").unwrap()));
        assert!(contains(&re, &Value::Str("hello".into())).unwrap());
        let arr = Value::Array(vec![Value::Int(1), Value::Int(2)]);
        assert!(contains(&Value::Int(2), &arr).unwrap());
        assert!(!contains(&Value::Int(3), &arr).unwrap());
    }

    #[test]
    fn alignment_addition_merges() {
        use crate::value::{Alignment, HorizAlign, VertAlign};
        let l = Value::Alignment(Alignment::horizontal(HorizAlign::Left));
        let t = Value::Alignment(Alignment::vertical(VertAlign::Top));
        let merged = add(l, t).unwrap();
        match merged {
            Value::Alignment(a) => {
                assert_eq!(a.horiz, Some(HorizAlign::Left));
                assert_eq!(a.vert, Some(VertAlign::Top));
            }
            _ => panic!("expected alignment"),
        }
    }
}
