//! The base library.
//!
//! The root frame of every evaluator is populated from [`base`]: element
//! constructors, a handful of utility functions, the `calc`, `math` and
//! `sym` modules, and the sandboxed `eval`.

use indexmap::IndexMap;

use crate::content::{ContentNode, Element};
use crate::diag::{EvalError, EvalResult};
use crate::module;
use crate::ops;
use crate::value::{
    Alignment, Args, Color, DateTime, Func, HorizAlign, Symbol, Value, VertAlign,
    WrappedRegex,
};

/// Build the base identifier map.
pub fn base() -> IndexMap<String, Value> {
    let mut scope = IndexMap::new();

    // Element constructors.
    for name in [
        "text", "parbreak", "linebreak", "strong", "emph", "raw", "heading",
        "equation", "ref", "link", "list", "enum", "terms",
    ] {
        scope.insert(name.to_string(), Value::Func(element_func(name)));
    }

    // Alignment constants.
    let horiz = [
        ("start", HorizAlign::Start),
        ("end", HorizAlign::End),
        ("left", HorizAlign::Left),
        ("center", HorizAlign::Center),
        ("right", HorizAlign::Right),
    ];
    for (name, align) in horiz {
        scope.insert(name.to_string(), Value::Alignment(Alignment::horizontal(align)));
    }
    let vert = [
        ("top", VertAlign::Top),
        ("horizon", VertAlign::Horizon),
        ("bottom", VertAlign::Bottom),
    ];
    for (name, align) in vert {
        scope.insert(name.to_string(), Value::Alignment(Alignment::vertical(align)));
    }

    // Utility functions.
    scope.insert("range".into(), Value::Func(Func::native("range", range)));
    scope.insert("str".into(), Value::Func(Func::native("str", to_str)));
    scope.insert("int".into(), Value::Func(Func::native("int", to_int)));
    scope.insert("float".into(), Value::Func(Func::native("float", to_float)));
    scope.insert("repr".into(), Value::Func(Func::native("repr", repr)));
    scope.insert("type".into(), Value::Func(Func::native("type", type_of)));
    scope.insert("rgb".into(), Value::Func(Func::native("rgb", rgb)));
    scope.insert("cmyk".into(), Value::Func(Func::native("cmyk", cmyk)));
    scope.insert("luma".into(), Value::Func(Func::native("luma", luma)));
    scope.insert("label".into(), Value::Func(Func::native("label", label)));
    scope.insert("regex".into(), Value::Func(Func::native("regex", regex_fn)));
    scope.insert("counter".into(), Value::Func(Func::native("counter", counter)));
    scope.insert("assert".into(), Value::Func(Func::native("assert", assert_fn)));
    scope.insert("panic".into(), Value::Func(Func::native("panic", panic_fn)));

    // `datetime` carries `today` in its scope, which reads the world clock.
    let mut datetime_scope = IndexMap::new();
    datetime_scope.insert(
        "today".to_string(),
        Value::Func(Func::native("today", |vm, _args| {
            Ok(Value::DateTime(DateTime(vm.world().now())))
        })),
    );
    scope.insert(
        "datetime".into(),
        Value::Func(Func::native("datetime", datetime).with_scope(datetime_scope)),
    );

    scope.insert(
        "eval".into(),
        Value::Func(Func::native("eval", |_vm, args| module::eval_str(args))),
    );

    scope.insert("calc".into(), Value::Module("calc".into(), calc_module()));
    scope.insert("math".into(), Value::Module("math".into(), math_module()));
    scope.insert("sym".into(), Value::Module("sym".into(), sym_module()));

    scope
}

// ============================================================================
// Element constructors
// ============================================================================

/// Positional field names and the optional variadic collector for an
/// element.
fn elem_spec(name: &str) -> (&'static [&'static str], Option<&'static str>) {
    match name {
        "text" | "raw" => (&["text"], None),
        "strong" | "emph" | "heading" | "equation" => (&["body"], None),
        "frac" => (&["num", "denom"], None),
        "attach" => (&["base"], None),
        "accent" => (&["base", "accent"], None),
        "math.lr" => (&["body"], None),
        "ref" => (&["label"], None),
        "link" => (&["target", "body"], None),
        "list" | "enum" | "terms" => (&[], Some("items")),
        _ => (&[], None),
    }
}

/// The constructor function for the element `name`.
pub(crate) fn element_func(name: &str) -> Func {
    let elem = name.to_string();
    Func::element(name, move |_vm, args| construct_element(&elem, args))
}

fn construct_element(name: &str, mut args: Args) -> EvalResult<Value> {
    // Unstyled text stays plain so runs of text only become elements once
    // set/show styling gives them fields.
    if name == "text" {
        return construct_text(args);
    }

    let (positional, variadic) = elem_spec(name);
    let mut element = Element::new(name);
    for field in positional {
        if let Some(value) = args.take_front() {
            element.fields.insert(field.to_string(), value);
        }
    }
    if let Some(collector) = variadic {
        if !args.pos.is_empty() {
            element
                .fields
                .insert(collector.to_string(), Value::Array(std::mem::take(&mut args.pos)));
        }
    } else if let Some(extra) = args.pos.first() {
        return Err(EvalError::argument(format!(
            "unexpected argument to {}: {}",
            name,
            extra.repr()
        )));
    }
    for (field, value) in args.named {
        element.fields.insert(field, value);
    }
    Ok(Value::Content(vec![ContentNode::Elem(element)]))
}

fn construct_text(mut args: Args) -> EvalResult<Value> {
    let text = match args.take_front().or_else(|| args.take_named("text")) {
        Some(Value::Str(s)) => s,
        Some(Value::Content(nodes)) => {
            nodes.iter().map(|n| n.plain_text()).collect()
        }
        Some(v) => v.display(),
        None => String::new(),
    };
    if args.named.is_empty() {
        if text.is_empty() {
            return Ok(Value::Content(Vec::new()));
        }
        return Ok(Value::Content(vec![ContentNode::Text(text)]));
    }
    let mut element = Element::new("text");
    element.fields.insert("text".to_string(), Value::Str(text));
    for (field, value) in args.named {
        element.fields.insert(field, value);
    }
    Ok(Value::Content(vec![ContentNode::Elem(element)]))
}

// ============================================================================
// Utility functions
// ============================================================================

fn range(_vm: &mut crate::vm::Vm, mut args: Args) -> EvalResult<Value> {
    let first = args.expect_front("end")?.as_int()?;
    let (start, end) = match args.take_front() {
        Some(second) => (first, second.as_int()?),
        None => (0, first),
    };
    let step = match args.take_named("step") {
        Some(v) => v.as_int()?,
        None => 1,
    };
    if step == 0 {
        return Err(EvalError::argument("step must not be zero"));
    }
    let mut out = Vec::new();
    let mut current = start;
    while (step > 0 && current < end) || (step < 0 && current > end) {
        out.push(Value::Int(current));
        current += step;
    }
    Ok(Value::Array(out))
}

fn to_str(_vm: &mut crate::vm::Vm, mut args: Args) -> EvalResult<Value> {
    let value = args.expect_front("value")?;
    match value {
        Value::Str(s) => Ok(Value::Str(s)),
        Value::Int(_)
        | Value::Float(_)
        | Value::Ratio(_)
        | Value::Bool(_)
        | Value::Label(_)
        | Value::Symbol(_)
        | Value::Length(_)
        | Value::Angle(_)
        | Value::Fraction(_)
        | Value::Content(_) => Ok(Value::Str(value.display())),
        v => Err(EvalError::type_mismatch("castable to str", v.type_name())),
    }
}

fn to_int(_vm: &mut crate::vm::Vm, mut args: Args) -> EvalResult<Value> {
    let value = args.expect_front("value")?;
    match value {
        Value::Int(i) => Ok(Value::Int(i)),
        Value::Float(f) => Ok(Value::Int(f as i64)),
        Value::Bool(b) => Ok(Value::Int(b as i64)),
        Value::Str(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| EvalError::argument(format!("invalid integer: {s:?}"))),
        v => Err(EvalError::type_mismatch("castable to int", v.type_name())),
    }
}

fn to_float(_vm: &mut crate::vm::Vm, mut args: Args) -> EvalResult<Value> {
    let value = args.expect_front("value")?;
    match value {
        Value::Str(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| EvalError::argument(format!("invalid float: {s:?}"))),
        v => v.as_float().map(Value::Float),
    }
}

fn repr(_vm: &mut crate::vm::Vm, mut args: Args) -> EvalResult<Value> {
    Ok(Value::Str(args.expect_front("value")?.repr()))
}

fn type_of(_vm: &mut crate::vm::Vm, mut args: Args) -> EvalResult<Value> {
    Ok(Value::Str(args.expect_front("value")?.type_name().to_string()))
}

fn color_component(value: Value) -> EvalResult<f64> {
    match value {
        Value::Int(n) => Ok((n as f64 / 255.0).clamp(0.0, 1.0)),
        Value::Ratio(r) => Ok(r.clamp(0.0, 1.0)),
        Value::Float(f) => Ok(f.clamp(0.0, 1.0)),
        v => Err(EvalError::type_mismatch("int or ratio", v.type_name())),
    }
}

fn rgb(_vm: &mut crate::vm::Vm, mut args: Args) -> EvalResult<Value> {
    if args.pos.len() == 1 {
        let hex = args.expect_front("hex string")?;
        let hex = hex.as_str()?;
        return Color::from_hex(hex)
            .map(Value::Color)
            .ok_or_else(|| EvalError::argument(format!("invalid hex color: {hex:?}")));
    }
    let r = color_component(args.expect_front("red")?)?;
    let g = color_component(args.expect_front("green")?)?;
    let b = color_component(args.expect_front("blue")?)?;
    Ok(Value::Color(Color::Rgb { r, g, b }))
}

fn cmyk(_vm: &mut crate::vm::Vm, mut args: Args) -> EvalResult<Value> {
    let c = color_component(args.expect_front("cyan")?)?;
    let m = color_component(args.expect_front("magenta")?)?;
    let y = color_component(args.expect_front("yellow")?)?;
    let k = color_component(args.expect_front("key")?)?;
    Ok(Value::Color(Color::Cmyk { c, m, y, k }))
}

fn luma(_vm: &mut crate::vm::Vm, mut args: Args) -> EvalResult<Value> {
    let l = color_component(args.expect_front("lightness")?)?;
    Ok(Value::Color(Color::Luma(l)))
}

fn label(_vm: &mut crate::vm::Vm, mut args: Args) -> EvalResult<Value> {
    Ok(Value::Label(args.expect_front("name")?.as_str()?.to_string()))
}

fn regex_fn(_vm: &mut crate::vm::Vm, mut args: Args) -> EvalResult<Value> {
    let pattern = args.expect_front("pattern")?.as_str()?.to_string();
    regex::Regex::new(&pattern)
        .map(|re| Value::Regex(WrappedRegex(re)))
        .map_err(|e| EvalError::argument(format!("invalid regex: {e}")))
}

fn counter(_vm: &mut crate::vm::Vm, mut args: Args) -> EvalResult<Value> {
    match args.expect_front("key")? {
        Value::Str(key) => Ok(Value::Counter(key)),
        Value::Label(key) => Ok(Value::Counter(key)),
        v => Err(EvalError::type_mismatch("string or label", v.type_name())),
    }
}

fn assert_fn(_vm: &mut crate::vm::Vm, mut args: Args) -> EvalResult<Value> {
    let condition = args.expect_front("condition")?.as_bool()?;
    if condition {
        return Ok(Value::None);
    }
    match args.take_named("message") {
        Some(message) => Err(EvalError::invalid_op(format!(
            "assertion failed: {}",
            message.display()
        ))),
        None => Err(EvalError::invalid_op("assertion failed")),
    }
}

fn panic_fn(_vm: &mut crate::vm::Vm, args: Args) -> EvalResult<Value> {
    let parts: Vec<String> = args.pos.iter().map(|v| v.repr()).collect();
    Err(EvalError::invalid_op(format!(
        "panicked with: {}",
        parts.join(", ")
    )))
}

fn datetime(_vm: &mut crate::vm::Vm, mut args: Args) -> EvalResult<Value> {
    let mut take = |name: &str, default: i64| -> EvalResult<i64> {
        match args.take_named(name) {
            Some(v) => v.as_int(),
            None => Ok(default),
        }
    };
    let year = take("year", 1970)?;
    let month = take("month", 1)?;
    let day = take("day", 1)?;
    let hour = take("hour", 0)?;
    let minute = take("minute", 0)?;
    let second = take("second", 0)?;
    let date = chrono::NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
        .ok_or_else(|| EvalError::argument("invalid date"))?;
    let time = chrono::NaiveTime::from_hms_opt(hour as u32, minute as u32, second as u32)
        .ok_or_else(|| EvalError::argument("invalid time"))?;
    Ok(Value::DateTime(DateTime(date.and_time(time))))
}

// ============================================================================
// Modules
// ============================================================================

fn calc_module() -> IndexMap<String, Value> {
    let mut module = IndexMap::new();
    let mut insert = |name: &str,
                      f: fn(&mut crate::vm::Vm, Args) -> EvalResult<Value>| {
        module.insert(name.to_string(), Value::Func(Func::native(name, f)));
    };
    insert("abs", calc_abs);
    insert("pow", calc_pow);
    insert("rem", calc_rem);
    insert("min", calc_min);
    insert("max", calc_max);
    insert("floor", calc_floor);
    insert("ceil", calc_ceil);
    insert("round", calc_round);
    module
}

fn calc_abs(_vm: &mut crate::vm::Vm, mut args: Args) -> EvalResult<Value> {
    match args.expect_front("value")? {
        Value::Int(n) => Ok(Value::Int(n.abs())),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        Value::Ratio(r) => Ok(Value::Ratio(r.abs())),
        Value::Angle(a) => Ok(Value::Angle(a.abs())),
        Value::Fraction(f) => Ok(Value::Fraction(f.abs())),
        v => Err(EvalError::type_mismatch("numeric value", v.type_name())),
    }
}

fn calc_pow(_vm: &mut crate::vm::Vm, mut args: Args) -> EvalResult<Value> {
    let base = args.expect_front("base")?;
    let exponent = args.expect_front("exponent")?;
    ops::pow(base, exponent)
}

fn calc_rem(_vm: &mut crate::vm::Vm, mut args: Args) -> EvalResult<Value> {
    let lhs = args.expect_front("dividend")?;
    let rhs = args.expect_front("divisor")?;
    match (lhs, rhs) {
        (Value::Int(_), Value::Int(0)) => Err(EvalError::div_zero()),
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a % b)),
        (a, b) => {
            let b = b.as_float()?;
            if b == 0.0 {
                return Err(EvalError::div_zero());
            }
            Ok(Value::Float(a.as_float()? % b))
        }
    }
}

fn calc_extremum(mut args: Args, want_max: bool) -> EvalResult<Value> {
    let mut best = args.expect_front("value")?;
    for candidate in std::mem::take(&mut args.pos) {
        let ordering = ops::compare(&candidate, &best).ok_or_else(|| {
            EvalError::invalid_op(format!(
                "cannot compare {} with {}",
                candidate.type_name(),
                best.type_name()
            ))
        })?;
        let replace = if want_max {
            ordering == std::cmp::Ordering::Greater
        } else {
            ordering == std::cmp::Ordering::Less
        };
        if replace {
            best = candidate;
        }
    }
    Ok(best)
}

fn calc_min(_vm: &mut crate::vm::Vm, args: Args) -> EvalResult<Value> {
    calc_extremum(args, false)
}

fn calc_max(_vm: &mut crate::vm::Vm, args: Args) -> EvalResult<Value> {
    calc_extremum(args, true)
}

fn calc_floor(_vm: &mut crate::vm::Vm, mut args: Args) -> EvalResult<Value> {
    match args.expect_front("value")? {
        Value::Int(n) => Ok(Value::Int(n)),
        v => Ok(Value::Int(v.as_float()?.floor() as i64)),
    }
}

fn calc_ceil(_vm: &mut crate::vm::Vm, mut args: Args) -> EvalResult<Value> {
    match args.expect_front("value")? {
        Value::Int(n) => Ok(Value::Int(n)),
        v => Ok(Value::Int(v.as_float()?.ceil() as i64)),
    }
}

fn calc_round(_vm: &mut crate::vm::Vm, mut args: Args) -> EvalResult<Value> {
    match args.expect_front("value")? {
        Value::Int(n) => Ok(Value::Int(n)),
        v => Ok(Value::Int(v.as_float()?.round() as i64)),
    }
}

fn math_module() -> IndexMap<String, Value> {
    let mut module = IndexMap::new();
    module.insert("lr".to_string(), Value::Func(element_func("math.lr")));
    for name in ["frac", "attach", "alignpoint", "accent"] {
        module.insert(name.to_string(), Value::Func(element_func(name)));
    }
    module
}

fn sym_module() -> IndexMap<String, Value> {
    let mut module = IndexMap::new();
    let mut insert = |name: &str, symbol: Symbol| {
        module.insert(name.to_string(), Value::Symbol(symbol));
    };

    insert("alpha", Symbol::new("α"));
    insert("beta", Symbol::new("β"));
    insert("gamma", Symbol::new("γ"));
    insert("pi", Symbol::new("π"));
    insert("infinity", Symbol::new("∞"));
    insert("prime", Symbol::new("′"));

    insert("plus", Symbol::new("+").variant(&["minus"], "±"));
    insert(
        "arrow",
        Symbol::new("→")
            .variant(&["l"], "←")
            .variant(&["t"], "↑")
            .variant(&["b"], "↓")
            .variant(&["double"], "⇒")
            .variant(&["l", "double"], "⇐"),
    );
    insert("eq", Symbol::new("=").variant(&["not"], "≠"));
    insert("lt", Symbol::new("<").variant(&["eq"], "≤"));
    insert("gt", Symbol::new(">").variant(&["eq"], "≥"));

    insert("hat", Symbol::new("\u{0302}").accent());
    insert("tilde", Symbol::new("\u{0303}").accent());
    insert("dot", Symbol::new("\u{0307}").accent());
    insert("acute", Symbol::new("\u{0301}").accent());
    insert("grave", Symbol::new("\u{0300}").accent());

    module
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;
    use crate::world::NoopWorld;
    use std::sync::Arc;

    fn vm() -> Vm {
        Vm::new(Arc::new(NoopWorld), "test")
    }

    #[test]
    fn base_has_required_modules() {
        let scope = base();
        assert!(matches!(scope.get("math"), Some(Value::Module(_, _))));
        assert!(matches!(scope.get("sym"), Some(Value::Module(_, _))));
        assert!(matches!(scope.get("eval"), Some(Value::Func(_))));
    }

    #[test]
    fn range_variants() {
        let mut vm = vm();
        let out = range(&mut vm, Args::from_values(vec![Value::Int(3)])).unwrap();
        assert_eq!(
            out,
            Value::Array(vec![Value::Int(0), Value::Int(1), Value::Int(2)])
        );
        let mut args = Args::from_values(vec![Value::Int(5), Value::Int(1)]);
        args.insert("step", Value::Int(-2));
        let out = range(&mut vm, args).unwrap();
        assert_eq!(out, Value::Array(vec![Value::Int(5), Value::Int(3)]));
    }

    #[test]
    fn unstyled_text_stays_plain() {
        let mut args = Args::new();
        args.push(Value::Str("hi".into()));
        let out = construct_text(args).unwrap();
        assert_eq!(out, Value::Content(vec![ContentNode::text("hi")]));

        let mut args = Args::new();
        args.push(Value::Str("hi".into()));
        args.insert("size", Value::Int(12));
        let out = construct_text(args).unwrap();
        let Value::Content(nodes) = out else { panic!() };
        let ContentNode::Elem(elem) = &nodes[0] else { panic!("expected element") };
        assert_eq!(elem.name, "text");
        assert_eq!(elem.field("size"), Some(&Value::Int(12)));
    }

    #[test]
    fn element_construction_maps_positionals() {
        let mut args = Args::new();
        args.push(Value::Str("code".into()));
        args.insert("block", Value::Bool(true));
        let out = construct_element("raw", args).unwrap();
        let Value::Content(nodes) = out else { panic!() };
        let ContentNode::Elem(elem) = &nodes[0] else { panic!("expected element") };
        assert_eq!(elem.field("text"), Some(&Value::Str("code".into())));
        assert_eq!(elem.field("block"), Some(&Value::Bool(true)));
    }

    #[test]
    fn calc_pow_and_rem() {
        let mut vm = vm();
        assert_eq!(
            calc_pow(&mut vm, Args::from_values(vec![Value::Int(2), Value::Int(8)]))
                .unwrap(),
            Value::Int(256)
        );
        assert_eq!(
            calc_rem(&mut vm, Args::from_values(vec![Value::Int(7), Value::Int(3)]))
                .unwrap(),
            Value::Int(1)
        );
    }

    #[test]
    fn arrow_symbol_variants() {
        let module = sym_module();
        let Some(Value::Symbol(arrow)) = module.get("arrow") else { panic!() };
        assert_eq!(arrow.modify("l").unwrap().text, "←");
        assert_eq!(arrow.modify("double").unwrap().modify("l").unwrap().text, "⇐");
    }
}
