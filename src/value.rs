//! The value universe of the dialect.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use regex::Regex;
use typst_syntax::SyntaxNode;

use crate::content::ContentNode;
use crate::diag::{EvalError, EvalResult};
use crate::scope::Scopes;
use crate::show::Selector;
use crate::vm::Vm;

// ============================================================================
// Lengths
// ============================================================================

/// Absolute and font-relative length units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthUnit {
    Pt,
    Mm,
    Cm,
    In,
    Em,
}

impl LengthUnit {
    pub fn suffix(&self) -> &'static str {
        match self {
            LengthUnit::Pt => "pt",
            LengthUnit::Mm => "mm",
            LengthUnit::Cm => "cm",
            LengthUnit::In => "in",
            LengthUnit::Em => "em",
        }
    }
}

/// A length. Mixed-unit sums stay symbolic since `em` cannot be resolved
/// without a font context.
#[derive(Debug, Clone, PartialEq)]
pub enum Length {
    Exact(f64, LengthUnit),
    Sum(Box<Length>, Box<Length>),
}

impl Length {
    pub fn exact(value: f64, unit: LengthUnit) -> Self {
        Length::Exact(value, unit)
    }

    pub fn negate(&self) -> Self {
        match self {
            Length::Exact(v, u) => Length::Exact(-v, *u),
            Length::Sum(a, b) => Length::Sum(Box::new(a.negate()), Box::new(b.negate())),
        }
    }

    pub fn scale(&self, factor: f64) -> Self {
        match self {
            Length::Exact(v, u) => Length::Exact(v * factor, *u),
            Length::Sum(a, b) => {
                Length::Sum(Box::new(a.scale(factor)), Box::new(b.scale(factor)))
            }
        }
    }

    /// Add two lengths, merging when the units agree.
    pub fn add(self, other: Length) -> Self {
        match (self, other) {
            (Length::Exact(a, u1), Length::Exact(b, u2)) if u1 == u2 => {
                Length::Exact(a + b, u1)
            }
            (a, b) => Length::Sum(Box::new(a), Box::new(b)),
        }
    }
}

impl fmt::Display for Length {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Length::Exact(v, u) => write!(f, "{}{}", format_float(*v), u.suffix()),
            Length::Sum(a, b) => write!(f, "{} + {}", a, b),
        }
    }
}

// ============================================================================
// Colors
// ============================================================================

/// A color in one of three spaces. Components are 0.0–1.0.
#[derive(Debug, Clone, PartialEq)]
pub enum Color {
    Rgb { r: f64, g: f64, b: f64 },
    Cmyk { c: f64, m: f64, y: f64, k: f64 },
    Luma(f64),
}

impl Color {
    pub fn rgb8(r: u8, g: u8, b: u8) -> Self {
        Color::Rgb {
            r: r as f64 / 255.0,
            g: g as f64 / 255.0,
            b: b as f64 / 255.0,
        }
    }

    /// Parse `#rgb`, `#rrggbb` (leading `#` optional).
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.trim_start_matches('#');
        let parse = |s: &str| u8::from_str_radix(s, 16).ok();
        match hex.len() {
            3 => Some(Color::rgb8(
                parse(&hex[0..1].repeat(2))?,
                parse(&hex[1..2].repeat(2))?,
                parse(&hex[2..3].repeat(2))?,
            )),
            6 => Some(Color::rgb8(
                parse(&hex[0..2])?,
                parse(&hex[2..4])?,
                parse(&hex[4..6])?,
            )),
            _ => None,
        }
    }

    fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        match self {
            Color::Rgb { r, g, b } => Color::Rgb { r: f(*r), g: f(*g), b: f(*b) },
            Color::Cmyk { c, m, y, k } => {
                Color::Cmyk { c: f(*c), m: f(*m), y: f(*y), k: f(*k) }
            }
            Color::Luma(l) => Color::Luma(f(*l)),
        }
    }

    /// Scale every component towards black.
    pub fn darken(&self, amount: f64) -> Self {
        let keep = 1.0 - amount.clamp(0.0, 1.0);
        self.map(|x| x * keep)
    }

    /// Move every component towards white.
    pub fn lighten(&self, amount: f64) -> Self {
        let amount = amount.clamp(0.0, 1.0);
        self.map(|x| x + (1.0 - x) * amount)
    }

    /// Invert componentwise in the color's own space.
    pub fn negate(&self) -> Self {
        self.map(|x| 1.0 - x)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pct = |x: f64| (x * 100.0).round() as i64;
        match self {
            Color::Rgb { r, g, b } => write!(
                f,
                "rgb({}, {}, {})",
                (r * 255.0).round() as u8,
                (g * 255.0).round() as u8,
                (b * 255.0).round() as u8
            ),
            Color::Cmyk { c, m, y, k } => {
                write!(f, "cmyk({}%, {}%, {}%, {}%)", pct(*c), pct(*m), pct(*y), pct(*k))
            }
            Color::Luma(l) => write!(f, "luma({}%)", pct(*l)),
        }
    }
}

// ============================================================================
// Alignment
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HorizAlign {
    Start,
    End,
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertAlign {
    Top,
    Horizon,
    Bottom,
}

/// A one- or two-dimensional alignment.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Alignment {
    pub horiz: Option<HorizAlign>,
    pub vert: Option<VertAlign>,
}

impl Alignment {
    pub fn horizontal(h: HorizAlign) -> Self {
        Self { horiz: Some(h), vert: None }
    }

    pub fn vertical(v: VertAlign) -> Self {
        Self { horiz: None, vert: Some(v) }
    }

    /// Componentwise merge; components of `self` win.
    pub fn merge(self, other: Alignment) -> Self {
        Self {
            horiz: self.horiz.or(other.horiz),
            vert: self.vert.or(other.vert),
        }
    }
}

impl fmt::Display for Alignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let horiz = self.horiz.map(|h| match h {
            HorizAlign::Start => "start",
            HorizAlign::End => "end",
            HorizAlign::Left => "left",
            HorizAlign::Center => "center",
            HorizAlign::Right => "right",
        });
        let vert = self.vert.map(|v| match v {
            VertAlign::Top => "top",
            VertAlign::Horizon => "horizon",
            VertAlign::Bottom => "bottom",
        });
        match (horiz, vert) {
            (Some(h), Some(v)) => write!(f, "{} + {}", h, v),
            (Some(h), None) => write!(f, "{}", h),
            (None, Some(v)) => write!(f, "{}", v),
            (None, None) => Ok(()),
        }
    }
}

// ============================================================================
// Symbols
// ============================================================================

/// A named symbol with modifier variants.
///
/// Variants are `(modifier set, text)` pairs. Modifier access filters the
/// variants to those carrying the modifier, strips it, and re-sorts so the
/// smallest remaining modifier set decides the symbol's text. Sorting is
/// stable, so ties resolve in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub text: String,
    pub accent: bool,
    pub variants: Vec<(Vec<String>, String)>,
}

impl Symbol {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), accent: false, variants: Vec::new() }
    }

    pub fn accent(mut self) -> Self {
        self.accent = true;
        self
    }

    pub fn variant(mut self, modifiers: &[&str], text: &str) -> Self {
        self.variants
            .push((modifiers.iter().map(|m| m.to_string()).collect(), text.to_string()));
        self
    }

    /// Apply a modifier, narrowing the variant set.
    pub fn modify(&self, modifier: &str) -> EvalResult<Symbol> {
        let mut filtered: Vec<(Vec<String>, String)> = self
            .variants
            .iter()
            .filter(|(mods, _)| mods.iter().any(|m| m == modifier))
            .map(|(mods, text)| {
                (mods.iter().filter(|m| *m != modifier).cloned().collect(), text.clone())
            })
            .collect();
        if filtered.is_empty() {
            return Err(EvalError::domain(format!(
                "symbol has no variant {modifier}"
            )));
        }
        filtered.sort_by_key(|(mods, _)| mods.len());
        Ok(Symbol {
            text: filtered[0].1.clone(),
            accent: self.accent,
            variants: filtered,
        })
    }
}

// ============================================================================
// Datetimes
// ============================================================================

/// A datetime value, as produced by `datetime` and `datetime.today`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DateTime(pub NaiveDateTime);

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S"))
    }
}

// ============================================================================
// Regex wrapper
// ============================================================================

/// A regex comparing equal by pattern text.
#[derive(Debug, Clone)]
pub struct WrappedRegex(pub Regex);

impl PartialEq for WrappedRegex {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

impl std::ops::Deref for WrappedRegex {
    type Target = Regex;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ============================================================================
// Arguments
// ============================================================================

/// Collected call arguments: a positional sequence and an ordered named map.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Args {
    pub pos: Vec<Value>,
    pub named: IndexMap<String, Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(pos: Vec<Value>) -> Self {
        Self { pos, named: IndexMap::new() }
    }

    pub fn push(&mut self, value: Value) {
        self.pos.push(value);
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.named.insert(name.into(), value);
    }

    /// Append `other` after `self`. Positionals concatenate; named entries
    /// from `other` win, updating in place so the original key position is
    /// preserved.
    pub fn chain(mut self, other: Args) -> Args {
        self.pos.extend(other.pos);
        for (k, v) in other.named {
            self.named.insert(k, v);
        }
        self
    }

    pub fn take_front(&mut self) -> Option<Value> {
        if self.pos.is_empty() {
            None
        } else {
            Some(self.pos.remove(0))
        }
    }

    pub fn take_back(&mut self) -> Option<Value> {
        self.pos.pop()
    }

    pub fn expect_front(&mut self, what: &str) -> EvalResult<Value> {
        self.take_front()
            .ok_or_else(|| EvalError::argument(format!("missing argument: {what}")))
    }

    pub fn take_named(&mut self, name: &str) -> Option<Value> {
        self.named.shift_remove(name)
    }

    pub fn is_empty(&self) -> bool {
        self.pos.is_empty() && self.named.is_empty()
    }
}

// ============================================================================
// Functions
// ============================================================================

/// The signature shared by all natively implemented functions and methods.
pub type NativeImpl = dyn Fn(&mut Vm, Args) -> EvalResult<Value> + Send + Sync;

/// A natively implemented function body.
pub struct NativeFunc {
    pub body: Box<NativeImpl>,
}

impl fmt::Debug for NativeFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<native>")
    }
}

/// A user-defined function: the closure syntax node plus the environment
/// snapshot taken at its definition point. The node is re-cast to
/// `ast::Closure` at every call.
#[derive(Debug, Clone)]
pub struct Closure {
    pub name: Option<String>,
    pub node: SyntaxNode,
    pub captured: Scopes,
}

/// How a function value is implemented.
#[derive(Debug, Clone)]
pub enum FuncRepr {
    Native(Arc<NativeFunc>),
    Closure(Arc<Closure>),
    /// A partial application: stored arguments are prepended on call.
    With(Arc<Func>, Args),
}

/// A callable value, optionally acting as an element constructor.
#[derive(Debug, Clone)]
pub struct Func {
    pub name: Option<String>,
    /// When set, calls to this function merge the active `set` defaults for
    /// the named element, and `show`/`where` selectors can target it.
    pub elem: Option<String>,
    pub repr: FuncRepr,
    /// Bindings reachable through field access on the function value.
    pub scope: IndexMap<String, Value>,
}

impl Func {
    pub fn native(
        name: impl Into<String>,
        body: impl Fn(&mut Vm, Args) -> EvalResult<Value> + Send + Sync + 'static,
    ) -> Self {
        Func {
            name: Some(name.into()),
            elem: None,
            repr: FuncRepr::Native(Arc::new(NativeFunc { body: Box::new(body) })),
            scope: IndexMap::new(),
        }
    }

    /// A native function that constructs the element `name`.
    pub fn element(
        name: impl Into<String>,
        body: impl Fn(&mut Vm, Args) -> EvalResult<Value> + Send + Sync + 'static,
    ) -> Self {
        let name = name.into();
        Func { elem: Some(name.clone()), ..Func::native(name, body) }
    }

    pub fn from_closure(closure: Closure) -> Self {
        let scope = closure.captured.flatten();
        Func {
            name: closure.name.clone(),
            elem: None,
            repr: FuncRepr::Closure(Arc::new(closure)),
            scope,
        }
    }

    pub fn with_scope(mut self, scope: IndexMap<String, Value>) -> Self {
        self.scope = scope;
        self
    }

    /// Partially apply this function.
    pub fn applied(self, args: Args) -> Self {
        Func {
            name: self.name.clone(),
            elem: self.elem.clone(),
            scope: IndexMap::new(),
            repr: FuncRepr::With(Arc::new(self), args),
        }
    }
}

impl PartialEq for Func {
    fn eq(&self, other: &Self) -> bool {
        match (&self.repr, &other.repr) {
            (FuncRepr::Native(a), FuncRepr::Native(b)) => Arc::ptr_eq(a, b),
            (FuncRepr::Closure(a), FuncRepr::Closure(b)) => Arc::ptr_eq(a, b),
            (FuncRepr::With(a, x), FuncRepr::With(b, y)) => a == b && x == y,
            _ => false,
        }
    }
}

// ============================================================================
// The value enum
// ============================================================================

/// A computational value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    None,
    Auto,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// A relative amount; `50%` is `Ratio(0.5)`.
    Ratio(f64),
    Str(String),
    /// An angle in degrees.
    Angle(f64),
    /// A flexible-space fraction, `1fr`.
    Fraction(f64),
    Length(Length),
    Color(Color),
    Alignment(Alignment),
    Symbol(Symbol),
    Regex(WrappedRegex),
    DateTime(DateTime),
    Label(String),
    Content(Vec<ContentNode>),
    Array(Vec<Value>),
    Dict(IndexMap<String, Value>),
    Func(Func),
    Module(String, IndexMap<String, Value>),
    Selector(Selector),
    Counter(String),
    Args(Args),
}

/// Value kind tags, mostly for error messages and `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValType {
    None,
    Auto,
    Bool,
    Int,
    Float,
    Ratio,
    Str,
    Angle,
    Fraction,
    Length,
    Color,
    Alignment,
    Symbol,
    Regex,
    DateTime,
    Label,
    Content,
    Array,
    Dict,
    Function,
    Module,
    Selector,
    Counter,
    Arguments,
}

impl ValType {
    pub fn name(&self) -> &'static str {
        match self {
            ValType::None => "none",
            ValType::Auto => "auto",
            ValType::Bool => "bool",
            ValType::Int => "int",
            ValType::Float => "float",
            ValType::Ratio => "ratio",
            ValType::Str => "str",
            ValType::Angle => "angle",
            ValType::Fraction => "fraction",
            ValType::Length => "length",
            ValType::Color => "color",
            ValType::Alignment => "alignment",
            ValType::Symbol => "symbol",
            ValType::Regex => "regex",
            ValType::DateTime => "datetime",
            ValType::Label => "label",
            ValType::Content => "content",
            ValType::Array => "array",
            ValType::Dict => "dictionary",
            ValType::Function => "function",
            ValType::Module => "module",
            ValType::Selector => "selector",
            ValType::Counter => "counter",
            ValType::Arguments => "arguments",
        }
    }
}

impl Value {
    pub fn ty(&self) -> ValType {
        match self {
            Value::None => ValType::None,
            Value::Auto => ValType::Auto,
            Value::Bool(_) => ValType::Bool,
            Value::Int(_) => ValType::Int,
            Value::Float(_) => ValType::Float,
            Value::Ratio(_) => ValType::Ratio,
            Value::Str(_) => ValType::Str,
            Value::Angle(_) => ValType::Angle,
            Value::Fraction(_) => ValType::Fraction,
            Value::Length(_) => ValType::Length,
            Value::Color(_) => ValType::Color,
            Value::Alignment(_) => ValType::Alignment,
            Value::Symbol(_) => ValType::Symbol,
            Value::Regex(_) => ValType::Regex,
            Value::DateTime(_) => ValType::DateTime,
            Value::Label(_) => ValType::Label,
            Value::Content(_) => ValType::Content,
            Value::Array(_) => ValType::Array,
            Value::Dict(_) => ValType::Dict,
            Value::Func(_) => ValType::Function,
            Value::Module(_, _) => ValType::Module,
            Value::Selector(_) => ValType::Selector,
            Value::Counter(_) => ValType::Counter,
            Value::Args(_) => ValType::Arguments,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.ty().name()
    }

    pub fn as_bool(&self) -> EvalResult<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            _ => Err(EvalError::type_mismatch("bool", self.type_name())),
        }
    }

    pub fn as_int(&self) -> EvalResult<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            _ => Err(EvalError::type_mismatch("int", self.type_name())),
        }
    }

    pub fn as_float(&self) -> EvalResult<f64> {
        match self {
            Value::Int(i) => Ok(*i as f64),
            Value::Float(f) => Ok(*f),
            Value::Ratio(r) => Ok(*r),
            _ => Err(EvalError::type_mismatch("float", self.type_name())),
        }
    }

    pub fn as_str(&self) -> EvalResult<&str> {
        match self {
            Value::Str(s) => Ok(s),
            _ => Err(EvalError::type_mismatch("str", self.type_name())),
        }
    }

    pub fn into_array(self) -> EvalResult<Vec<Value>> {
        match self {
            Value::Array(a) => Ok(a),
            v => Err(EvalError::type_mismatch("array", v.type_name())),
        }
    }

    pub fn into_func(self) -> EvalResult<Func> {
        match self {
            Value::Func(f) => Ok(f),
            v => Err(EvalError::type_mismatch("function", v.type_name())),
        }
    }

    /// The user-facing text of this value, as used by the content coercion.
    pub fn display(&self) -> String {
        match self {
            Value::None => String::new(),
            Value::Auto => "auto".into(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Ratio(r) => format!("{}%", format_float(r * 100.0)),
            Value::Str(s) => s.clone(),
            Value::Angle(a) => format!("{}deg", format_float(*a)),
            Value::Fraction(f) => format!("{}fr", format_float(*f)),
            Value::Length(l) => l.to_string(),
            Value::Color(c) => c.to_string(),
            Value::Alignment(a) => a.to_string(),
            Value::Symbol(s) => s.text.clone(),
            Value::Regex(r) => format!("regex(\"{}\")", r.as_str()),
            Value::DateTime(dt) => dt.to_string(),
            Value::Label(l) => format!("<{}>", l),
            Value::Content(nodes) => nodes.iter().map(|n| n.plain_text()).collect(),
            Value::Array(items) => {
                let inner: Vec<String> = items.iter().map(|v| v.repr()).collect();
                format!("({})", inner.join(", "))
            }
            Value::Dict(map) => {
                let inner: Vec<String> =
                    map.iter().map(|(k, v)| format!("{}: {}", k, v.repr())).collect();
                format!("({})", inner.join(", "))
            }
            Value::Func(f) => match &f.name {
                Some(name) => name.clone(),
                Option::None => "<function>".into(),
            },
            Value::Module(name, _) => format!("<module {}>", name),
            Value::Selector(_) => "<selector>".into(),
            Value::Counter(key) => format!("counter({:?})", key),
            Value::Args(_) => "<arguments>".into(),
        }
    }

    /// A source-like representation, used inside arrays and dictionaries.
    pub fn repr(&self) -> String {
        match self {
            Value::None => "none".into(),
            Value::Str(s) => format!("{:?}", s),
            Value::Label(l) => format!("<{}>", l),
            Value::Content(_) => format!("[{}]", self.display()),
            _ => self.display(),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (None, None) => true,
            (Auto, Auto) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Int(a), Float(b)) | (Float(b), Int(a)) => *a as f64 == *b,
            (Ratio(a), Ratio(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Angle(a), Angle(b)) => a == b,
            (Fraction(a), Fraction(b)) => a == b,
            (Length(a), Length(b)) => a == b,
            (Color(a), Color(b)) => a == b,
            (Alignment(a), Alignment(b)) => a == b,
            (Symbol(a), Symbol(b)) => a == b,
            (Regex(a), Regex(b)) => a == b,
            (DateTime(a), DateTime(b)) => a == b,
            (Label(a), Label(b)) => a == b,
            (Content(a), Content(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            (Dict(a), Dict(b)) => a == b,
            (Func(a), Func(b)) => a == b,
            (Module(a, x), Module(b, y)) => a == b && x == y,
            (Selector(a), Selector(b)) => a == b,
            (Counter(a), Counter(b)) => a == b,
            (Args(a), Args(b)) => a == b,
            _ => false,
        }
    }
}

/// Whole floats print without a fractional tail.
pub fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        format!("{}", f)
    }
}
