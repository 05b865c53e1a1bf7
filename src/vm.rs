//! The evaluator core.
//!
//! A [`Vm`] holds everything an evaluation needs: the scope stack, active
//! `set` defaults, show rules, counters, the math-mode flag, the control-flow
//! directive, and the world callbacks. Expressions are evaluated here;
//! markup streams live in [`crate::markup`].

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;
use typst_syntax::ast::{self, AstNode};

use crate::diag::{EvalError, EvalResult};
use crate::library;
use crate::methods;
use crate::ops;
use crate::scope::{ScopeKind, Scopes};
use crate::show::{Recipe, Selector, ShowRule};
use crate::styles::Styles;
use crate::value::{Args, Closure, Func, FuncRepr, Length, LengthUnit, Value};
use crate::world::World;

/// Guards against runaway evaluation.
#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub max_recursion_depth: usize,
    pub max_iterations: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self { max_recursion_depth: 64, max_iterations: 10_000 }
    }
}

/// A control-flow directive raised during evaluation.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    Break,
    Continue,
    Return(Option<Value>),
}

/// How a destructuring pattern binds its parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindMode {
    /// Insert into the innermost frame (`let`).
    Define,
    /// Write through the lvalue protocol (`(a, b) = …`).
    Assign,
}

/// The outcome of evaluating a show-rule header.
pub(crate) enum ShowBinding {
    /// A selector-keyed rule to register.
    Rule(ShowRule),
    /// A bare `show: body` that consumes everything after it.
    Everything(Value),
}

/// The evaluator.
pub struct Vm {
    pub(crate) scopes: Scopes,
    pub(crate) styles: Styles,
    pub(crate) show_rules: Vec<ShowRule>,
    pub(crate) counters: HashMap<String, i64>,
    pub(crate) math: bool,
    pub(crate) flow: Option<FlowEvent>,
    pub(crate) world: Arc<dyn World>,
    pub(crate) path: String,
    pub(crate) depth: usize,
    pub(crate) config: EvalConfig,
}

impl Vm {
    /// A fresh evaluator over the given world, with the base library in its
    /// root frame.
    pub fn new(world: Arc<dyn World>, path: impl Into<String>) -> Self {
        Self::with_config(world, path, EvalConfig::default())
    }

    pub fn with_config(
        world: Arc<dyn World>,
        path: impl Into<String>,
        config: EvalConfig,
    ) -> Self {
        Self {
            scopes: Scopes::with_base(library::base()),
            styles: Styles::new(),
            show_rules: Vec::new(),
            counters: HashMap::new(),
            math: false,
            flow: None,
            world,
            path: path.into(),
            depth: 0,
            config,
        }
    }

    pub fn world(&self) -> &Arc<dyn World> {
        &self.world
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    /// Evaluate one expression to a value.
    pub fn eval_expr(&mut self, expr: ast::Expr) -> EvalResult<Value> {
        let span = expr.span();
        let result = match expr {
            ast::Expr::None(_) => Ok(Value::None),
            ast::Expr::Auto(_) => Ok(Value::Auto),
            ast::Expr::Bool(b) => Ok(Value::Bool(b.get())),
            ast::Expr::Int(i) => Ok(Value::Int(i.get())),
            ast::Expr::Float(f) => Ok(Value::Float(f.get())),
            ast::Expr::Str(s) => Ok(Value::Str(s.get().to_string())),
            ast::Expr::Numeric(num) => self.eval_numeric(num),
            ast::Expr::Label(label) => Ok(Value::Label(label.get().to_string())),

            ast::Expr::Ident(ident) => self.eval_ident(ident),
            ast::Expr::MathIdent(ident) => {
                self.scopes.get_or_err(ident.get().as_str()).cloned()
            }
            ast::Expr::Array(array) => self.eval_array(array),
            ast::Expr::Dict(dict) => self.eval_dict(dict),

            ast::Expr::Code(block) => self.eval_code_block(block),
            ast::Expr::Content(block) => self.eval_content_block(block),
            ast::Expr::Parenthesized(paren) => self.eval_expr(paren.expr()),

            ast::Expr::Unary(unary) => self.eval_unary(unary),
            ast::Expr::Binary(binary) => self.eval_binary(binary),

            ast::Expr::FieldAccess(access) => self.eval_field_access(access),
            ast::Expr::FuncCall(call) => self.eval_func_call(call),
            ast::Expr::Closure(closure) => self.eval_closure(closure),

            ast::Expr::Let(binding) => self.eval_let(binding),
            ast::Expr::DestructAssign(assign) => self.eval_destruct_assign(assign),

            ast::Expr::Conditional(cond) => self.eval_conditional(cond),
            ast::Expr::While(w) => self.eval_while(w),
            ast::Expr::For(f) => self.eval_for(f),
            ast::Expr::Break(_) => {
                if self.flow.is_none() {
                    self.flow = Some(FlowEvent::Break);
                }
                Ok(Value::None)
            }
            ast::Expr::Continue(_) => {
                if self.flow.is_none() {
                    self.flow = Some(FlowEvent::Continue);
                }
                Ok(Value::None)
            }
            ast::Expr::Return(ret) => {
                let value = ret.body().map(|e| self.eval_expr(e)).transpose()?;
                if self.flow.is_none() {
                    self.flow = Some(FlowEvent::Return(value));
                }
                Ok(Value::None)
            }

            ast::Expr::Import(import) => self.eval_import(import),
            ast::Expr::Include(include) => self.eval_include(include),

            // Set and show are intercepted by the code and markup walkers;
            // anywhere else they are malformed.
            ast::Expr::Set(_) => Err(EvalError::invalid_op(
                "set is only allowed directly in code and content blocks",
            )),
            ast::Expr::Show(_) => Err(EvalError::invalid_op(
                "show is only allowed directly in code and content blocks",
            )),

            ast::Expr::Contextual(ctx) => self.eval_expr(ctx.body()),

            // Markup reached through an expression position evaluates as a
            // one-node content stream.
            other => self.eval_single_markup(other),
        };
        result.map_err(|e| e.or_span(span))
    }

    fn eval_numeric(&self, num: ast::Numeric) -> EvalResult<Value> {
        let (value, unit) = num.get();
        Ok(match unit {
            ast::Unit::Percent => Value::Ratio(value / 100.0),
            ast::Unit::Fr => Value::Fraction(value),
            ast::Unit::Deg => Value::Angle(value),
            ast::Unit::Rad => Value::Angle(value * 180.0 / std::f64::consts::PI),
            ast::Unit::Pt => Value::Length(Length::exact(value, LengthUnit::Pt)),
            ast::Unit::Mm => Value::Length(Length::exact(value, LengthUnit::Mm)),
            ast::Unit::Cm => Value::Length(Length::exact(value, LengthUnit::Cm)),
            ast::Unit::In => Value::Length(Length::exact(value, LengthUnit::In)),
            ast::Unit::Em => Value::Length(Length::exact(value, LengthUnit::Em)),
        })
    }

    fn eval_ident(&self, ident: ast::Ident) -> EvalResult<Value> {
        self.scopes.get_or_err(ident.get().as_str()).cloned()
    }

    fn eval_array(&mut self, array: ast::Array) -> EvalResult<Value> {
        let mut out = Vec::new();
        for item in array.items() {
            match item {
                ast::ArrayItem::Pos(expr) => out.push(self.eval_expr(expr)?),
                ast::ArrayItem::Spread(spread) => match self.eval_expr(spread.expr())? {
                    Value::None => {}
                    Value::Array(items) => out.extend(items),
                    v => {
                        return Err(EvalError::invalid_op(format!(
                            "cannot spread {} into array",
                            v.type_name()
                        )))
                    }
                },
            }
        }
        Ok(Value::Array(out))
    }

    fn eval_dict(&mut self, dict: ast::Dict) -> EvalResult<Value> {
        let mut out = indexmap::IndexMap::new();
        for item in dict.items() {
            match item {
                ast::DictItem::Named(named) => {
                    out.insert(named.name().get().to_string(), self.eval_expr(named.expr())?);
                }
                ast::DictItem::Keyed(keyed) => {
                    let key = self.eval_expr(keyed.key())?.as_str()?.to_string();
                    out.insert(key, self.eval_expr(keyed.expr())?);
                }
                ast::DictItem::Spread(spread) => match self.eval_expr(spread.expr())? {
                    Value::None => {}
                    Value::Dict(map) => out.extend(map),
                    v => {
                        return Err(EvalError::invalid_op(format!(
                            "cannot spread {} into dictionary",
                            v.type_name()
                        )))
                    }
                },
            }
        }
        Ok(Value::Dict(out))
    }

    // ========================================================================
    // Blocks
    // ========================================================================

    fn eval_code_block(&mut self, block: ast::CodeBlock) -> EvalResult<Value> {
        self.scopes.enter(ScopeKind::Block);
        let saved_styles = self.styles.clone();
        let result = self.eval_code_exprs(&mut block.body().exprs());
        self.styles = saved_styles;
        self.scopes.exit();
        result
    }

    /// Fold a stream of code expressions.
    ///
    /// The flow directive is cleared on entry. Once any directive fires, no
    /// further expressions evaluate: an explicit `return` value replaces the
    /// joined output, everything else joins and stops.
    pub(crate) fn eval_code_exprs<'a>(
        &mut self,
        exprs: &mut dyn Iterator<Item = ast::Expr<'a>>,
    ) -> EvalResult<Value> {
        self.flow = None;
        let mut output = Value::None;
        while let Some(expr) = exprs.next() {
            let span = expr.span();
            match expr {
                ast::Expr::Set(set) => self.eval_set_rule(set)?,
                ast::Expr::Show(show) => match self.eval_show_header(show)? {
                    ShowBinding::Rule(rule) => {
                        trace!("registering show rule");
                        self.show_rules.push(rule);
                    }
                    ShowBinding::Everything(body) => {
                        let tail = self.eval_code_exprs(&mut *exprs)?;
                        let transformed = self.show_everything(body, tail)?;
                        output = ops::join(output, transformed)
                            .map_err(|e| e.or_span(span))?;
                        break;
                    }
                },
                _ => {
                    let value = self.eval_expr(expr)?;
                    match &self.flow {
                        None => {
                            output = ops::join(output, value)
                                .map_err(|e| e.or_span(span))?;
                        }
                        Some(FlowEvent::Return(Some(v))) => return Ok(v.clone()),
                        Some(_) => {
                            output = ops::join(output, value)
                                .map_err(|e| e.or_span(span))?;
                            break;
                        }
                    }
                }
            }
        }
        Ok(output)
    }

    fn eval_content_block(&mut self, block: ast::ContentBlock) -> EvalResult<Value> {
        self.in_inner_content(|vm| {
            let nodes = vm.eval_markup_stream(block.body())?;
            Ok(Value::Content(nodes))
        })
    }

    /// Run nested content: fresh block frame, styles and show rules are
    /// restored on exit even when the body fails.
    pub(crate) fn in_inner_content<T>(
        &mut self,
        body: impl FnOnce(&mut Vm) -> EvalResult<T>,
    ) -> EvalResult<T> {
        self.scopes.enter(ScopeKind::Block);
        let saved_styles = self.styles.clone();
        let saved_rules = self.show_rules.clone();
        let result = body(self);
        self.show_rules = saved_rules;
        self.styles = saved_styles;
        self.scopes.exit();
        result
    }

    // ========================================================================
    // Operators
    // ========================================================================

    fn eval_unary(&mut self, unary: ast::Unary) -> EvalResult<Value> {
        let value = self.eval_expr(unary.expr())?;
        match unary.op() {
            ast::UnOp::Pos => ops::pos(value),
            ast::UnOp::Neg => ops::neg(value),
            ast::UnOp::Not => ops::not(&value),
        }
    }

    fn eval_binary(&mut self, binary: ast::Binary) -> EvalResult<Value> {
        use ast::BinOp;
        match binary.op() {
            BinOp::Assign => return self.eval_assign(binary, |_, b| Ok(b)),
            BinOp::AddAssign => return self.eval_assign(binary, ops::add),
            BinOp::SubAssign => return self.eval_assign(binary, ops::sub),
            BinOp::MulAssign => return self.eval_assign(binary, ops::mul),
            BinOp::DivAssign => return self.eval_assign(binary, ops::div),
            // Short-circuiting; the second operand is only typechecked when
            // it is reached.
            BinOp::And => {
                if !self.eval_expr(binary.lhs())?.as_bool()? {
                    return Ok(Value::Bool(false));
                }
                return Ok(Value::Bool(self.eval_expr(binary.rhs())?.as_bool()?));
            }
            BinOp::Or => {
                if self.eval_expr(binary.lhs())?.as_bool()? {
                    return Ok(Value::Bool(true));
                }
                return Ok(Value::Bool(self.eval_expr(binary.rhs())?.as_bool()?));
            }
            _ => {}
        }

        let lhs = self.eval_expr(binary.lhs())?;
        let rhs = self.eval_expr(binary.rhs())?;
        match binary.op() {
            BinOp::Add => ops::add(lhs, rhs),
            BinOp::Sub => ops::sub(lhs, rhs),
            BinOp::Mul => ops::mul(lhs, rhs),
            BinOp::Div => ops::div(lhs, rhs),
            BinOp::Eq => Ok(Value::Bool(lhs == rhs)),
            BinOp::Neq => Ok(Value::Bool(lhs != rhs)),
            BinOp::Lt => ops::lt(&lhs, &rhs).map(Value::Bool),
            BinOp::Leq => ops::le(&lhs, &rhs).map(Value::Bool),
            BinOp::Gt => ops::gt(&lhs, &rhs).map(Value::Bool),
            BinOp::Geq => ops::ge(&lhs, &rhs).map(Value::Bool),
            BinOp::In => ops::contains(&lhs, &rhs).map(Value::Bool),
            BinOp::NotIn => ops::contains(&lhs, &rhs).map(|b| Value::Bool(!b)),
            _ => unreachable!("assignment and logic handled above"),
        }
    }

    fn eval_assign(
        &mut self,
        binary: ast::Binary,
        op: fn(Value, Value) -> EvalResult<Value>,
    ) -> EvalResult<Value> {
        let rhs = self.eval_expr(binary.rhs())?;
        let slot = self.access(binary.lhs())?;
        let lhs = std::mem::take(slot);
        *slot = op(lhs, rhs)?;
        Ok(Value::None)
    }

    // ========================================================================
    // Lvalues
    // ========================================================================

    /// Resolve an expression to a mutable slot.
    ///
    /// Accepted shapes: an identifier, a parenthesized lvalue, a dictionary
    /// field, and the positional accessors `at`, `first` and `last`.
    pub(crate) fn access(&mut self, expr: ast::Expr) -> EvalResult<&mut Value> {
        let span = expr.span();
        match expr {
            ast::Expr::Ident(ident) => self
                .scopes
                .get_mut(ident.get().as_str())
                .map_err(|e| e.or_span(span)),
            ast::Expr::Parenthesized(paren) => self.access(paren.expr()),
            ast::Expr::FieldAccess(access) => {
                let field = access.field().get().to_string();
                let target = self.access(access.target())?;
                match target {
                    Value::Dict(map) => Ok(map.entry(field).or_insert(Value::None)),
                    v => Err(EvalError::type_mismatch("dictionary", v.type_name())
                        .or_span(span)),
                }
            }
            ast::Expr::FuncCall(call) => {
                let ast::Expr::FieldAccess(access) = call.callee() else {
                    return Err(EvalError::invalid_op("cannot mutate a temporary value")
                        .or_span(span));
                };
                let method = access.field().get().to_string();
                let mut args = self.eval_args(call.args())?;
                match method.as_str() {
                    "at" => {
                        let key = args.expect_front("index or key")?;
                        let target = self.access(access.target())?;
                        slot_at(target, key)
                    }
                    "first" => {
                        let target = self.access(access.target())?;
                        slot_at(target, Value::Int(0))
                    }
                    "last" => {
                        let target = self.access(access.target())?;
                        slot_at(target, Value::Int(-1))
                    }
                    other => Err(EvalError::invalid_op(format!(
                        "cannot mutate through method {other}"
                    ))
                    .or_span(span)),
                }
            }
            other => {
                let _ = self.eval_expr(other)?;
                Err(EvalError::invalid_op("cannot mutate a temporary value").or_span(span))
            }
        }
    }

    // ========================================================================
    // Bindings and destructuring
    // ========================================================================

    fn eval_let(&mut self, binding: ast::LetBinding) -> EvalResult<Value> {
        let value = match binding.init() {
            Some(expr) => self.eval_expr(expr)?,
            None => Value::None,
        };
        match binding.kind() {
            ast::LetBindingKind::Normal(pattern) => {
                self.destructure(pattern, value, BindMode::Define)?;
            }
            ast::LetBindingKind::Closure(ident) => {
                // `let f(x) = …`: the initializer is the closure expression,
                // which already carries the name for self-recursion.
                self.scopes.define(ident.get().to_string(), value);
            }
        }
        Ok(Value::None)
    }

    fn eval_destruct_assign(&mut self, assign: ast::DestructAssignment) -> EvalResult<Value> {
        let value = self.eval_expr(assign.value())?;
        self.destructure(assign.pattern(), value, BindMode::Assign)?;
        Ok(Value::None)
    }

    pub(crate) fn destructure(
        &mut self,
        pattern: ast::Pattern,
        value: Value,
        mode: BindMode,
    ) -> EvalResult<()> {
        match pattern {
            ast::Pattern::Normal(expr) => self.bind_target(expr, value, mode),
            ast::Pattern::Placeholder(_) => Ok(()),
            ast::Pattern::Parenthesized(paren) => {
                self.destructure(paren.pattern(), value, mode)
            }
            ast::Pattern::Destructuring(destruct) => match value {
                Value::Array(items) => self.destructure_array(destruct, items, mode),
                Value::Dict(map) => self.destructure_dict(destruct, map, mode),
                v => Err(EvalError::invalid_op(format!(
                    "cannot destructure {}",
                    v.type_name()
                ))),
            },
        }
    }

    fn bind_target(
        &mut self,
        expr: ast::Expr,
        value: Value,
        mode: BindMode,
    ) -> EvalResult<()> {
        match mode {
            BindMode::Define => match expr {
                ast::Expr::Ident(ident) => {
                    self.scopes.define(ident.get().to_string(), value);
                    Ok(())
                }
                other => Err(EvalError::invalid_op(format!(
                    "cannot bind to {}",
                    other.to_untyped().kind().name()
                ))),
            },
            BindMode::Assign => {
                *self.access(expr)? = value;
                Ok(())
            }
        }
    }

    fn destructure_array(
        &mut self,
        destruct: ast::Destructuring,
        items: Vec<Value>,
        mode: BindMode,
    ) -> EvalResult<()> {
        let parts: Vec<ast::DestructuringItem> = destruct.items().collect();
        let sink = parts
            .iter()
            .position(|p| matches!(p, ast::DestructuringItem::Spread(_)));

        let (left, right) = match sink {
            Some(s) => (&parts[..s], &parts[s + 1..]),
            None => (&parts[..], &parts[..0]),
        };
        let needed = left.len() + right.len();
        if items.len() < needed || (sink.is_none() && items.len() != needed) {
            return Err(EvalError::argument(format!(
                "cannot destructure array of length {} with {} patterns",
                items.len(),
                needed,
            )));
        }

        let mut items = items;
        let tail: Vec<Value> = items.split_off(items.len() - right.len());
        let middle: Vec<Value> = items.split_off(left.len());

        for (part, value) in left.iter().zip(items) {
            self.destructure_part(part, value, mode)?;
        }
        if let Some(s) = sink {
            if let ast::DestructuringItem::Spread(spread) = &parts[s] {
                if let Some(ast::Expr::Ident(ident)) = spread.sink_expr() {
                    self.bind_sink(ident, Value::Array(middle), mode)?;
                }
            }
        }
        for (part, value) in right.iter().zip(tail) {
            self.destructure_part(part, value, mode)?;
        }
        Ok(())
    }

    fn destructure_part(
        &mut self,
        part: &ast::DestructuringItem,
        value: Value,
        mode: BindMode,
    ) -> EvalResult<()> {
        match part {
            ast::DestructuringItem::Pattern(pattern) => {
                self.destructure(*pattern, value, mode)
            }
            ast::DestructuringItem::Named(_) => Err(EvalError::argument(
                "cannot destructure a named pattern from an array",
            )),
            ast::DestructuringItem::Spread(_) => unreachable!("sink handled by caller"),
        }
    }

    fn destructure_dict(
        &mut self,
        destruct: ast::Destructuring,
        map: indexmap::IndexMap<String, Value>,
        mode: BindMode,
    ) -> EvalResult<()> {
        let mut taken: Vec<String> = Vec::new();
        let mut sink: Option<ast::Ident> = None;
        for part in destruct.items() {
            match part {
                ast::DestructuringItem::Pattern(ast::Pattern::Normal(
                    ast::Expr::Ident(ident),
                )) => {
                    let key = ident.get().as_str();
                    let value = map.get(key).cloned().ok_or_else(|| {
                        EvalError::argument(format!("dictionary does not contain {key}"))
                    })?;
                    taken.push(key.to_string());
                    self.bind_target(ast::Expr::Ident(ident), value, mode)?;
                }
                ast::DestructuringItem::Named(named) => {
                    let key = named.name().get().to_string();
                    let value = map.get(&key).cloned().ok_or_else(|| {
                        EvalError::argument(format!("dictionary does not contain {key}"))
                    })?;
                    taken.push(key);
                    self.destructure(named.pattern(), value, mode)?;
                }
                ast::DestructuringItem::Spread(spread) => {
                    if let Some(ast::Expr::Ident(ident)) = spread.sink_expr() {
                        sink = Some(ident);
                    }
                }
                ast::DestructuringItem::Pattern(_) => {
                    return Err(EvalError::argument(
                        "cannot destructure a dictionary without keys",
                    ))
                }
            }
        }
        if let Some(ident) = sink {
            let rest: indexmap::IndexMap<String, Value> = map
                .into_iter()
                .filter(|(k, _)| !taken.contains(k))
                .collect();
            self.bind_sink(ident, Value::Dict(rest), mode)?;
        }
        Ok(())
    }

    fn bind_sink(
        &mut self,
        ident: ast::Ident,
        value: Value,
        mode: BindMode,
    ) -> EvalResult<()> {
        self.bind_target(ast::Expr::Ident(ident), value, mode)
    }

    // ========================================================================
    // Control flow
    // ========================================================================

    fn eval_conditional(&mut self, cond: ast::Conditional) -> EvalResult<Value> {
        if self.eval_expr(cond.condition())?.as_bool()? {
            self.eval_expr(cond.if_body())
        } else if let Some(else_body) = cond.else_body() {
            self.eval_expr(else_body)
        } else {
            Ok(Value::None)
        }
    }

    fn eval_while(&mut self, w: ast::WhileLoop) -> EvalResult<Value> {
        self.flow = None;
        let mut output = Value::None;
        let mut iterations = 0usize;
        loop {
            if iterations >= self.config.max_iterations {
                return Err(EvalError::new(crate::diag::EvalErrorKind::TooManyIterations));
            }
            if !self.eval_expr(w.condition())?.as_bool()? {
                break;
            }
            let value = self.eval_expr(w.body())?;
            output = ops::join(output, value)?;
            match &self.flow {
                Some(FlowEvent::Break) => {
                    self.flow = None;
                    break;
                }
                Some(FlowEvent::Continue) => self.flow = None,
                Some(FlowEvent::Return(_)) => break,
                None => {}
            }
            iterations += 1;
        }
        Ok(output)
    }

    fn eval_for(&mut self, f: ast::ForLoop) -> EvalResult<Value> {
        self.flow = None;
        let iterable = self.eval_expr(f.iterable())?;
        let items: Vec<Value> = match iterable {
            Value::Array(items) => items,
            Value::Dict(map) => map
                .into_iter()
                .map(|(k, v)| Value::Array(vec![Value::Str(k), v]))
                .collect(),
            Value::Str(s) => s.chars().map(|c| Value::Str(c.to_string())).collect(),
            v => {
                return Err(EvalError::invalid_op(format!(
                    "cannot loop over {}",
                    v.type_name()
                )))
            }
        };

        let mut output = Value::None;
        self.scopes.enter(ScopeKind::Block);
        let result = (|| -> EvalResult<()> {
            for item in items {
                self.destructure(f.pattern(), item, BindMode::Define)?;
                let value = self.eval_expr(f.body())?;
                output = ops::join(std::mem::take(&mut output), value)?;
                match &self.flow {
                    Some(FlowEvent::Break) => {
                        self.flow = None;
                        break;
                    }
                    Some(FlowEvent::Continue) => self.flow = None,
                    Some(FlowEvent::Return(_)) => break,
                    None => {}
                }
            }
            Ok(())
        })();
        self.scopes.exit();
        result?;
        Ok(output)
    }

    // ========================================================================
    // Field access and calls
    // ========================================================================

    fn eval_field_access(&mut self, access: ast::FieldAccess) -> EvalResult<Value> {
        let target = self.eval_expr(access.target())?;
        self.field_of(target, access.field().get().as_str())
    }

    /// Resolve a field on a value: methods first, then kind-specific lookup.
    pub(crate) fn field_of(&mut self, target: Value, field: &str) -> EvalResult<Value> {
        if let Some(method) = methods::bound(&target, field) {
            return Ok(method);
        }
        match target {
            Value::Symbol(sym) => sym.modify(field).map(Value::Symbol),
            Value::Module(name, map) => map.get(field).cloned().ok_or_else(|| {
                EvalError::undefined(format!("{name}.{field}"))
            }),
            Value::Func(func) => func.scope.get(field).cloned().ok_or_else(|| {
                EvalError::undefined(format!("{}.{}", func.name.as_deref().unwrap_or("function"), field))
            }),
            Value::Dict(map) => map
                .get(field)
                .cloned()
                .ok_or_else(|| EvalError::domain(format!("key not found: {field}"))),
            v => Err(EvalError::invalid_op(format!(
                "cannot access field {} on {}",
                field,
                v.type_name()
            ))),
        }
    }

    fn eval_func_call(&mut self, call: ast::FuncCall) -> EvalResult<Value> {
        if let ast::Expr::FieldAccess(access) = call.callee() {
            return self.eval_method_call(access, call.args());
        }
        let callee = match call.callee() {
            // An unknown identifier in math call position renders literally.
            ast::Expr::MathIdent(ident) if self.math => {
                match self.scopes.get(ident.get().as_str()) {
                    Some(value) => value.clone(),
                    None => Value::Content(vec![crate::content::ContentNode::text(
                        ident.get().to_string(),
                    )]),
                }
            }
            other => self.eval_expr(other)?,
        };
        let args = self.eval_args(call.args())?;
        self.call_value(callee, args)
    }

    fn eval_method_call(
        &mut self,
        access: ast::FieldAccess,
        args: ast::Args,
    ) -> EvalResult<Value> {
        let method = access.field().get().to_string();

        // Mutating methods evaluate their receiver through the lvalue
        // protocol and write the updated container back.
        if methods::is_mutating(&method) {
            let args = self.eval_args(args)?;
            let target = self.access(access.target())?;
            return methods::call_mut(target, &method, args);
        }

        let target = self.eval_expr(access.target())?;
        let args = self.eval_args(args)?;
        if methods::is_method(&target, &method) {
            return methods::call(self, target, &method, args);
        }

        // Not a method: a function reached through a field (module entry,
        // dictionary entry, function scope).
        let callee = self.field_of(target, &method)?;
        self.call_value(callee, args)
    }

    /// Call a value with already-evaluated arguments, applying the math-mode
    /// fallbacks.
    pub(crate) fn call_value(&mut self, callee: Value, args: Args) -> EvalResult<Value> {
        match callee {
            Value::Func(func) => self.apply(func, args),
            Value::Symbol(sym) if self.math && sym.accent => {
                let accent = self.scopes.get_or_err("accent")?.clone().into_func()?;
                let mut args = args;
                args.push(Value::Symbol(sym));
                self.call_func(&accent, args)
            }
            other if self.math => {
                // A non-function in math call position renders literally:
                // name(arg, arg).
                let mut nodes = other.into_content();
                nodes.push(crate::content::ContentNode::text("("));
                for (i, arg) in args.pos.into_iter().enumerate() {
                    if i > 0 {
                        nodes.push(crate::content::ContentNode::text(", "));
                    }
                    nodes.extend(arg.into_content());
                }
                nodes.push(crate::content::ContentNode::text(")"));
                Ok(Value::Content(crate::content::merge_text(nodes)))
            }
            other => Err(EvalError::type_mismatch("function", other.type_name())),
        }
    }

    /// Call a function, overlaying `set` defaults when it constructs an
    /// element.
    pub(crate) fn apply(&mut self, func: Func, args: Args) -> EvalResult<Value> {
        let args = match &func.elem {
            Some(elem) => self.styles.apply(elem, args),
            None => args,
        };
        self.call_func(&func, args)
    }

    /// Call a function value. The flow directive is reset for the duration
    /// of the call.
    pub fn call_func(&mut self, func: &Func, args: Args) -> EvalResult<Value> {
        if self.depth >= self.config.max_recursion_depth {
            return Err(EvalError::new(crate::diag::EvalErrorKind::TooDeep(
                self.config.max_recursion_depth,
            )));
        }
        self.depth += 1;
        let saved_flow = self.flow.take();
        let result = match &func.repr {
            FuncRepr::Native(native) => (native.body)(self, args),
            FuncRepr::With(inner, stored) => {
                self.call_func(inner, stored.clone().chain(args))
            }
            FuncRepr::Closure(closure) => self.call_closure(closure.clone(), args),
        };
        self.flow = saved_flow;
        self.depth -= 1;
        result
    }

    fn call_closure(&mut self, closure: Arc<Closure>, mut args: Args) -> EvalResult<Value> {
        let node = closure.node.clone();
        let Some(syntax) = node.cast::<ast::Closure>() else {
            return Err(EvalError::invalid_op("malformed closure"));
        };

        // The body runs inside the environment captured at definition time.
        let mut outside = closure.captured.clone();
        std::mem::swap(&mut self.scopes, &mut outside);
        self.scopes.enter(ScopeKind::Function);
        if let Some(name) = &closure.name {
            let recursive = Func::from_closure(Closure {
                name: closure.name.clone(),
                node: closure.node.clone(),
                captured: closure.captured.clone(),
            });
            self.scopes.define(name.clone(), Value::Func(recursive));
        }

        let result = self
            .bind_params(syntax.params(), &mut args)
            .and_then(|_| self.eval_expr(syntax.body()));

        std::mem::swap(&mut self.scopes, &mut outside);

        match self.flow.take() {
            Some(FlowEvent::Return(Some(value))) => result.map(|_| value),
            _ => result,
        }
    }

    /// Bind call arguments to closure parameters.
    ///
    /// With a sink, parameters left of it consume from the front and
    /// parameters right of it consume from the back, right-to-left; the sink
    /// collects the remainder. Leftover arguments without a sink are an
    /// error, as are unknown named arguments.
    fn bind_params(&mut self, params: ast::Params, args: &mut Args) -> EvalResult<()> {
        let list: Vec<ast::Param> = params.children().collect();
        let sink = list
            .iter()
            .position(|p| matches!(p, ast::Param::Spread(_)));

        let (left, right) = match sink {
            Some(s) => (&list[..s], &list[s + 1..]),
            None => (&list[..], &list[..0]),
        };

        for param in left {
            self.bind_param(param, args, false)?;
        }
        for param in right.iter().rev() {
            self.bind_param(param, args, true)?;
        }
        if let Some(s) = sink {
            if let ast::Param::Spread(spread) = &list[s] {
                let rest = Args {
                    pos: std::mem::take(&mut args.pos),
                    named: std::mem::take(&mut args.named),
                };
                if let Some(ident) = spread.sink_ident() {
                    self.scopes.define(ident.get().to_string(), Value::Args(rest));
                }
            }
        }

        if let Some(extra) = args.pos.first() {
            return Err(EvalError::argument(format!(
                "unexpected argument: {}",
                extra.repr()
            )));
        }
        if let Some((name, _)) = args.named.first() {
            return Err(EvalError::argument(format!("unexpected argument: {name}")));
        }
        Ok(())
    }

    fn bind_param(
        &mut self,
        param: &ast::Param,
        args: &mut Args,
        from_back: bool,
    ) -> EvalResult<()> {
        match param {
            ast::Param::Pos(pattern) => match pattern {
                ast::Pattern::Placeholder(_) => Ok(()),
                pattern => {
                    let value = if from_back { args.take_back() } else { args.take_front() }
                        .ok_or_else(|| {
                            EvalError::argument(format!(
                                "missing argument: {}",
                                pattern.to_untyped().text()
                            ))
                        })?;
                    self.destructure(*pattern, value, BindMode::Define)
                }
            },
            ast::Param::Named(named) => {
                let name = named.name().get().to_string();
                let value = match args.take_named(&name) {
                    Some(value) => value,
                    None => self.eval_expr(named.expr())?,
                };
                self.scopes.define(name, value);
                Ok(())
            }
            ast::Param::Spread(_) => unreachable!("sink handled by caller"),
        }
    }

    fn eval_closure(&mut self, closure: ast::Closure) -> EvalResult<Value> {
        let name = closure.name().map(|ident| ident.get().to_string());
        let snapshot = self.scopes.clone();
        Ok(Value::Func(Func::from_closure(Closure {
            name,
            node: closure.to_untyped().clone(),
            captured: snapshot,
        })))
    }

    /// Evaluate call arguments, expanding spreads.
    pub(crate) fn eval_args(&mut self, args: ast::Args) -> EvalResult<Args> {
        let mut out = Args::new();
        for arg in args.items() {
            match arg {
                ast::Arg::Pos(expr) => out.push(self.eval_expr(expr)?),
                ast::Arg::Named(named) => {
                    let name = named.name().get().to_string();
                    out.insert(name, self.eval_expr(named.expr())?);
                }
                ast::Arg::Spread(spread) => match self.eval_expr(spread.expr())? {
                    Value::None => {}
                    Value::Array(items) => out.pos.extend(items),
                    Value::Dict(map) => {
                        for (k, v) in map {
                            out.insert(k, v);
                        }
                    }
                    Value::Args(inner) => {
                        out.pos.extend(inner.pos);
                        for (k, v) in inner.named {
                            out.insert(k, v);
                        }
                    }
                    v => {
                        return Err(EvalError::invalid_op(format!(
                            "cannot spread {} into arguments",
                            v.type_name()
                        )))
                    }
                },
            }
        }
        Ok(out)
    }

    // ========================================================================
    // Set and show
    // ========================================================================

    pub(crate) fn eval_set_rule(&mut self, set: ast::SetRule) -> EvalResult<()> {
        if let Some(condition) = set.condition() {
            if !self.eval_expr(condition)?.as_bool()? {
                return Ok(());
            }
        }
        let target = self.eval_expr(set.target())?.into_func()?;
        let elem = target.elem.clone().ok_or_else(|| {
            EvalError::invalid_op("only element functions can be used in set rules")
        })?;
        let args = self.eval_args(set.args())?;
        self.styles.set(&elem, args);
        Ok(())
    }

    /// Evaluate a show rule's selector and body.
    pub(crate) fn eval_show_header(&mut self, show: ast::ShowRule) -> EvalResult<ShowBinding> {
        let selector = show
            .selector()
            .map(|expr| {
                let value = self.eval_expr(expr)?;
                self.to_selector(value)
            })
            .transpose()?;

        // A `show …: set …` body keeps the matched content unchanged.
        if let ast::Expr::Set(_) = show.transform() {
            let selector = selector.ok_or_else(|| {
                EvalError::invalid_op("show-set without a selector has no effect")
            })?;
            return Ok(ShowBinding::Rule(ShowRule { selector, recipe: Recipe::Passthrough }));
        }

        self.scopes.enter(ScopeKind::Function);
        let body = self.eval_expr(show.transform());
        self.scopes.exit();
        let body = body?;

        Ok(match selector {
            Some(selector) => {
                let recipe = match body {
                    Value::Func(func) => Recipe::Transform(func),
                    other => Recipe::Replace(other.into_content()),
                };
                ShowBinding::Rule(ShowRule { selector, recipe })
            }
            None => ShowBinding::Everything(body),
        })
    }

    /// Apply a bare `show: body` to the already-evaluated remainder.
    pub(crate) fn show_everything(&mut self, body: Value, tail: Value) -> EvalResult<Value> {
        match body {
            Value::Func(func) => {
                let arg = Value::Content(tail.into_content());
                self.call_func(&func, Args::from_values(vec![arg]))
            }
            other => Ok(Value::Content(other.into_content())),
        }
    }

    /// Convert a value to a selector.
    pub(crate) fn to_selector(&self, value: Value) -> EvalResult<Selector> {
        match value {
            Value::Selector(sel) => Ok(sel),
            Value::Func(func) => func
                .elem
                .clone()
                .map(|name| Selector::Elem(name, Vec::new()))
                .ok_or_else(|| {
                    EvalError::domain("only element functions can be used as selectors")
                }),
            Value::Str(s) => Ok(Selector::Text(s)),
            Value::Regex(re) => Ok(Selector::Regex(re)),
            Value::Label(l) => Ok(Selector::Label(l)),
            Value::Symbol(sym) => Ok(Selector::Text(sym.text)),
            v => Err(EvalError::domain(format!(
                "cannot convert {} to a selector",
                v.type_name()
            ))),
        }
    }

    // ========================================================================
    // Imports
    // ========================================================================

    fn eval_import(&mut self, import: ast::ModuleImport) -> EvalResult<Value> {
        let source = self.eval_expr(import.source())?;
        let (name, exports) = match source {
            Value::Module(name, exports) => (name, exports),
            Value::Str(path) => self.load_module(&path)?,
            v => {
                return Err(EvalError::type_mismatch("path or module", v.type_name()))
            }
        };

        if let Some(new_name) = import.new_name() {
            self.scopes.define(
                new_name.get().to_string(),
                Value::Module(name.clone(), exports.clone()),
            );
            if import.imports().is_none() {
                return Ok(Value::None);
            }
        }

        match import.imports() {
            None => {
                self.scopes
                    .define(name.clone(), Value::Module(name.clone(), exports));
            }
            Some(ast::Imports::Wildcard) => {
                for (binding, value) in &exports {
                    self.scopes.define(binding.clone(), value.clone());
                }
            }
            Some(ast::Imports::Items(items)) => {
                for item in items.iter() {
                    let original = item.original_name().get().as_str();
                    let value = exports.get(original).cloned().ok_or_else(|| {
                        EvalError::undefined(format!("{name}.{original}"))
                    })?;
                    self.scopes.define(item.bound_name().get().to_string(), value);
                }
            }
        }
        Ok(Value::None)
    }

    fn eval_include(&mut self, include: ast::ModuleInclude) -> EvalResult<Value> {
        let source = self.eval_expr(include.source())?;
        let path = source.as_str()?.to_string();
        let (_, exports) = self.load_module(&path)?;
        for (binding, value) in exports {
            self.scopes.define(binding, value);
        }
        Ok(Value::None)
    }
}

/// A mutable slot inside an array or dictionary.
fn slot_at(target: &mut Value, key: Value) -> EvalResult<&mut Value> {
    match (target, key) {
        (Value::Array(items), Value::Int(index)) => {
            let len = items.len();
            let resolved = if index < 0 { index + len as i64 } else { index };
            if resolved < 0 || resolved as usize >= len {
                return Err(EvalError::domain(format!(
                    "index {index} out of bounds for length {len}"
                )));
            }
            Ok(&mut items[resolved as usize])
        }
        (Value::Dict(map), Value::Str(key)) => Ok(map.entry(key).or_insert(Value::None)),
        (target, key) => Err(EvalError::invalid_op(format!(
            "cannot index {} with {}",
            target.type_name(),
            key.type_name()
        ))),
    }
}
