//! The content evaluator.
//!
//! Walks a markup stream with an explicit cursor, producing content nodes.
//! Each produced chunk runs through the show rules and then through the
//! adjacent-text collapse before it lands in the output sequence. The cursor
//! makes the greedy list groupings and the "rest of the document" consumption
//! of bare show rules straightforward.

use typst_syntax::ast::{self, AstNode};
use typst_syntax::SyntaxNode;

use crate::content::{merge_text, Content, ContentNode};
use crate::diag::{EvalError, EvalResult};
use crate::quotes::{educate, flatten, TextAtom};
use crate::show::apply_show_rules;
use crate::value::{Args, Value};
use crate::vm::{ShowBinding, Vm};

/// A cursor over the expressions of one markup stream.
pub(crate) struct Cursor<'a> {
    exprs: Vec<ast::Expr<'a>>,
    index: usize,
}

impl<'a> Cursor<'a> {
    fn new(exprs: Vec<ast::Expr<'a>>) -> Self {
        Self { exprs, index: 0 }
    }

    fn single(expr: ast::Expr<'a>) -> Self {
        Self::new(vec![expr])
    }

    fn peek(&self) -> Option<ast::Expr<'a>> {
        self.exprs.get(self.index).copied()
    }

    fn next(&mut self) -> Option<ast::Expr<'a>> {
        let expr = self.peek();
        if expr.is_some() {
            self.index += 1;
        }
        expr
    }

    fn save(&self) -> usize {
        self.index
    }

    fn restore(&mut self, index: usize) {
        self.index = index;
    }
}

impl Vm {
    /// Evaluate a whole markup production to content.
    pub(crate) fn eval_markup_stream(&mut self, markup: ast::Markup) -> EvalResult<Content> {
        let mut cursor = Cursor::new(markup.exprs().collect());
        self.eval_markup_cursor(&mut cursor)
    }

    /// Evaluate a single markup expression reached through code.
    pub(crate) fn eval_single_markup(&mut self, expr: ast::Expr) -> EvalResult<Value> {
        let mut cursor = Cursor::single(expr);
        let produced = self.produce(&mut cursor)?;
        let rewritten = apply_show_rules(self, produced)?;
        let collapsed = self.collapse(rewritten)?;
        Ok(Value::Content(collapsed))
    }

    fn eval_markup_cursor(&mut self, cursor: &mut Cursor) -> EvalResult<Content> {
        let mut seq: Content = Vec::new();
        while let Some(expr) = cursor.peek() {
            match expr {
                ast::Expr::Set(set) => {
                    cursor.next();
                    self.eval_set_rule(set)?;
                }
                ast::Expr::Show(show) => {
                    cursor.next();
                    match self.eval_show_header(show)? {
                        ShowBinding::Rule(rule) => self.show_rules.push(rule),
                        ShowBinding::Everything(body) => {
                            let rest = self.eval_markup_cursor(cursor)?;
                            let transformed =
                                self.show_everything(body, Value::Content(rest))?;
                            seq.extend(transformed.into_content());
                            break;
                        }
                    }
                }
                ast::Expr::Label(label) => {
                    cursor.next();
                    if let Some(ContentNode::Elem(elem)) = seq
                        .iter_mut()
                        .rev()
                        .find(|node| matches!(node, ContentNode::Elem(_)))
                    {
                        elem.label = Some(label.get().to_string());
                    }
                }
                _ => {
                    let produced = self.produce(cursor)?;
                    let rewritten = apply_show_rules(self, produced)?;
                    let collapsed = self.collapse(rewritten)?;
                    seq.extend(collapsed);
                }
            }
            if self.flow.is_some() {
                break;
            }
        }
        Ok(merge_text(seq))
    }

    /// One production step: a text run or a single element.
    fn produce(&mut self, cursor: &mut Cursor) -> EvalResult<Content> {
        let expr = cursor.peek().expect("produce called at end of stream");
        if text_atom(expr).is_some() {
            self.produce_text(cursor)
        } else {
            self.produce_element(cursor)
        }
    }

    /// Consume a run of text-like atoms and smart-quote it. In math mode
    /// exactly one atom is consumed.
    fn produce_text(&mut self, cursor: &mut Cursor) -> EvalResult<Content> {
        let mut atoms = Vec::new();
        while let Some(expr) = cursor.peek() {
            let Some(atom) = text_atom(expr) else { break };
            cursor.next();
            atoms.push(atom);
            if self.math {
                break;
            }
        }
        let text = flatten(&educate(atoms));
        Ok(vec![ContentNode::Text(text)])
    }

    /// Consume one non-text markup node.
    fn produce_element(&mut self, cursor: &mut Cursor) -> EvalResult<Content> {
        let expr = cursor.next().expect("produce_element called at end of stream");
        let span = expr.span();
        let result = match expr {
            ast::Expr::Parbreak(_) => self.construct("parbreak", Args::new()),
            ast::Expr::Linebreak(_) => self.construct("linebreak", Args::new()),

            ast::Expr::Strong(strong) => {
                let body = self.inner_content(strong.body())?;
                let mut args = Args::new();
                args.insert("body", Value::Content(body));
                self.construct("strong", args)
            }
            ast::Expr::Emph(emph) => {
                let body = self.inner_content(emph.body())?;
                let mut args = Args::new();
                args.insert("body", Value::Content(body));
                self.construct("emph", args)
            }
            ast::Expr::Raw(raw) => {
                let text: String = raw
                    .lines()
                    .map(|line| line.get().as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                let lang = match raw.lang() {
                    Some(lang) if !lang.get().is_empty() => {
                        Value::Str(lang.get().to_string())
                    }
                    _ => Value::None,
                };
                let mut args = Args::new();
                args.push(Value::Str(text));
                args.insert("block", Value::Bool(raw.block()));
                args.insert("lang", lang);
                self.construct("raw", args)
            }
            ast::Expr::Heading(heading) => {
                let body = self.inner_content(heading.body())?;
                let mut args = Args::new();
                args.insert("body", Value::Content(body));
                args.insert("level", Value::Int(heading.depth().get() as i64));
                self.construct("heading", args)
            }
            ast::Expr::Ref(reference) => {
                let supplement = match reference.supplement() {
                    Some(block) => {
                        Value::Content(self.inner_content(block.body())?)
                    }
                    None => Value::None,
                };
                let mut args = Args::new();
                args.insert("label", Value::Label(reference.target().to_string()));
                args.insert("supplement", supplement);
                self.construct("ref", args)
            }
            ast::Expr::Link(link) => {
                let url = link.get().to_string();
                let mut args = Args::new();
                args.insert("target", Value::Str(url.clone()));
                args.insert("body", Value::Content(vec![ContentNode::Text(url)]));
                self.construct("link", args)
            }

            ast::Expr::List(item) => {
                let mut items = vec![Value::Content(self.inner_content(item.body())?)];
                while let Some(next) = self.next_grouped(cursor, is_list_item) {
                    let ast::Expr::List(item) = next else { unreachable!() };
                    items.push(Value::Content(self.inner_content(item.body())?));
                }
                let mut args = Args::new();
                args.insert("items", Value::Array(items));
                self.construct("list", args)
            }
            ast::Expr::Enum(item) => {
                let start = item.number();
                let mut items = vec![Value::Content(self.inner_content(item.body())?)];
                while let Some(next) = self.next_grouped(cursor, is_enum_item) {
                    let ast::Expr::Enum(item) = next else { unreachable!() };
                    items.push(Value::Content(self.inner_content(item.body())?));
                }
                let mut args = Args::new();
                args.insert("items", Value::Array(items));
                if let Some(n) = start {
                    args.insert("start", Value::Int(n as i64));
                }
                self.construct("enum", args)
            }
            ast::Expr::Term(item) => {
                let mut items = vec![self.term_pair(item)?];
                while let Some(next) = self.next_grouped(cursor, is_term_item) {
                    let ast::Expr::Term(item) = next else { unreachable!() };
                    items.push(self.term_pair(item)?);
                }
                let mut args = Args::new();
                args.insert("items", Value::Array(items));
                self.construct("terms", args)
            }

            ast::Expr::Equation(equation) => {
                let body = self.in_inner_content(|vm| {
                    vm.import_math_modules()?;
                    let was_math = vm.math;
                    vm.math = true;
                    let result = vm.eval_math(equation.body());
                    vm.math = was_math;
                    result
                })?;
                let mut args = Args::new();
                args.insert("body", Value::Content(body));
                args.insert("block", Value::Bool(equation.block()));
                args.insert("numbering", Value::None);
                self.construct("equation", args)
            }
            ast::Expr::Math(math) => self.eval_math(math),
            ast::Expr::MathIdent(ident) => {
                let value = self.scopes.get_or_err(ident.get().as_str()).cloned()?;
                Ok(value.into_content())
            }
            ast::Expr::MathShorthand(shorthand) => {
                Ok(vec![ContentNode::text(shorthand.get().to_string())])
            }
            ast::Expr::MathAlignPoint(_) => self.construct("alignpoint", Args::new()),
            ast::Expr::MathDelimited(delimited) => {
                let open = node_text(delimited.open().to_untyped());
                let close = node_text(delimited.close().to_untyped());
                let inner = self.eval_math(delimited.body())?;
                let mut body = vec![ContentNode::Text(open)];
                body.extend(inner);
                body.push(ContentNode::Text(close));
                let mut args = Args::new();
                args.insert("body", Value::Content(merge_text(body)));
                self.construct("lr", args)
            }
            ast::Expr::MathAttach(attach) => {
                let base = self.eval_math_expr(attach.base())?;
                let bottom = match attach.bottom() {
                    Some(expr) => Value::Content(self.eval_math_expr(expr)?),
                    None => Value::None,
                };
                let top = match attach.top() {
                    Some(expr) => Value::Content(self.eval_math_expr(expr)?),
                    None => Value::None,
                };
                let mut args = Args::new();
                args.insert("base", Value::Content(base));
                args.insert("b", bottom);
                args.insert("t", top);
                self.construct("attach", args)
            }
            ast::Expr::MathFrac(frac) => {
                let num = self.math_operand(frac.num())?;
                let denom = self.math_operand(frac.denom())?;
                let mut args = Args::new();
                args.insert("num", Value::Content(num));
                args.insert("denom", Value::Content(denom));
                self.construct("frac", args)
            }

            // Embedded code evaluates to a value which coerces to content.
            expr if is_code_expr(&expr) => {
                let value = self.eval_expr(expr)?;
                Ok(value.into_content())
            }

            // Anything else is an exotic markup leaf; keep its source text.
            other => Ok(vec![ContentNode::Text(node_text(other.to_untyped()))]),
        };
        result.map_err(|e| e.or_span(span))
    }

    /// Greedily consume the next same-kind item, skipping the whitespace
    /// between items. The cursor is restored when the next node is not an
    /// item.
    fn next_grouped<'a>(
        &mut self,
        cursor: &mut Cursor<'a>,
        pred: fn(&ast::Expr) -> bool,
    ) -> Option<ast::Expr<'a>> {
        let save = cursor.save();
        while matches!(
            cursor.peek(),
            Some(ast::Expr::Space(_)) | Some(ast::Expr::Parbreak(_))
        ) {
            cursor.next();
        }
        match cursor.peek() {
            Some(expr) if pred(&expr) => cursor.next(),
            _ => {
                cursor.restore(save);
                None
            }
        }
    }

    fn term_pair(&mut self, item: ast::TermItem) -> EvalResult<Value> {
        let term = self.inner_content(item.term())?;
        let description = self.inner_content(item.description())?;
        Ok(Value::Array(vec![
            Value::Content(term),
            Value::Content(description),
        ]))
    }

    /// Evaluate nested markup with its own frame, styles and show rules.
    fn inner_content(&mut self, markup: ast::Markup) -> EvalResult<Content> {
        self.in_inner_content(|vm| vm.eval_markup_stream(markup))
    }

    // ========================================================================
    // Math mode
    // ========================================================================

    /// Merge the `math` and `sym` modules into the current frame.
    fn import_math_modules(&mut self) -> EvalResult<()> {
        for name in ["math", "sym"] {
            match self.scopes.get_or_err(name)?.clone() {
                Value::Module(_, exports) => {
                    for (binding, value) in exports {
                        self.scopes.define(binding, value);
                    }
                }
                v => {
                    return Err(EvalError::type_mismatch("module", v.type_name()))
                }
            }
        }
        Ok(())
    }

    /// Evaluate a math production to content.
    fn eval_math(&mut self, math: ast::Math) -> EvalResult<Content> {
        let mut cursor = Cursor::new(math.exprs().collect());
        self.eval_markup_cursor(&mut cursor)
    }

    /// Evaluate one math expression through the production pipeline.
    fn eval_math_expr(&mut self, expr: ast::Expr) -> EvalResult<Content> {
        let mut cursor = Cursor::single(expr);
        self.eval_markup_cursor(&mut cursor)
    }

    /// A fraction operand with one outer parenthesis group stripped.
    fn math_operand(&mut self, expr: ast::Expr) -> EvalResult<Content> {
        if let ast::Expr::MathDelimited(delimited) = expr {
            let open = node_text(delimited.open().to_untyped());
            let close = node_text(delimited.close().to_untyped());
            if open == "(" && close == ")" {
                return self.eval_math(delimited.body());
            }
        }
        self.eval_math_expr(expr)
    }

    // ========================================================================
    // Element construction and collapse
    // ========================================================================

    /// Resolve `name` in the environment and call it as an element or plain
    /// function.
    pub(crate) fn construct(&mut self, name: &str, args: Args) -> EvalResult<Content> {
        let value = self
            .scopes
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::undefined(name))?;
        match value {
            Value::Func(func) => Ok(self.apply(func, args)?.into_content()),
            v => Err(EvalError::invalid_op(format!(
                "{} is not a function (found {})",
                name,
                v.type_name()
            ))),
        }
    }

    /// Merge adjacent text and route every maximal text run through the
    /// `text` element constructor so set/show styling applies to it.
    pub(crate) fn collapse(&mut self, nodes: Content) -> EvalResult<Content> {
        let merged = merge_text(nodes);
        let mut out = Vec::with_capacity(merged.len());
        for node in merged {
            match node {
                ContentNode::Text(text) => {
                    let mut args = Args::new();
                    args.push(Value::Str(text));
                    out.extend(self.construct("text", args)?);
                }
                other => out.push(other),
            }
        }
        Ok(out)
    }
}

/// Classify one markup expression as a text-like atom.
fn text_atom(expr: ast::Expr) -> Option<TextAtom> {
    match expr {
        ast::Expr::Text(text) => Some(TextAtom::Text(text.get().to_string())),
        ast::Expr::Space(space) => {
            let raw = space.to_untyped().text();
            Some(if raw.contains('\n') { TextAtom::SoftBreak } else { TextAtom::Space })
        }
        ast::Expr::SmartQuote(quote) => Some(TextAtom::Quote { double: quote.double() }),
        ast::Expr::Shorthand(shorthand) => {
            Some(TextAtom::Text(shorthand.get().to_string()))
        }
        ast::Expr::Escape(escape) => Some(TextAtom::Text(escape.get().to_string())),
        _ => None,
    }
}

fn is_list_item(expr: &ast::Expr) -> bool {
    matches!(expr, ast::Expr::List(_))
}

fn is_enum_item(expr: &ast::Expr) -> bool {
    matches!(expr, ast::Expr::Enum(_))
}

fn is_term_item(expr: &ast::Expr) -> bool {
    matches!(expr, ast::Expr::Term(_))
}

/// Whether an expression belongs to the code grammar.
fn is_code_expr(expr: &ast::Expr) -> bool {
    matches!(
        expr,
        ast::Expr::Ident(_)
            | ast::Expr::None(_)
            | ast::Expr::Auto(_)
            | ast::Expr::Bool(_)
            | ast::Expr::Int(_)
            | ast::Expr::Float(_)
            | ast::Expr::Numeric(_)
            | ast::Expr::Str(_)
            | ast::Expr::Code(_)
            | ast::Expr::Content(_)
            | ast::Expr::Parenthesized(_)
            | ast::Expr::Array(_)
            | ast::Expr::Dict(_)
            | ast::Expr::Unary(_)
            | ast::Expr::Binary(_)
            | ast::Expr::FieldAccess(_)
            | ast::Expr::FuncCall(_)
            | ast::Expr::Closure(_)
            | ast::Expr::Let(_)
            | ast::Expr::DestructAssign(_)
            | ast::Expr::Conditional(_)
            | ast::Expr::While(_)
            | ast::Expr::For(_)
            | ast::Expr::Import(_)
            | ast::Expr::Include(_)
            | ast::Expr::Break(_)
            | ast::Expr::Continue(_)
            | ast::Expr::Return(_)
            | ast::Expr::Contextual(_)
    )
}

/// The concatenated source text of a node, including its children.
fn node_text(node: &SyntaxNode) -> String {
    if node.children().next().is_none() {
        node.text().to_string()
    } else {
        node.children().map(node_text).collect()
    }
}
