//! typeval: a tree-walking evaluator for a Typst dialect.
//!
//! The crate consumes the syntax tree produced by [`typst_syntax`] and
//! reduces it to a flat sequence of [`ContentNode`]s: plain text and named
//! elements with ordered fields. Scripting (`#let`, `#for`, closures,
//! methods), `set`-rule style defaults, `show`-rule rewriting, module
//! imports and a sandboxed `eval` are all handled; layout and rendering are
//! someone else's job.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use typeval::{evaluate_source, MemoryWorld};
//!
//! let world = Arc::new(MemoryWorld::new());
//! let content = evaluate_source(world, "main.typ", "#(2 + 3)").unwrap();
//! assert_eq!(content[0], typeval::ContentNode::Text("5".into()));
//! ```
//!
//! File access and the clock go through the [`World`] trait, so embedders
//! decide what an evaluation may see.

mod content;
mod diag;
mod library;
mod markup;
mod methods;
mod module;
mod ops;
mod quotes;
mod scope;
mod show;
mod styles;
mod value;
mod vm;
mod world;

use std::sync::Arc;

use typst_syntax::ast::{self};
use typst_syntax::SyntaxNode;

pub use content::{Content, ContentNode, Element};
pub use diag::{EvalError, EvalErrorKind, EvalResult, SourceSpan};
pub use scope::{Scope, ScopeKind, Scopes};
pub use show::{Recipe, Selector, ShowRule};
pub use value::{
    Alignment, Args, Closure, Color, DateTime, Func, HorizAlign, Length, LengthUnit,
    Symbol, ValType, Value, VertAlign, WrappedRegex,
};
pub use vm::{EvalConfig, Vm};
pub use world::{MemoryWorld, NoopWorld, SystemWorld, World};

/// Evaluate a parsed source file to a content sequence.
///
/// `root` is the output of the external parser ([`typst_syntax::parse`]);
/// parse errors recorded in the tree surface as [`EvalErrorKind::Parse`]
/// with their position. `path` names the source for error reporting and for
/// resolving relative imports.
pub fn evaluate(
    world: Arc<dyn World>,
    path: &str,
    root: &SyntaxNode,
) -> EvalResult<Content> {
    if let Some(error) = root.errors().first() {
        let mut err = EvalError::parse(error.message.to_string()).with_file(path);
        if let Some(span) = SourceSpan::from_syntax(error.span) {
            err = err.with_span(span);
        }
        return Err(err);
    }
    let markup = root
        .cast::<ast::Markup>()
        .ok_or_else(|| EvalError::parse("expected markup").with_file(path))?;

    let mut vm = Vm::new(world, path);
    let content = vm
        .eval_markup_stream(markup)
        .map_err(|e| e.with_file(path))?;
    if vm.flow.is_some() {
        return Err(EvalError::invalid_op(
            "break, continue and return are not allowed at the top level",
        )
        .with_file(path));
    }
    Ok(content)
}

/// Parse and evaluate raw source text.
pub fn evaluate_source(
    world: Arc<dyn World>,
    path: &str,
    text: &str,
) -> EvalResult<Content> {
    let root = typst_syntax::parse(text);
    evaluate(world, path, &root)
}
