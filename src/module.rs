//! Module loading and the sandboxed `eval` builtin.

use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;
use typst_syntax::ast::{self};
use typst_syntax::parse;

use crate::diag::{EvalError, EvalResult, SourceSpan};
use crate::scope::ScopeKind;
use crate::value::{Args, Value};
use crate::vm::Vm;
use crate::world::{resolve, NoopWorld};

impl Vm {
    /// Load and evaluate a module relative to the current source file.
    ///
    /// The module runs in a fresh evaluator that shares only the world; its
    /// top frame becomes the export map.
    pub(crate) fn load_module(
        &mut self,
        path: &str,
    ) -> EvalResult<(String, IndexMap<String, Value>)> {
        let full = resolve(&self.path, path);
        let name = Path::new(&full)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("module")
            .to_string();
        debug!(module = %full, "loading module");

        let bytes = self.world.read(&full)?;
        let text = String::from_utf8(bytes)
            .map_err(|_| EvalError::io(format!("{full} is not valid utf-8")))?;

        let root = parse(&text);
        if let Some(error) = root.errors().first() {
            let mut err = EvalError::parse(error.message.to_string()).with_file(&full);
            if let Some(span) = SourceSpan::from_syntax(error.span) {
                err = err.with_span(span);
            }
            return Err(err);
        }
        let markup = root
            .cast::<ast::Markup>()
            .ok_or_else(|| EvalError::parse("expected markup").with_file(&full))?;

        let mut sub = Vm::with_config(self.world.clone(), full.clone(), self.config.clone());
        sub.scopes.enter(ScopeKind::Block);
        sub.eval_markup_stream(markup)
            .map_err(|e| e.with_file(&full))?;
        let exports = sub.scopes.top().bindings().clone();
        Ok((name, exports))
    }
}

/// The `eval` builtin: evaluate a string of code in a sandbox without file
/// access. All failures carry an `eval:` prefix.
pub(crate) fn eval_str(mut args: Args) -> EvalResult<Value> {
    let source = args.expect_front("source")?;
    let source = source
        .as_str()
        .map_err(|e| e.prefixed("eval"))?;

    let wrapped = format!("#{{{source}}}");
    let root = parse(&wrapped);
    if let Some(error) = root.errors().first() {
        return Err(EvalError::parse(error.message.to_string()).prefixed("eval"));
    }
    let markup = root
        .cast::<ast::Markup>()
        .ok_or_else(|| EvalError::parse("expected markup").prefixed("eval"))?;

    let exprs: Vec<ast::Expr> = markup.exprs().collect();
    let &[expr] = exprs.as_slice() else {
        return Err(EvalError::parse("expected a single expression").prefixed("eval"));
    };

    let mut vm = Vm::new(Arc::new(NoopWorld), "<eval>");
    vm.eval_expr(expr).map_err(|e| e.prefixed("eval"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Args;

    fn eval_code(code: &str) -> EvalResult<Value> {
        eval_str(Args::from_values(vec![Value::Str(code.into())]))
    }

    #[test]
    fn eval_computes() {
        assert_eq!(eval_code("1 + 2").unwrap(), Value::Int(3));
        assert_eq!(
            eval_code("\"a\" + \"b\"").unwrap(),
            Value::Str("ab".into())
        );
    }

    #[test]
    fn eval_errors_are_prefixed() {
        let err = eval_code("nope").unwrap_err();
        assert!(err.to_string().starts_with("eval: "), "got: {err}");
    }

    #[test]
    fn eval_cannot_reach_the_file_system() {
        let err = eval_code("{ import \"secrets.typ\": x; x }").unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("eval: "), "got: {message}");
    }
}
