//! Lexically scoped identifier frames.
//!
//! The evaluator keeps a non-empty stack of frames. Lookups walk inward-out;
//! assignment stops at the first frame that already holds the name. Function
//! frames are assignment barriers: a closure body may read captured bindings
//! but writing to a name that only exists outside the function fails.

use indexmap::IndexMap;

use crate::diag::{EvalError, EvalResult};
use crate::value::Value;

/// What kind of construct opened a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// A code or content block, a loop body, a module body.
    Block,
    /// A function call body. Assignment does not cross this boundary.
    Function,
}

/// A single frame of bindings. Insertion order is preserved so module
/// exports keep their source order.
#[derive(Debug, Clone)]
pub struct Scope {
    kind: ScopeKind,
    bindings: IndexMap<String, Value>,
}

impl Scope {
    pub fn new(kind: ScopeKind) -> Self {
        Self { kind, bindings: IndexMap::new() }
    }

    pub fn from_map(kind: ScopeKind, bindings: IndexMap<String, Value>) -> Self {
        Self { kind, bindings }
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn define(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn bindings(&self) -> &IndexMap<String, Value> {
        &self.bindings
    }

    pub fn into_bindings(self) -> IndexMap<String, Value> {
        self.bindings
    }
}

/// The frame stack.
#[derive(Debug, Clone)]
pub struct Scopes {
    stack: Vec<Scope>,
}

impl Scopes {
    /// A stack holding a single base frame with the given bindings.
    pub fn with_base(base: IndexMap<String, Value>) -> Self {
        Self { stack: vec![Scope::from_map(ScopeKind::Block, base)] }
    }

    /// Push a fresh frame.
    pub fn enter(&mut self, kind: ScopeKind) {
        self.stack.push(Scope::new(kind));
    }

    /// Pop the innermost frame. The base frame is never popped.
    pub fn exit(&mut self) -> Option<Scope> {
        if self.stack.len() > 1 {
            self.stack.pop()
        } else {
            None
        }
    }

    /// Bind a name in the innermost frame.
    pub fn define(&mut self, name: impl Into<String>, value: Value) {
        if let Some(scope) = self.stack.last_mut() {
            scope.define(name, value);
        }
    }

    /// Look a name up, innermost frame first.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.stack.iter().rev().find_map(|scope| scope.get(name))
    }

    pub fn get_or_err(&self, name: &str) -> EvalResult<&Value> {
        self.get(name).ok_or_else(|| EvalError::undefined(name))
    }

    /// Mutable access to an existing binding.
    ///
    /// Walks outward and stops at the first frame holding the name; crossing
    /// a function frame without a hit is an error, as is a name that does
    /// not exist at all.
    pub fn get_mut(&mut self, name: &str) -> EvalResult<&mut Value> {
        let mut found = None;
        for (i, scope) in self.stack.iter().enumerate().rev() {
            if scope.contains(name) {
                found = Some(i);
                break;
            }
            if scope.kind() == ScopeKind::Function {
                break;
            }
        }
        match found {
            Some(i) => Ok(self.stack[i].bindings.get_mut(name).unwrap()),
            None => Err(EvalError::undefined(name)),
        }
    }

    /// Replace an existing binding.
    pub fn assign(&mut self, name: &str, value: Value) -> EvalResult<()> {
        *self.get_mut(name)? = value;
        Ok(())
    }

    /// The innermost frame.
    pub fn top(&self) -> &Scope {
        self.stack.last().expect("scope stack is never empty")
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Flattened view of every visible binding, inner frames shadowing outer
    /// ones. Used for field access on function values.
    pub fn flatten(&self) -> IndexMap<String, Value> {
        let mut all = IndexMap::new();
        for scope in &self.stack {
            for (name, value) in scope.bindings() {
                all.insert(name.clone(), value.clone());
            }
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty() -> Scopes {
        Scopes::with_base(IndexMap::new())
    }

    #[test]
    fn define_and_lookup() {
        let mut scopes = empty();
        scopes.define("x", Value::Int(42));
        assert_eq!(scopes.get("x"), Some(&Value::Int(42)));
        assert_eq!(scopes.get("y"), None);
    }

    #[test]
    fn shadowing_restores_on_exit() {
        let mut scopes = empty();
        scopes.define("x", Value::Int(1));
        scopes.enter(ScopeKind::Block);
        scopes.define("x", Value::Int(2));
        assert_eq!(scopes.get("x"), Some(&Value::Int(2)));
        scopes.exit();
        assert_eq!(scopes.get("x"), Some(&Value::Int(1)));
    }

    #[test]
    fn assign_updates_defining_frame() {
        let mut scopes = empty();
        scopes.define("x", Value::Int(1));
        scopes.enter(ScopeKind::Block);
        scopes.assign("x", Value::Int(5)).unwrap();
        scopes.exit();
        assert_eq!(scopes.get("x"), Some(&Value::Int(5)));
    }

    #[test]
    fn assignment_stops_at_function_boundary() {
        let mut scopes = empty();
        scopes.define("outer", Value::Int(1));
        scopes.enter(ScopeKind::Function);
        assert!(scopes.assign("outer", Value::Int(2)).is_err());
        // Names inside the function frame are still writable.
        scopes.define("inner", Value::Int(3));
        assert!(scopes.assign("inner", Value::Int(4)).is_ok());
        scopes.exit();
        assert_eq!(scopes.get("outer"), Some(&Value::Int(1)));
    }

    #[test]
    fn reads_cross_function_boundary() {
        let mut scopes = empty();
        scopes.define("outer", Value::Int(1));
        scopes.enter(ScopeKind::Function);
        assert_eq!(scopes.get("outer"), Some(&Value::Int(1)));
    }

    #[test]
    fn flatten_prefers_inner() {
        let mut scopes = empty();
        scopes.define("a", Value::Int(1));
        scopes.enter(ScopeKind::Block);
        scopes.define("a", Value::Int(10));
        scopes.define("b", Value::Int(2));
        let flat = scopes.flatten();
        assert_eq!(flat.get("a"), Some(&Value::Int(10)));
        assert_eq!(flat.get("b"), Some(&Value::Int(2)));
    }
}
