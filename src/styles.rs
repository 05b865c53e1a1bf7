//! Per-element default arguments contributed by `set` rules.

use indexmap::IndexMap;

use crate::value::Args;

/// The active `set` defaults, keyed by element name.
///
/// Cloned on block entry and restored on exit, so `set` is confined to its
/// enclosing block.
#[derive(Debug, Clone, Default)]
pub struct Styles {
    map: IndexMap<String, Args>,
}

impl Styles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge new defaults for an element. Existing defaults come first and
    /// the new arguments win on conflicting names.
    pub fn set(&mut self, elem: &str, args: Args) {
        let merged = match self.map.shift_remove(elem) {
            Some(existing) => existing.chain(args),
            None => args,
        };
        self.map.insert(elem.to_string(), merged);
    }

    /// Overlay the defaults for `elem` under the given call arguments.
    pub fn apply(&self, elem: &str, args: Args) -> Args {
        match self.map.get(elem) {
            Some(defaults) => defaults.clone().chain(args),
            None => args,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn call_args_override_defaults() {
        let mut styles = Styles::new();
        let mut defaults = Args::new();
        defaults.insert("level", Value::Int(1));
        defaults.insert("outlined", Value::Bool(true));
        styles.set("heading", defaults);

        let mut call = Args::new();
        call.insert("level", Value::Int(3));
        let merged = styles.apply("heading", call);
        assert_eq!(merged.named.get("level"), Some(&Value::Int(3)));
        assert_eq!(merged.named.get("outlined"), Some(&Value::Bool(true)));
    }

    #[test]
    fn repeated_set_accumulates() {
        let mut styles = Styles::new();
        let mut first = Args::new();
        first.insert("size", Value::Int(10));
        styles.set("text", first);
        let mut second = Args::new();
        second.insert("size", Value::Int(12));
        second.insert("fill", Value::Str("red".into()));
        styles.set("text", second);

        let merged = styles.apply("text", Args::new());
        assert_eq!(merged.named.get("size"), Some(&Value::Int(12)));
        assert_eq!(merged.named.get("fill"), Some(&Value::Str("red".into())));
    }

    #[test]
    fn unknown_element_passes_args_through() {
        let styles = Styles::new();
        let mut call = Args::new();
        call.push(Value::Int(1));
        let out = styles.apply("emph", call.clone());
        assert_eq!(out, call);
    }
}
