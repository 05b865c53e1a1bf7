//! Selectors and show rules.

use tracing::debug;

use crate::content::{Content, ContentNode};
use crate::diag::EvalResult;
use crate::value::{Args, Func, Value};
use crate::vm::Vm;

/// Describes a subset of content nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// An element name with field constraints.
    Elem(String, Vec<(String, Value)>),
    /// Text nodes containing the string.
    Text(String),
    /// Text nodes matching the regex.
    Regex(crate::value::WrappedRegex),
    /// Elements carrying the label.
    Label(String),
    Or(Box<Selector>, Box<Selector>),
    And(Box<Selector>, Box<Selector>),
    Before(Box<Selector>, Box<Selector>),
    After(Box<Selector>, Box<Selector>),
}

impl Selector {
    /// Node-local matching. `Before`/`After` need sequence context that only
    /// the downstream matcher has; they never match here.
    pub fn matches(&self, node: &ContentNode) -> bool {
        match self {
            Selector::Elem(name, constraints) => match node {
                ContentNode::Elem(elem) if elem.name == *name => constraints
                    .iter()
                    .all(|(field, expected)| elem.field(field) == Some(expected)),
                _ => false,
            },
            Selector::Text(needle) => {
                matches!(node, ContentNode::Text(t) if t.contains(needle.as_str()))
            }
            Selector::Regex(re) => {
                matches!(node, ContentNode::Text(t) if re.is_match(t))
            }
            Selector::Label(label) => {
                matches!(node, ContentNode::Elem(elem) if elem.label.as_deref() == Some(label.as_str()))
            }
            Selector::Or(a, b) => a.matches(node) || b.matches(node),
            Selector::And(a, b) => a.matches(node) && b.matches(node),
            Selector::Before(_, _) | Selector::After(_, _) => false,
        }
    }
}

/// What a matching show rule does with the node.
#[derive(Debug, Clone)]
pub enum Recipe {
    /// Call a function with the matched node as its argument.
    Transform(Func),
    /// Replace the matched node with fixed content.
    Replace(Content),
    /// Keep the node unchanged.
    ///
    /// Registered for `show … : set …` rules.
    /// TODO: apply the set-rule styles to the matched element's fields
    /// instead of passing it through.
    Passthrough,
}

/// A registered rewrite rule.
#[derive(Debug, Clone)]
pub struct ShowRule {
    pub selector: Selector,
    pub recipe: Recipe,
}

/// Rewrite a produced sequence with the active show rules.
///
/// Rules apply newest first. Each matching rule maps a node to a content
/// sequence which is spliced in place; the output of a rule is only seen by
/// rules older than it, so rules cannot loop on their own output.
pub fn apply_show_rules(vm: &mut Vm, nodes: Content) -> EvalResult<Content> {
    if vm.show_rules.is_empty() {
        return Ok(nodes);
    }
    let rules = vm.show_rules.clone();
    let mut current = nodes;
    for rule in rules.iter().rev() {
        let mut next: Content = Vec::with_capacity(current.len());
        for node in current {
            if !rule.selector.matches(&node) {
                next.push(node);
                continue;
            }
            debug!(selector = ?rule.selector, "show rule fired");
            match &rule.recipe {
                Recipe::Transform(func) => {
                    let arg = Value::Content(vec![node]);
                    let result =
                        vm.call_func(&func.clone(), Args::from_values(vec![arg]))?;
                    next.extend(result.into_content());
                }
                Recipe::Replace(content) => next.extend(content.iter().cloned()),
                Recipe::Passthrough => next.push(node),
            }
        }
        current = next;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Element;

    #[test]
    fn element_selector_with_constraints() {
        let sel = Selector::Elem("heading".into(), vec![("level".into(), Value::Int(1))]);
        let h1 = ContentNode::elem(Element::new("heading").with_field("level", Value::Int(1)));
        let h2 = ContentNode::elem(Element::new("heading").with_field("level", Value::Int(2)));
        assert!(sel.matches(&h1));
        assert!(!sel.matches(&h2));
    }

    #[test]
    fn text_selector_is_substring() {
        let sel = Selector::Text("cat".into());
        assert!(sel.matches(&ContentNode::text("concatenate")));
        assert!(!sel.matches(&ContentNode::text("dog")));
    }

    #[test]
    fn label_selector() {
        let sel = Selector::Label("intro".into());
        let mut elem = Element::new("heading");
        elem.label = Some("intro".into());
        assert!(sel.matches(&ContentNode::elem(elem)));
        assert!(!sel.matches(&ContentNode::elem(Element::new("heading"))));
    }

    #[test]
    fn combinators() {
        let cat = Selector::Text("cat".into());
        let dog = Selector::Text("dog".into());
        let either = Selector::Or(Box::new(cat.clone()), Box::new(dog.clone()));
        assert!(either.matches(&ContentNode::text("dog")));
        let both = Selector::And(Box::new(cat.clone()), Box::new(dog.clone()));
        assert!(!both.matches(&ContentNode::text("dog")));
        assert!(both.matches(&ContentNode::text("catdog")));
        let before = Selector::Before(Box::new(cat), Box::new(dog));
        assert!(!before.matches(&ContentNode::text("cat")));
    }
}
