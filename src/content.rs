//! The content tree produced by evaluation.

use indexmap::IndexMap;

use crate::value::Value;

/// An evaluated content sequence.
pub type Content = Vec<ContentNode>;

/// One node of evaluated content: plain text or an element.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentNode {
    Text(String),
    Elem(Element),
}

/// An element: a named node with ordered fields and an optional label.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub label: Option<String>,
    pub fields: IndexMap<String, Value>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), label: None, fields: IndexMap::new() }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

impl ContentNode {
    pub fn text(text: impl Into<String>) -> Self {
        ContentNode::Text(text.into())
    }

    pub fn elem(element: Element) -> Self {
        ContentNode::Elem(element)
    }

    /// The text this node contributes when flattened to a string.
    pub fn plain_text(&self) -> String {
        match self {
            ContentNode::Text(t) => t.clone(),
            ContentNode::Elem(elem) => {
                // Textual fields first, then nested content.
                if let Some(Value::Str(s)) = elem.field("text") {
                    return s.clone();
                }
                let mut out = String::new();
                for value in elem.fields.values() {
                    if let Value::Content(nodes) = value {
                        for node in nodes {
                            out.push_str(&node.plain_text());
                        }
                    }
                }
                out
            }
        }
    }
}

impl Value {
    /// Total coercion from a value to content.
    pub fn into_content(self) -> Content {
        match self {
            Value::Content(nodes) => nodes,
            Value::None | Value::Auto => Vec::new(),
            Value::Str(s) => vec![ContentNode::Text(s)],
            Value::Array(items) => {
                items.into_iter().flat_map(Value::into_content).collect()
            }
            Value::Args(args) => {
                args.pos.into_iter().flat_map(Value::into_content).collect()
            }
            other => vec![ContentNode::Text(other.display())],
        }
    }
}

/// Merge adjacent text nodes and drop empty ones. The result contains no
/// empty text node and no two neighbouring text nodes.
pub fn merge_text(nodes: Content) -> Content {
    let mut out: Content = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            ContentNode::Text(t) if t.is_empty() => {}
            ContentNode::Text(t) => match out.last_mut() {
                Some(ContentNode::Text(prev)) => prev.push_str(&t),
                _ => out.push(ContentNode::Text(t)),
            },
            elem => out.push(elem),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_drops_empty_and_joins_runs() {
        let nodes = vec![
            ContentNode::text(""),
            ContentNode::text("a"),
            ContentNode::text("b"),
            ContentNode::elem(Element::new("linebreak")),
            ContentNode::text(""),
            ContentNode::text("c"),
        ];
        let merged = merge_text(nodes);
        assert_eq!(
            merged,
            vec![
                ContentNode::text("ab"),
                ContentNode::elem(Element::new("linebreak")),
                ContentNode::text("c"),
            ]
        );
    }

    #[test]
    fn value_coercion_is_total() {
        assert_eq!(Value::None.into_content(), vec![]);
        assert_eq!(Value::Str("hi".into()).into_content(), vec![ContentNode::text("hi")]);
        assert_eq!(Value::Int(5).into_content(), vec![ContentNode::text("5")]);
        assert_eq!(Value::Fraction(2.0).into_content(), vec![ContentNode::text("2fr")]);
        assert_eq!(
            Value::Array(vec![Value::Int(1), Value::Str("x".into())]).into_content(),
            vec![ContentNode::text("1"), ContentNode::text("x")]
        );
    }

    #[test]
    fn plain_text_reads_nested_bodies() {
        let strong = Element::new("strong").with_field(
            "body",
            Value::Content(vec![ContentNode::text("hello")]),
        );
        assert_eq!(ContentNode::elem(strong).plain_text(), "hello");
    }
}
