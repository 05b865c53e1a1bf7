//! Text atoms and smart-quote rewriting.
//!
//! The content walker collects runs of text-like markup into [`TextAtom`]s,
//! rewrites straight quotes into their curly forms based on the surrounding
//! atoms, and flattens the run into a single string.

/// One text-like atom from the markup stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TextAtom {
    /// Plain text, escapes, shorthand characters.
    Text(String),
    /// Horizontal whitespace.
    Space,
    /// Whitespace containing a newline.
    SoftBreak,
    /// A straight quote; `double` distinguishes `"` from `'`.
    Quote { double: bool },
}

impl TextAtom {
    fn is_break(&self) -> bool {
        matches!(self, TextAtom::Space | TextAtom::SoftBreak)
    }

    /// The literal text of a non-quote atom.
    fn literal(&self) -> &str {
        match self {
            TextAtom::Text(t) => t,
            TextAtom::Space => " ",
            TextAtom::SoftBreak => "\n",
            TextAtom::Quote { .. } => unreachable!("quotes are rewritten first"),
        }
    }
}

/// Characters after which a double quote cannot open.
const NO_OPEN_BEFORE: &[char] = &[')', '.', ',', ';', ':', '?', '!', ']'];

/// Rewrite straight quotes to curly ones.
///
/// A quote right before whitespace or at the end of the run closes. A single
/// quote between two text atoms is an apostrophe. A quote right before text
/// that does not start with closing punctuation opens. Everything else
/// closes. The pass is idempotent since its output contains no quote atoms.
pub fn educate(atoms: Vec<TextAtom>) -> Vec<TextAtom> {
    let mut out: Vec<TextAtom> = Vec::with_capacity(atoms.len());
    for (i, atom) in atoms.iter().enumerate() {
        let TextAtom::Quote { double } = atom else {
            out.push(atom.clone());
            continue;
        };
        let prev = i.checked_sub(1).map(|p| &atoms[p]);
        let next = atoms.get(i + 1);
        let opening = match (prev, next) {
            // Closing before whitespace or at the end of the run.
            (_, Some(n)) if n.is_break() => false,
            (_, None) => false,
            // Apostrophe between words: it's, don't.
            (Some(TextAtom::Text(_)), Some(TextAtom::Text(_))) if !double => false,
            (_, Some(TextAtom::Text(t))) => {
                !t.chars().next().is_some_and(|c| NO_OPEN_BEFORE.contains(&c))
            }
            _ => false,
        };
        let ch = match (*double, opening) {
            (true, true) => '\u{201C}',
            (true, false) => '\u{201D}',
            (false, true) => '\u{2018}',
            (false, false) => '\u{2019}',
        };
        out.push(TextAtom::Text(ch.to_string()));
    }
    out
}

/// Flatten a quote-free run into its literal text.
pub fn flatten(atoms: &[TextAtom]) -> String {
    atoms.iter().map(|a| a.literal()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> TextAtom {
        TextAtom::Text(s.into())
    }

    fn dquote() -> TextAtom {
        TextAtom::Quote { double: true }
    }

    fn squote() -> TextAtom {
        TextAtom::Quote { double: false }
    }

    fn run(atoms: Vec<TextAtom>) -> String {
        flatten(&educate(atoms))
    }

    #[test]
    fn quoted_word_in_sentence() {
        let atoms = vec![
            text("He"),
            TextAtom::Space,
            text("said"),
            TextAtom::Space,
            dquote(),
            text("hi"),
            dquote(),
        ];
        assert_eq!(run(atoms), "He said \u{201C}hi\u{201D}");
    }

    #[test]
    fn apostrophe_between_words() {
        let atoms = vec![text("don"), squote(), text("t")];
        assert_eq!(run(atoms), "don\u{2019}t");
    }

    #[test]
    fn single_quotes_open_and_close() {
        let atoms = vec![squote(), text("x"), squote(), TextAtom::Space, text("y")];
        assert_eq!(run(atoms), "\u{2018}x\u{2019} y");
    }

    #[test]
    fn no_open_before_closing_punctuation() {
        let atoms = vec![text("a"), dquote(), text(").")];
        assert_eq!(run(atoms), "a\u{201D}).");
    }

    #[test]
    fn quote_before_newline_closes() {
        let atoms = vec![text("x"), dquote(), TextAtom::SoftBreak, text("y")];
        assert_eq!(run(atoms), "x\u{201D}\ny");
    }

    #[test]
    fn idempotent() {
        let atoms = vec![
            TextAtom::Space,
            dquote(),
            text("hi"),
            dquote(),
            TextAtom::Space,
        ];
        let once = educate(atoms);
        let twice = educate(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn shorthand_characters_pass_through() {
        let atoms = vec![text("a"), text("\u{2014}"), text("b")];
        assert_eq!(run(atoms), "a\u{2014}b");
    }
}
